//! Policy-gated manifest envelope
//!
//! The envelope is the public object stored on the blob store. Its address
//! is the `metadataCid` users share. It carries the access policy in the
//! clear and the bundle encrypted by the access-control service.

use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};
use crate::policy::AccessPolicy;

pub const ENVELOPE_VERSION: &str = "IPVAULT-ENCRYPTED-V1";

/// Output of the access-control service's `encrypt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBlob {
    /// base64 ciphertext
    pub ciphertext: String,
    /// SHA-256 of the plaintext payload (hex)
    pub data_to_encrypt_hash: String,
    /// Payload was age-sealed to the service's transport key before encryption
    #[serde(default)]
    pub sealed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEnvelope {
    pub version: String,
    pub access_control_conditions: AccessPolicy,
    pub encrypted_manifest: EncryptedBlob,
    /// Creation time, milliseconds since the Unix epoch
    pub created: u64,
}

impl ManifestEnvelope {
    pub fn new(policy: AccessPolicy, encrypted_manifest: EncryptedBlob, created: u64) -> Self {
        Self {
            version: ENVELOPE_VERSION.to_string(),
            access_control_conditions: policy,
            encrypted_manifest,
            created,
        }
    }

    pub fn to_json(&self) -> CryptoResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and check the version tag. The policy is validated by its own
    /// deserializer.
    pub fn from_json(data: &[u8]) -> CryptoResult<Self> {
        let envelope: Self = serde_json::from_slice(data)
            .map_err(|e| CryptoError::InvalidEnvelope(e.to_string()))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(CryptoError::InvalidEnvelope(format!(
                "unsupported version {:?}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AssetTarget;

    fn envelope() -> ManifestEnvelope {
        let target =
            AssetTarget::new("0x00000000000000000000000000000000000000c0", "ethereum", "1").unwrap();
        ManifestEnvelope::new(
            AccessPolicy::full_content(&target),
            EncryptedBlob {
                ciphertext: "AAAA".into(),
                data_to_encrypt_hash: "00".repeat(32),
                sealed: false,
            },
            1_700_000_000_000,
        )
    }

    #[test]
    fn test_envelope_roundtrip() {
        let env = envelope();
        let parsed = ManifestEnvelope::from_json(&env.to_json().unwrap()).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_envelope_field_names() {
        let json: serde_json::Value = serde_json::from_slice(&envelope().to_json().unwrap()).unwrap();
        assert_eq!(json["version"], ENVELOPE_VERSION);
        assert!(json["accessControlConditions"].is_array());
        assert_eq!(json["encryptedManifest"]["sealed"], false);
        assert_eq!(json["created"], 1_700_000_000_000u64);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut env = envelope();
        env.version = "SOMETHING-ELSE".into();
        let result = ManifestEnvelope::from_json(&env.to_json().unwrap());
        assert!(matches!(result, Err(CryptoError::InvalidEnvelope(_))));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let json = br#"{"version":"IPVAULT-ENCRYPTED-V1","accessControlConditions":[],
            "encryptedManifest":{"ciphertext":"","dataToEncryptHash":""},"created":0}"#;
        assert!(ManifestEnvelope::from_json(json).is_err());
    }
}
