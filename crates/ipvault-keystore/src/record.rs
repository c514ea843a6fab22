//! Row types for the `manifests` and `cryptoKeys` tables.

use ipvault_crypto::Manifest;
use serde::{Deserialize, Serialize};

/// A row of the `manifests` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRow {
    pub manifest: Manifest,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// A row of the `cryptoKeys` table. The key never appears in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRow {
    /// base64 of `[nonce][wrapped key + tag]`
    pub wrapped_key: String,
    /// base64 IV
    pub iv: String,
    pub algorithm: String,
    /// Epoch of the store key that wrapped this row
    pub epoch: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// Lifecycle view of one identifier, used by the purge passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMeta {
    pub id: String,
    pub created_at: u64,
    pub expires_at: Option<u64>,
}

impl RowMeta {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Merge the lifecycle of both rows for one identifier: oldest creation,
    /// earliest expiry.
    pub(crate) fn merge(
        id: &str,
        manifest: Option<&ManifestRow>,
        key: Option<&KeyRow>,
    ) -> Option<Self> {
        let created = [
            manifest.map(|m| m.created_at),
            key.map(|k| k.created_at),
        ];
        let created_at = created.into_iter().flatten().min()?;
        let expires_at = [
            manifest.and_then(|m| m.expires_at),
            key.and_then(|k| k.expires_at),
        ]
        .into_iter()
        .flatten()
        .min();
        Some(Self {
            id: id.to_string(),
            created_at,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_boundary() {
        let meta = RowMeta {
            id: "a".into(),
            created_at: 0,
            expires_at: Some(300_000),
        };
        assert!(!meta.is_expired(299_999));
        assert!(meta.is_expired(300_000));
    }

    #[test]
    fn test_no_expiry_never_expires() {
        let meta = RowMeta {
            id: "a".into(),
            created_at: 0,
            expires_at: None,
        };
        assert!(!meta.is_expired(u64::MAX));
    }
}
