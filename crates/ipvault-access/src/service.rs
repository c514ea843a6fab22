//! Access-control service interface.

use async_trait::async_trait;
use ipvault_core::Credential;
use ipvault_crypto::{AccessPolicy, EncryptedBlob, TransportRecipient};
use zeroize::Zeroizing;

use crate::error::AccessError;

/// Payload handed to [`AccessControlService::encrypt`].
pub enum KeyPayload {
    /// Serialized bundle in the clear.
    Plain(Zeroizing<Vec<u8>>),
    /// Serialized bundle already sealed to the service's transport recipient.
    Sealed(Vec<u8>),
}

impl KeyPayload {
    pub fn bytes(&self) -> &[u8] {
        match self {
            KeyPayload::Plain(b) => b.as_slice(),
            KeyPayload::Sealed(b) => b.as_slice(),
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self, KeyPayload::Sealed(_))
    }
}

/// Policy-gated encryption capability.
///
/// `encrypt` binds a payload to a policy; `decrypt` releases it only to a
/// credential that satisfies that policy. Both `authorize` and `decrypt`
/// verify the credential's bearer token first.
#[async_trait]
pub trait AccessControlService: Send + Sync {
    /// Recipient for transport sealing, if the service supports it.
    fn transport_recipient(&self) -> Option<TransportRecipient>;

    /// Confirm the bearer token was issued to the credential's subject.
    fn verify(&self, credential: &Credential) -> Result<(), AccessError>;

    /// Evaluate `policy` for `credential` without releasing anything.
    async fn authorize(
        &self,
        policy: &AccessPolicy,
        credential: &Credential,
    ) -> Result<(), AccessError>;

    async fn encrypt(
        &self,
        payload: KeyPayload,
        policy: &AccessPolicy,
    ) -> Result<EncryptedBlob, AccessError>;

    async fn decrypt(
        &self,
        blob: &EncryptedBlob,
        policy: &AccessPolicy,
        credential: &Credential,
    ) -> Result<Zeroizing<Vec<u8>>, AccessError>;
}
