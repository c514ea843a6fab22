use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccessError {
    /// The caller does not satisfy the policy. Nothing was decrypted.
    #[error("access denied: {0}")]
    Denied(String),

    /// The bearer token does not prove the claimed subject.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("transport sealing: {0}")]
    Transport(String),

    #[error("malformed access-control payload: {0}")]
    Malformed(String),

    /// Attribute lookup or key material unavailable.
    #[error("access-control service: {0}")]
    Service(String),
}

impl AccessError {
    pub fn is_denied(&self) -> bool {
        matches!(self, AccessError::Denied(_))
    }
}
