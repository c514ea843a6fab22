use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("decryption failure: {0}")]
    DecryptionFailure(String),

    #[error("chunk of {len} bytes exceeds the {max}-byte keystream window")]
    ChunkTooLarge { len: u64, max: u64 },

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("key wrapping failed: {0}")]
    KeyWrap(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("transport sealing failed: {0}")]
    Transport(String),

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}
