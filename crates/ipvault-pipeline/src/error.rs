use ipvault_access::AccessError;
use ipvault_chunks::ChunkError;
use ipvault_crypto::{CryptoError, PolicyError};
use ipvault_keystore::KeyStoreError;
use ipvault_storage::StorageError;
use thiserror::Error;

use crate::intercept::InterceptError;

/// How a failure should be reported and whether it may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; raised before any network activity. Never retried.
    Validation,
    /// Network or backend failure. The operation was aborted.
    Transient,
    /// Tamper or wrong-key signal. Never retried.
    Cryptographic,
    /// The caller does not satisfy the access policy.
    AccessDenied,
    Internal,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("access policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("reading input: {0}")]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Intercept(#[from] InterceptError),

    #[error("identifier {0:?} is not in the key store")]
    UnknownIdentifier(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_)
            | PipelineError::Policy(_)
            | PipelineError::UnknownIdentifier(_) => ErrorKind::Validation,
            PipelineError::Chunk(ChunkError::ZeroChunkSize) => ErrorKind::Validation,
            PipelineError::Chunk(ChunkError::Read { .. }) => ErrorKind::Transient,
            PipelineError::Storage(e) => storage_kind(e),
            PipelineError::Crypto(e) => crypto_kind(e),
            PipelineError::Access(e) => match e {
                AccessError::Denied(_) | AccessError::Unauthenticated(_) => {
                    ErrorKind::AccessDenied
                }
                AccessError::Malformed(_) | AccessError::Transport(_) => ErrorKind::Cryptographic,
                AccessError::Service(_) => ErrorKind::Transient,
            },
            PipelineError::KeyStore(_) => ErrorKind::Internal,
            PipelineError::Intercept(e) => match e {
                InterceptError::RangeNotSatisfiable { .. } => ErrorKind::Validation,
                InterceptError::Storage(e) => storage_kind(e),
                InterceptError::Crypto(e) => crypto_kind(e),
                InterceptError::Integrity { .. } => ErrorKind::Cryptographic,
                InterceptError::KeyStore(_) | InterceptError::Cancelled => ErrorKind::Internal,
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

fn storage_kind(e: &StorageError) -> ErrorKind {
    match e {
        StorageError::Integrity(_) => ErrorKind::Cryptographic,
        StorageError::UnsupportedAddress(_) => ErrorKind::Validation,
        StorageError::NotFound(_) => ErrorKind::Internal,
        StorageError::Backend(_) => ErrorKind::Transient,
    }
}

fn crypto_kind(e: &CryptoError) -> ErrorKind {
    match e {
        CryptoError::ChunkTooLarge { .. }
        | CryptoError::InvalidKey(_)
        | CryptoError::InvalidManifest(_)
        | CryptoError::Json(_) => ErrorKind::Validation,
        CryptoError::DecryptionFailure(_)
        | CryptoError::KeyWrap(_)
        | CryptoError::InvalidEnvelope(_)
        | CryptoError::Transport(_) => ErrorKind::Cryptographic,
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
