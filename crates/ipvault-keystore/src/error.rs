use std::path::PathBuf;

use ipvault_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key store I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key store record {id:?} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("key store encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[cfg(feature = "rocksdb")]
    #[error("rocksdb: {0}")]
    Rocks(#[from] rocksdb::Error),

    #[error("column family {0} is missing")]
    MissingColumnFamily(&'static str),
}

pub type KeyStoreResult<T> = std::result::Result<T, KeyStoreError>;
