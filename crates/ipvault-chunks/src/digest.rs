//! SHA-256 of the plaintext.
//!
//! The manifest records the lowercase hex SHA-256 of the whole document so a
//! downloader can check the reassembled output end to end.

use sha2::{Digest, Sha256};

/// One-shot SHA-256, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Incremental SHA-256 fed chunk by chunk.
#[derive(Clone, Default)]
pub struct FileHasher {
    inner: Sha256,
    bytes: u64,
}

impl FileHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finalize_hex(self) -> String {
        format!("{:x}", self.inner.finalize())
    }
}
