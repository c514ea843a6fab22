//! Content-addressed blob store
//!
//! Blobs live at `{prefix}/blobs/{blake3-hex}`. Writes are idempotent: a
//! blob that already exists is not rewritten. Reads re-hash what came back
//! and refuse bytes that do not match their address.

use async_trait::async_trait;
use bytes::Bytes;
use ipvault_chunks::{content_address, verify_address};
use ipvault_core::{ContentAddress, Credential};
use opendal::{ErrorKind, Operator};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob {0} not found")]
    NotFound(ContentAddress),

    #[error("blob {0} does not match its content address")]
    Integrity(ContentAddress),

    #[error("address {0} is not served by this store")]
    UnsupportedAddress(ContentAddress),

    #[error("storage backend: {0}")]
    Backend(#[from] opendal::Error),
}

impl StorageError {
    /// Worth retrying later (network blips, throttling).
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Backend(e) if e.is_temporary())
    }
}

/// Immutable blob storage keyed by content address.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` on behalf of `session`; returns its address.
    async fn put(&self, data: Bytes, session: &Credential) -> Result<ContentAddress, StorageError>;

    /// Fetch and verify the blob at `address`.
    async fn get(&self, address: &ContentAddress) -> Result<Bytes, StorageError>;
}

pub struct OpendalBlobStore {
    op: Operator,
    prefix: String,
}

impl OpendalBlobStore {
    pub fn new(op: Operator, prefix: impl Into<String>) -> Self {
        Self {
            op,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Backend path for `address`.
    pub fn blob_path(&self, address: &ContentAddress) -> String {
        if self.prefix.is_empty() {
            format!("blobs/{address}")
        } else {
            format!("{}/blobs/{address}", self.prefix)
        }
    }
}

#[async_trait]
impl BlobStore for OpendalBlobStore {
    async fn put(&self, data: Bytes, session: &Credential) -> Result<ContentAddress, StorageError> {
        let address = content_address(&data);
        let path = self.blob_path(&address);

        if self.op.exists(&path).await? {
            debug!(%address, "blob already stored (dedup)");
            return Ok(address);
        }

        let len = data.len();
        self.op.write(&path, data).await?;
        debug!(%address, bytes = len, uploader = session.subject(), "blob stored");
        Ok(address)
    }

    async fn get(&self, address: &ContentAddress) -> Result<Bytes, StorageError> {
        if !address.is_blake3() {
            return Err(StorageError::UnsupportedAddress(address.clone()));
        }

        let buf = self
            .op
            .read(&self.blob_path(address))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => StorageError::NotFound(address.clone()),
                _ => StorageError::Backend(e),
            })?;

        let data = buf.to_bytes();
        if !verify_address(&data, address) {
            warn!(%address, bytes = data.len(), "fetched blob failed content verification");
            return Err(StorageError::Integrity(address.clone()));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::memory_operator;

    fn session() -> Credential {
        Credential::new("0x1111111111111111111111111111111111111111", "token").unwrap()
    }

    fn store() -> OpendalBlobStore {
        OpendalBlobStore::new(memory_operator().unwrap(), "ipvault/")
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = store();
        let address = store.put(Bytes::from_static(b"cipher"), &session()).await.unwrap();
        assert!(address.is_blake3());
        assert_eq!(store.get(&address).await.unwrap(), Bytes::from_static(b"cipher"));
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let store = store();
        let a = store.put(Bytes::from_static(b"same"), &session()).await.unwrap();
        let b = store.put(Bytes::from_static(b"same"), &session()).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn blob_path_layout() {
        let store = store();
        let address = content_address(b"x");
        assert_eq!(store.blob_path(&address), format!("ipvault/blobs/{address}"));
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let store = store();
        let result = store.get(&content_address(b"never stored")).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn tampered_blob_is_rejected() {
        let store = store();
        let address = store.put(Bytes::from_static(b"original"), &session()).await.unwrap();
        store
            .operator()
            .write(&store.blob_path(&address), b"0riginal".to_vec())
            .await
            .unwrap();

        let result = store.get(&address).await;
        assert!(matches!(result, Err(StorageError::Integrity(_))));
    }

    #[tokio::test]
    async fn foreign_address_is_unsupported() {
        let store = store();
        let address = ContentAddress::parse("bafybeigdyrzt5").unwrap();
        assert!(matches!(
            store.get(&address).await,
            Err(StorageError::UnsupportedAddress(_))
        ));
    }
}
