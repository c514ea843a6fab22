//! ipvault-keystore: local store of manifests and wrapped content keys
//!
//! Two logical tables keyed by identifier:
//!   - `manifests`: public chunk layout of a document
//!   - `cryptoKeys`: content key (wrapped under the session store key), IV
//!     and algorithm
//!
//! Entries resolved through an access policy live for the session; entries
//! opened from a pasted manifest expire after a short window.

pub mod backend;
pub mod error;
pub mod record;
pub mod store;

#[cfg(feature = "rocksdb")]
pub use backend::RocksDbKeyStore;
pub use backend::{open_backend, JsonKeyStore, KeyStoreBackend};
pub use error::{KeyStoreError, KeyStoreResult};
pub use record::{KeyRow, ManifestRow, RowMeta};
pub use store::{KeyStore, KeyStoreEntry};
