//! ipvault-storage: content-addressed blob store on OpenDAL

pub mod blob;
pub mod health;
pub mod operator;

pub use blob::{BlobStore, OpendalBlobStore, StorageError};
pub use health::check_health;
pub use operator::{build_from_core_config, build_operator, memory_operator, S3Settings};
