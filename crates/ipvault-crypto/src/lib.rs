//! ipvault-crypto: client-side content encryption for protected documents
//!
//! Architecture: Chunk-then-Encrypt with AES-256-CTR
//!
//! Pipeline: plaintext → fixed-size chunk → AES-256-CTR → BLAKE3 address → upload
//!
//! Key material:
//! ```text
//! ContentKey (per upload run, 256-bit random)
//!   ├── Chunk i: AES-256-CTR, counter block = iv(96) || 0u32, keystream window i * 2^28
//!   └── Released to readers inside the MetadataBundle, encrypted under an AccessPolicy
//! StoreKey (per session, 256-bit random)
//!   └── Wraps ContentKeys at rest in the key store (XChaCha20-Poly1305)
//! ```
//!
//! CTR carries no authentication tag. Chunk integrity comes from content
//! addressing on fetch, file integrity from the SHA-256 `fileHash` checked
//! after reassembly.

pub mod bytes_compat;
pub mod cipher;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod manifest;
pub mod policy;
pub mod preview;
pub mod transport;

pub use cipher::{decrypt_chunk, encrypt_chunk, CHUNK_WINDOW};
pub use envelope::{EncryptedBlob, ManifestEnvelope, ENVELOPE_VERSION};
pub use error::{CryptoError, CryptoResult};
pub use keys::{unwrap_handle, wrap_key, ContentKey, Iv, KeyHandle, SecureRandom, StoreKey};
pub use manifest::{ChunkInfo, FileMetadata, Manifest, MetadataBundle, ALGORITHM_AES_CTR};
pub use policy::{
    AccessPolicy, AssetTarget, BoolOp, Comparator, Condition, PolicyBuilder, PolicyError,
    PolicyNode, ReturnValueTest,
};
pub use transport::{TransportIdentity, TransportRecipient};

/// Size of a content key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the AES-CTR IV in bytes (96-bit; the low 32 bits of the counter block start at zero)
pub const IV_SIZE: usize = 12;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
