//! ipvault-chunks: fixed-size streaming chunker and content hashing
//!
//! # Overview
//! - `fixed`: lazy, ordered, fixed-size chunking of an async byte source
//! - `sizing`: adaptive chunk-size selection for large files
//! - `blake3`: content addresses for stored blobs
//! - `digest`: SHA-256 of the plaintext, recorded in the manifest as `fileHash`

pub mod blake3;
pub mod digest;
pub mod fixed;
pub mod sizing;

pub use blake3::{content_address, hash_bytes, hash_from_hex, hash_to_hex, verify_address, Hash};
pub use digest::{sha256_hex, FileHasher};
pub use fixed::{chunk_ranges, ChunkError, ContentChunk, FixedChunker};
pub use sizing::{choose_chunk_size, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CHUNKS, MAX_CHUNK_SIZE_CAP};
