//! Manifest format
//!
//! The manifest records everything needed to rebuild a document from its
//! encrypted chunks:
//! - `fileHash`: SHA-256 of the plaintext (hex)
//! - `dataToEncryptHash`: SHA-256 of the content key (hex)
//! - `fileMetadata`: name, size, content type, chunk size
//! - `chunks`: ordered chunk entries (address, offset, size, counter)
//!
//! Bundles may list chunks as bare addresses. With one chunk, or with
//! `fileMetadata.chunkSize`, the layout is derived up front. Otherwise the
//! entries are left unsized (`size == 0`) and each chunk's length is taken
//! from its ciphertext while streaming; CTR output is as long as its input.
//!
//! A [`MetadataBundle`] is the manifest plus `symmetricKey` and `iv`; it is
//! what gets encrypted under the access policy. The key store keeps the two
//! halves in separate tables.

use ipvault_chunks::content_address;
use ipvault_core::ContentAddress;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::bytes_compat;
use crate::cipher::CHUNK_WINDOW;
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{ContentKey, Iv};

/// Algorithm tag stored next to key handles.
pub const ALGORITHM_AES_CTR: &str = "AES-CTR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(rename = "chunkSize", default)]
    pub chunk_size: u64,
}

/// A single chunk entry in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    /// Address of the encrypted chunk
    pub cid: ContentAddress,
    /// Plaintext offset within the file
    pub offset: u64,
    /// Plaintext size; 0 when only known once the chunk is fetched
    pub size: u64,
    /// Stored size (equal to `size` for CTR)
    pub encrypted_size: u64,
    /// Chunk index; selects the keystream window
    pub counter: u64,
}

/// Chunk entries as they may appear on input: full objects or bare addresses.
#[derive(Deserialize)]
#[serde(untagged)]
enum ChunkRepr {
    Full(ChunkInfo),
    Address(ContentAddress),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    file_hash: String,
    #[serde(default)]
    data_to_encrypt_hash: String,
    file_metadata: FileMetadata,
    chunks: Vec<ChunkRepr>,
}

/// Public half of the manifest: no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawManifest")]
pub struct Manifest {
    pub file_hash: String,
    pub data_to_encrypt_hash: String,
    pub file_metadata: FileMetadata,
    pub chunks: Vec<ChunkInfo>,
}

impl Manifest {
    /// Assemble and validate a manifest. Pure: same inputs, same manifest.
    pub fn build(
        file_metadata: FileMetadata,
        file_hash: String,
        key: &ContentKey,
        chunks: Vec<ChunkInfo>,
    ) -> CryptoResult<Self> {
        let manifest = Self {
            file_hash,
            data_to_encrypt_hash: key.fingerprint(),
            file_metadata,
            chunks,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// False when chunk lengths are learned from the fetched ciphertext.
    pub fn is_sized(&self) -> bool {
        self.chunks.iter().all(|c| c.size > 0)
    }

    /// Check chunk order, coverage and sizes.
    pub fn validate(&self) -> CryptoResult<()> {
        let invalid = |msg: String| Err(CryptoError::InvalidManifest(msg));

        if self.file_hash.len() != 64 || !self.file_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return invalid(format!("fileHash {:?} is not a SHA-256 hex digest", self.file_hash));
        }
        if self.chunks.is_empty() {
            return invalid("no chunks".into());
        }
        if self.chunks.iter().all(|c| c.size == 0) {
            return self.validate_unsized();
        }

        let mut next_offset = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.counter != i as u64 {
                return invalid(format!("chunk {i} has counter {}", chunk.counter));
            }
            if chunk.offset != next_offset {
                return invalid(format!(
                    "chunk {i} starts at {} (expected {next_offset})",
                    chunk.offset
                ));
            }
            if chunk.size == 0 || chunk.size > CHUNK_WINDOW {
                return invalid(format!("chunk {i} has size {}", chunk.size));
            }
            if chunk.encrypted_size != chunk.size {
                return invalid(format!(
                    "chunk {i} stored size {} differs from plaintext size {}",
                    chunk.encrypted_size, chunk.size
                ));
            }
            next_offset += chunk.size;
        }

        if next_offset != self.file_metadata.size {
            return invalid(format!(
                "chunks cover {next_offset} bytes, file is {}",
                self.file_metadata.size
            ));
        }
        Ok(())
    }

    /// Unsized layout: only order and a plausible total can be checked.
    fn validate_unsized(&self) -> CryptoResult<()> {
        let invalid = |msg: String| Err(CryptoError::InvalidManifest(msg));

        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.counter != i as u64 {
                return invalid(format!("chunk {i} has counter {}", chunk.counter));
            }
            if chunk.offset != 0 || chunk.encrypted_size != 0 {
                return invalid(format!("chunk {i} mixes sized and unsized fields"));
            }
        }
        let n = self.chunks.len() as u64;
        let size = self.file_metadata.size;
        if size < n || size > n.saturating_mul(CHUNK_WINDOW) {
            return invalid(format!("{n} chunks cannot hold a {size}-byte file"));
        }
        Ok(())
    }

    /// Address of the ordered chunk address list (the upload's `rootCid`).
    pub fn root(&self) -> ContentAddress {
        let mut listing = String::with_capacity(self.chunks.len() * 65);
        for chunk in &self.chunks {
            listing.push_str(chunk.cid.as_str());
            listing.push('\n');
        }
        content_address(listing.as_bytes())
    }

    /// Total plaintext size.
    pub fn size(&self) -> u64 {
        self.file_metadata.size
    }

    pub fn to_json(&self) -> CryptoResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> CryptoResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl TryFrom<RawManifest> for Manifest {
    type Error = CryptoError;

    fn try_from(raw: RawManifest) -> Result<Self, Self::Error> {
        let size = raw.file_metadata.size;
        let chunk_size = match (raw.file_metadata.chunk_size, raw.chunks.len()) {
            (0, 1) => size,
            (n, _) => n,
        };

        let chunks = raw
            .chunks
            .into_iter()
            .enumerate()
            .map(|(i, repr)| match repr {
                ChunkRepr::Full(info) => info,
                // Unsized: lengths come from the ciphertext.
                ChunkRepr::Address(cid) if chunk_size == 0 => ChunkInfo {
                    cid,
                    offset: 0,
                    size: 0,
                    encrypted_size: 0,
                    counter: i as u64,
                },
                ChunkRepr::Address(cid) => {
                    let offset = (i as u64).saturating_mul(chunk_size);
                    let len = chunk_size.min(size.saturating_sub(offset));
                    ChunkInfo {
                        cid,
                        offset,
                        size: len,
                        encrypted_size: len,
                        counter: i as u64,
                    }
                }
            })
            .collect::<Vec<_>>();

        let manifest = Manifest {
            file_hash: raw.file_hash.to_ascii_lowercase(),
            data_to_encrypt_hash: raw.data_to_encrypt_hash,
            file_metadata: raw.file_metadata,
            chunks,
        };
        manifest.validate()?;
        Ok(manifest)
    }
}

/// Manifest plus key material: the document's decryption capability.
#[derive(Debug, Clone)]
pub struct MetadataBundle {
    pub manifest: Manifest,
    pub key: ContentKey,
    pub iv: Iv,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BundleOut<'a> {
    file_hash: &'a str,
    data_to_encrypt_hash: &'a str,
    file_metadata: &'a FileMetadata,
    chunks: &'a [ChunkInfo],
    #[serde(with = "bytes_compat")]
    symmetric_key: &'a [u8],
    #[serde(with = "bytes_compat")]
    iv: &'a [u8],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundleIn {
    #[serde(flatten)]
    manifest: RawManifest,
    #[serde(with = "bytes_compat")]
    symmetric_key: Vec<u8>,
    #[serde(with = "bytes_compat")]
    iv: Vec<u8>,
}

impl MetadataBundle {
    pub fn new(manifest: Manifest, key: ContentKey, iv: Iv) -> Self {
        Self { manifest, key, iv }
    }

    /// Serialize to the bundle JSON. Deterministic for equal bundles.
    pub fn to_json(&self) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let out = BundleOut {
            file_hash: &self.manifest.file_hash,
            data_to_encrypt_hash: &self.manifest.data_to_encrypt_hash,
            file_metadata: &self.manifest.file_metadata,
            chunks: &self.manifest.chunks,
            symmetric_key: self.key.as_bytes(),
            iv: self.iv.as_bytes(),
        };
        Ok(Zeroizing::new(serde_json::to_vec(&out)?))
    }

    /// Parse bundle JSON, accepting every byte-array encoding browsers emit.
    pub fn from_json(data: &[u8]) -> CryptoResult<Self> {
        let raw: BundleIn = serde_json::from_slice(data)?;
        let key_bytes = Zeroizing::new(raw.symmetric_key);
        let key = ContentKey::from_slice(&key_bytes)?;
        let iv = Iv::from_slice(&raw.iv)?;

        let mut manifest = Manifest::try_from(raw.manifest)?;
        if manifest.data_to_encrypt_hash.is_empty() {
            tracing::debug!("bundle without dataToEncryptHash, deriving from key");
            manifest.data_to_encrypt_hash = key.fingerprint();
        } else if !manifest
            .data_to_encrypt_hash
            .eq_ignore_ascii_case(&key.fingerprint())
        {
            return Err(CryptoError::InvalidManifest(
                "dataToEncryptHash does not match symmetricKey".into(),
            ));
        }
        Ok(Self { manifest, key, iv })
    }
}
