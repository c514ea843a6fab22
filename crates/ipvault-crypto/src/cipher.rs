//! Per-chunk AES-256-CTR encryption/decryption
//!
//! Counter block layout:
//! ```text
//! [12 bytes: iv][4 bytes: zero]   counter = low 64 bits, big-endian
//! ```
//!
//! Chunk `i` starts its keystream at byte `i * CHUNK_WINDOW`, so every chunk
//! owns a disjoint 256 MiB slice of the keystream and can be processed on its
//! own, in any order. Ciphertext length equals plaintext length.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::error::{CryptoError, CryptoResult};
use crate::keys::{ContentKey, Iv, KeyHandle};
use crate::{IV_SIZE, KEY_SIZE};

/// Keystream bytes reserved per chunk (256 MiB). Also the chunk size limit.
pub const CHUNK_WINDOW: u64 = 1 << 28;

const AES_BLOCK_SIZE: u64 = 16;

type Aes256Ctr64BE = ctr::Ctr64BE<Aes256>;

/// Encrypt chunk `chunk_index` of an upload run.
pub fn encrypt_chunk(
    key: &ContentKey,
    iv: &Iv,
    chunk_index: u64,
    plaintext: &[u8],
) -> CryptoResult<Vec<u8>> {
    check_window(plaintext.len())?;
    Ok(apply_keystream(key.as_bytes(), iv, chunk_index, plaintext))
}

/// Decrypt chunk `chunk_index` with a non-extractable handle.
///
/// CTR cannot detect a wrong key or flipped bits; callers verify the
/// ciphertext address before and the file hash after.
pub fn decrypt_chunk(
    key: &KeyHandle,
    iv: &Iv,
    chunk_index: u64,
    ciphertext: &[u8],
) -> CryptoResult<Vec<u8>> {
    check_window(ciphertext.len()).map_err(|e| CryptoError::DecryptionFailure(e.to_string()))?;
    Ok(apply_keystream(key.key_bytes(), iv, chunk_index, ciphertext))
}

fn check_window(len: usize) -> CryptoResult<()> {
    if len as u64 > CHUNK_WINDOW {
        return Err(CryptoError::ChunkTooLarge {
            len: len as u64,
            max: CHUNK_WINDOW,
        });
    }
    Ok(())
}

/// Initial counter block for `chunk_index`.
fn counter_block(iv: &Iv, chunk_index: u64) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[..IV_SIZE].copy_from_slice(iv.as_bytes());

    let mut low = [0u8; 8];
    low.copy_from_slice(&block[8..16]);
    let base = u64::from_be_bytes(low);
    let start = base.wrapping_add(chunk_index.wrapping_mul(CHUNK_WINDOW / AES_BLOCK_SIZE));
    block[8..16].copy_from_slice(&start.to_be_bytes());
    block
}

fn apply_keystream(key: &[u8; KEY_SIZE], iv: &Iv, chunk_index: u64, data: &[u8]) -> Vec<u8> {
    let block = counter_block(iv, chunk_index);
    let mut cipher = Aes256Ctr64BE::new(key.into(), (&block).into());
    let mut output = data.to_vec();
    cipher.apply_keystream(&mut output);
    output
}
