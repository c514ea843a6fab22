//! Content keys, IVs, non-extractable key handles, and at-rest key wrapping

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CryptoError, CryptoResult};
use crate::{IV_SIZE, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Cryptographically secure randomness provider.
///
/// Production code hands in `OsRng`; tests hand in a seeded `StdRng`.
pub trait SecureRandom: RngCore + CryptoRng + Send {}

impl<T: RngCore + CryptoRng + Send> SecureRandom for T {}

/// A per-upload 256-bit AES key. Zeroized on drop.
///
/// Extractable: the upload path serializes it into the metadata bundle.
/// Everything on the read path goes through [`KeyHandle`] instead.
#[derive(Clone)]
pub struct ContentKey {
    bytes: [u8; KEY_SIZE],
}

impl ContentKey {
    pub fn generate<R: RngCore + CryptoRng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "content key is {} bytes (expected {KEY_SIZE})",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// SHA-256 of the key, lowercase hex (`dataToEncryptHash`).
    pub fn fingerprint(&self) -> String {
        format!("{:x}", Sha256::digest(self.bytes))
    }

    /// A decrypt-only handle to the same key.
    pub fn handle(&self) -> KeyHandle {
        KeyHandle {
            bytes: Zeroizing::new(self.bytes),
        }
    }
}

impl Drop for ContentKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Non-extractable key reference: usable for decryption, never exported.
pub struct KeyHandle {
    bytes: Zeroizing<[u8; KEY_SIZE]>,
}

impl KeyHandle {
    pub(crate) fn key_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyHandle([REDACTED])")
    }
}

/// 96-bit AES-CTR IV, generated once per upload run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iv([u8; IV_SIZE]);

impl Iv {
    pub fn generate<R: RngCore + CryptoRng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; IV_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; IV_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; IV_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("iv is {} bytes (expected {IV_SIZE})", bytes.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; IV_SIZE] {
        &self.0
    }
}

/// Session key protecting content keys held by the key store. Zeroized on drop.
pub struct StoreKey {
    bytes: [u8; KEY_SIZE],
}

impl StoreKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Short public tag identifying which store key wrapped a record.
    pub fn epoch(&self) -> String {
        let digest = Sha256::new()
            .chain_update(b"ipvault-store-epoch")
            .chain_update(self.bytes)
            .finalize();
        format!("{:x}", digest)[..16].to_string()
    }
}

impl Drop for StoreKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreKey")
            .field("epoch", &self.epoch())
            .finish()
    }
}

/// Wrap (encrypt) a content key under the store key.
///
/// Uses XChaCha20-Poly1305 with a random nonce.
/// Output: `[24-byte nonce][ciphertext + 16-byte tag]`
pub fn wrap_key(store: &StoreKey, key: &ContentKey) -> CryptoResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new((&store.bytes).into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, key.as_bytes().as_ref())
        .map_err(|e| CryptoError::KeyWrap(e.to_string()))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Unwrap a key produced by [`wrap_key`] straight into a [`KeyHandle`].
pub fn unwrap_handle(store: &StoreKey, wrapped: &[u8]) -> CryptoResult<KeyHandle> {
    if wrapped.len() != NONCE_SIZE + KEY_SIZE + TAG_SIZE {
        return Err(CryptoError::KeyWrap(format!(
            "wrapped key is {} bytes (expected {})",
            wrapped.len(),
            NONCE_SIZE + KEY_SIZE + TAG_SIZE
        )));
    }

    let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new((&store.bytes).into());

    let plaintext = Zeroizing::new(cipher.decrypt(nonce, ciphertext).map_err(|_| {
        CryptoError::KeyWrap("invalid store key or corrupted record".into())
    })?);

    let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
    bytes.copy_from_slice(&plaintext);
    Ok(KeyHandle { bytes })
}
