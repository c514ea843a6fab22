//! BLAKE3 content addressing
//!
//! Every blob written to the store is addressed by the BLAKE3 digest of its
//! bytes, so a reader can check what it fetched against the address it asked
//! for.

use ipvault_core::ContentAddress;

/// A BLAKE3 hash digest (32 bytes), displayed as 64 hex chars
pub type Hash = blake3::Hash;

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data)
}

/// Format a hash as lowercase hex string (64 chars)
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

/// Parse a 64-char hex string into a Hash
pub fn hash_from_hex(hex: &str) -> Option<Hash> {
    blake3::Hash::from_hex(hex).ok()
}

/// Content address of `data`.
pub fn content_address(data: &[u8]) -> ContentAddress {
    ContentAddress::from_digest(hash_bytes(data).as_bytes())
}

/// True when `data` hashes to `address`. Non-BLAKE3 addresses never verify.
pub fn verify_address(data: &[u8], address: &ContentAddress) -> bool {
    match hash_from_hex(address.as_str()) {
        // blake3::Hash equality is constant-time
        Some(expected) => hash_bytes(data) == expected,
        None => false,
    }
}
