//! Bearer-token verification.
//!
//! A [`Credential`] names its subject, but only the bearer token proves the
//! caller holds it. [`SessionTokens`] issues and checks tokens of the form
//! `ipv1.<expires-millis>.<mac>`, where the MAC is a keyed BLAKE3 hash of the
//! lowercase subject and the expiry under a service-held session key.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ipvault_core::config::{expand_tilde, AccessConfig};
use ipvault_core::types::is_evm_address;
use ipvault_core::{Clock, Credential};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::AccessError;
use crate::local::load_or_create_key;

const TOKEN_PREFIX: &str = "ipv1";

/// Checks that a credential's bearer token was issued to its subject.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, credential: &Credential) -> Result<(), AccessError>;
}

pub struct SessionTokens {
    key: Zeroizing<[u8; 32]>,
    clock: Arc<dyn Clock>,
}

impl SessionTokens {
    pub fn new(key: [u8; 32], clock: Arc<dyn Clock>) -> Self {
        Self {
            key: Zeroizing::new(key),
            clock,
        }
    }

    /// Random session key; tokens die with the process.
    pub fn ephemeral(clock: Arc<dyn Clock>) -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self::new(key, clock)
    }

    pub async fn load(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, AccessError> {
        Ok(Self::new(load_or_create_key(path).await?, clock))
    }

    /// Session key from `[access].session_key_file`, created on first use.
    pub async fn from_config(
        config: &AccessConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AccessError> {
        match &config.session_key_file {
            Some(path) => Self::load(&expand_tilde(path), clock).await,
            None => {
                warn!("no access.session_key_file configured, session tokens are process-local");
                Ok(Self::ephemeral(clock))
            }
        }
    }

    /// Token binding `subject` until now + `ttl`.
    pub fn issue(&self, subject: &str, ttl: Duration) -> Result<String, AccessError> {
        if !is_evm_address(subject) {
            return Err(AccessError::Unauthenticated(format!(
                "cannot issue a token for {subject:?}"
            )));
        }
        let expires = self.clock.now_millis() + ttl.as_millis() as u64;
        let mac = self.mac(&subject.to_ascii_lowercase(), expires);
        Ok(format!("{TOKEN_PREFIX}.{expires}.{}", mac.to_hex()))
    }

    fn mac(&self, subject: &str, expires: u64) -> blake3::Hash {
        blake3::keyed_hash(&self.key, format!("{subject}\n{expires}").as_bytes())
    }
}

impl IdentityVerifier for SessionTokens {
    fn verify(&self, credential: &Credential) -> Result<(), AccessError> {
        let malformed = || AccessError::Unauthenticated("malformed session token".into());

        let mut parts = credential.bearer().splitn(3, '.');
        if parts.next() != Some(TOKEN_PREFIX) {
            return Err(malformed());
        }
        let expires: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(malformed)?;
        let given = parts
            .next()
            .and_then(|s| blake3::Hash::from_hex(s).ok())
            .ok_or_else(malformed)?;

        // blake3::Hash compares in constant time
        if self.mac(credential.subject(), expires) != given {
            debug!(subject = credential.subject(), "session token rejected");
            return Err(AccessError::Unauthenticated(format!(
                "session token was not issued to {}",
                credential.subject()
            )));
        }
        if self.clock.now_millis() >= expires {
            return Err(AccessError::Unauthenticated("session token expired".into()));
        }
        Ok(())
    }
}
