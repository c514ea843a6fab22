//! Transport sealing with age (X25519).
//!
//! With enhanced security on, the serialized bundle is sealed to the
//! access-control service's transport recipient before it leaves the upload
//! pipeline; only the service can open it, after the policy check.

use age::secrecy::ExposeSecret;
use std::fmt;
use std::io::{Read, Write};
use std::iter;
use std::str::FromStr;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};

pub struct TransportIdentity(age::x25519::Identity);

impl TransportIdentity {
    pub fn generate() -> Self {
        Self(age::x25519::Identity::generate())
    }

    /// Parse an `AGE-SECRET-KEY-1...` string (comment lines ignored).
    pub fn parse(text: &str) -> CryptoResult<Self> {
        let line = text
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("AGE-SECRET-KEY-"))
            .ok_or_else(|| CryptoError::Transport("no age identity found".into()))?;
        age::x25519::Identity::from_str(line)
            .map(Self)
            .map_err(|e| CryptoError::Transport(format!("invalid age identity: {e}")))
    }

    /// Secret key string, for writing identity files.
    pub fn to_secret_string(&self) -> Zeroizing<String> {
        Zeroizing::new(self.0.to_string().expose_secret().to_string())
    }

    pub fn recipient(&self) -> TransportRecipient {
        TransportRecipient(self.0.to_public())
    }

    pub fn open(&self, sealed: &[u8]) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let fail = |e: &dyn fmt::Display| CryptoError::Transport(format!("open failed: {e}"));

        // age 0.11: Decryptor is a plain struct, not an enum
        let decryptor = age::Decryptor::new(sealed).map_err(|e| fail(&e))?;
        if decryptor.is_scrypt() {
            return Err(CryptoError::Transport(
                "passphrase-sealed payloads are not accepted".into(),
            ));
        }
        let mut reader = decryptor
            .decrypt(iter::once(&self.0 as &dyn age::Identity))
            .map_err(|e| fail(&e))?;

        let mut plaintext = Zeroizing::new(Vec::new());
        reader.read_to_end(&mut plaintext).map_err(|e| fail(&e))?;
        Ok(plaintext)
    }
}

impl fmt::Debug for TransportIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportIdentity")
            .field("recipient", &self.recipient().to_string())
            .finish()
    }
}

#[derive(Clone)]
pub struct TransportRecipient(age::x25519::Recipient);

impl TransportRecipient {
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let fail = |e: &dyn fmt::Display| CryptoError::Transport(format!("seal failed: {e}"));

        let encryptor = age::Encryptor::with_recipients(iter::once(&self.0 as &dyn age::Recipient))
            .map_err(|e| fail(&e))?;
        let mut sealed = Vec::with_capacity(plaintext.len() + 256);
        let mut writer = encryptor.wrap_output(&mut sealed).map_err(|e| fail(&e))?;
        writer.write_all(plaintext).map_err(|e| fail(&e))?;
        writer.finish().map_err(|e| fail(&e))?;
        Ok(sealed)
    }
}

impl FromStr for TransportRecipient {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        age::x25519::Recipient::from_str(s.trim())
            .map(Self)
            .map_err(|e| CryptoError::Transport(format!("invalid age recipient: {e}")))
    }
}

impl fmt::Display for TransportRecipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TransportRecipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportRecipient({})", self.0)
    }
}
