use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{IpvaultError, IpvaultResult};

/// Address of an immutable blob on the content-addressed store.
///
/// Addresses produced by this workspace are lowercase BLAKE3 hex digests, but
/// the type accepts any non-empty token without whitespace or path separators
/// so manifests that reference foreign stores still parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentAddress(String);

impl ContentAddress {
    pub fn parse(raw: impl Into<String>) -> IpvaultResult<Self> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(raw))
        } else {
            Err(IpvaultError::InvalidAddress(raw))
        }
    }

    /// Address for a raw digest, hex-encoded.
    pub fn from_digest(digest: &[u8]) -> Self {
        Self(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the address has the shape of a BLAKE3 hex digest.
    pub fn is_blake3(&self) -> bool {
        self.0.len() == 64 && self.0.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentAddress {
    type Error = IpvaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ContentAddress> for String {
    fn from(value: ContentAddress) -> Self {
        value.0
    }
}

/// Session credential issued by the identity provider.
///
/// `subject` is the wallet address policies are evaluated against; the
/// bearer token authorizes store writes and access-control requests.
pub struct Credential {
    subject: String,
    bearer: SecretString,
}

impl Credential {
    pub fn new(subject: impl Into<String>, bearer: impl Into<String>) -> IpvaultResult<Self> {
        let subject = subject.into();
        if !is_evm_address(&subject) {
            return Err(IpvaultError::InvalidCredential(format!(
                "subject {subject:?} is not a 0x-prefixed 20-byte address"
            )));
        }
        let bearer: String = bearer.into();
        if bearer.trim().is_empty() {
            return Err(IpvaultError::InvalidCredential("empty bearer token".into()));
        }
        Ok(Self {
            subject: subject.to_ascii_lowercase(),
            bearer: SecretString::from(bearer),
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn bearer(&self) -> &str {
        self.bearer.expose_secret()
    }
}

impl Clone for Credential {
    fn clone(&self) -> Self {
        Self {
            subject: self.subject.clone(),
            bearer: SecretString::from(self.bearer.expose_secret().to_owned()),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("subject", &self.subject)
            .field("bearer", &"[REDACTED]")
            .finish()
    }
}

/// `0x` followed by 40 hex digits.
pub fn is_evm_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}
