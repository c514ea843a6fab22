//! In-process access-control service.
//!
//! Payloads are encrypted with XChaCha20-Poly1305 under a service key, with
//! the policy digest as associated data, so a ciphertext only opens under the
//! exact policy it was bound to. `decrypt` verifies the caller's session token
//! and evaluates every condition before touching the ciphertext.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ipvault_core::config::{expand_tilde, AccessConfig};
use ipvault_core::{Clock, Credential};
use ipvault_crypto::policy::USER_ADDRESS;
use ipvault_crypto::{
    AccessPolicy, Condition, EncryptedBlob, TransportIdentity, TransportRecipient, KEY_SIZE,
    NONCE_SIZE,
};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::AccessError;
use crate::identity::{IdentityVerifier, SessionTokens};
use crate::ledger::{AttributeResolver, BalanceLedger};
use crate::service::{AccessControlService, KeyPayload};

pub struct LocalAccessControl {
    service_key: Zeroizing<[u8; KEY_SIZE]>,
    transport: Option<TransportIdentity>,
    resolver: Arc<dyn AttributeResolver>,
    verifier: Arc<dyn IdentityVerifier>,
}

impl LocalAccessControl {
    pub fn new(
        service_key: [u8; KEY_SIZE],
        resolver: Arc<dyn AttributeResolver>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self {
            service_key: Zeroizing::new(service_key),
            transport: None,
            resolver,
            verifier,
        }
    }

    /// Random service key; nothing persisted.
    pub fn ephemeral(
        resolver: Arc<dyn AttributeResolver>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self::new(key, resolver, verifier)
    }

    /// Accept transport-sealed payloads addressed to `identity`.
    pub fn with_transport(mut self, identity: TransportIdentity) -> Self {
        self.transport = Some(identity);
        self
    }

    /// Build from the `[access]` config section, creating the service key,
    /// session key and transport identity files on first use.
    pub async fn from_config(
        config: &AccessConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AccessError> {
        let resolver: Arc<dyn AttributeResolver> = match &config.ledger_file {
            Some(path) => Arc::new(BalanceLedger::load(&expand_tilde(path)).await?),
            None => Arc::new(BalanceLedger::new()),
        };
        let verifier = Arc::new(SessionTokens::from_config(config, clock).await?);

        let mut service = match &config.service_key_file {
            Some(path) => Self::new(
                load_or_create_key(&expand_tilde(path)).await?,
                resolver,
                verifier,
            ),
            None => {
                warn!("no access.service_key_file configured, using an ephemeral service key");
                Self::ephemeral(resolver, verifier)
            }
        };

        if let Some(path) = &config.transport_identity_file {
            service = service.with_transport(load_or_create_identity(&expand_tilde(path)).await?);
        }
        Ok(service)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&*self.service_key).into())
    }

    /// Resolve one condition for `subject`.
    async fn check(&self, condition: &Condition, subject: &str) -> Result<bool, AccessError> {
        let bind = |param: &str| {
            if param == USER_ADDRESS {
                subject.to_string()
            } else {
                param.to_string()
            }
        };

        let actual = match condition.method.as_str() {
            "" => condition
                .parameters
                .first()
                .map(|p| bind(p))
                .ok_or_else(|| AccessError::Malformed("condition without parameters".into()))?,
            "balanceOf" => {
                let holder = condition
                    .parameters
                    .first()
                    .map(|p| bind(p))
                    .ok_or_else(|| AccessError::Malformed("balanceOf without holder".into()))?;
                let token_id = condition.parameters.get(1).map(String::as_str);
                self.resolver
                    .balance_of(
                        &condition.chain,
                        &condition.contract_address,
                        &holder,
                        token_id,
                    )
                    .await?
            }
            other => {
                return Err(AccessError::Malformed(format!(
                    "unsupported condition method {other:?}"
                )))
            }
        };

        let test = &condition.return_value_test;
        Ok(test.comparator.test(&actual, &test.value))
    }

    /// Whether `credential`'s subject satisfies `policy`. Does not check the
    /// bearer token.
    pub async fn satisfies(
        &self,
        policy: &AccessPolicy,
        credential: &Credential,
    ) -> Result<bool, AccessError> {
        let mut results: Vec<(&Condition, bool)> = Vec::new();
        for condition in policy.conditions() {
            let ok = self.check(condition, credential.subject()).await?;
            results.push((condition, ok));
        }

        policy.evaluate(|condition| {
            results
                .iter()
                .find(|(c, _)| *c == condition)
                .map(|(_, ok)| *ok)
                .ok_or_else(|| AccessError::Service("condition was not resolved".into()))
        })
    }
}

#[async_trait]
impl AccessControlService for LocalAccessControl {
    fn transport_recipient(&self) -> Option<TransportRecipient> {
        self.transport.as_ref().map(TransportIdentity::recipient)
    }

    fn verify(&self, credential: &Credential) -> Result<(), AccessError> {
        self.verifier.verify(credential)
    }

    async fn authorize(
        &self,
        policy: &AccessPolicy,
        credential: &Credential,
    ) -> Result<(), AccessError> {
        self.verify(credential)?;
        if !self.satisfies(policy, credential).await? {
            info!(subject = credential.subject(), "access denied by policy");
            return Err(AccessError::Denied(format!(
                "{} does not satisfy the access conditions",
                credential.subject()
            )));
        }
        Ok(())
    }

    async fn encrypt(
        &self,
        payload: KeyPayload,
        policy: &AccessPolicy,
    ) -> Result<EncryptedBlob, AccessError> {
        if payload.is_sealed() && self.transport.is_none() {
            return Err(AccessError::Transport(
                "sealed payload but this service has no transport identity".into(),
            ));
        }

        let aad = policy_aad(policy)?;
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: payload.bytes(),
                    aad: &aad,
                },
            )
            .map_err(|e| AccessError::Service(format!("encrypt: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);

        debug!(
            bytes = payload.bytes().len(),
            sealed = payload.is_sealed(),
            "payload bound to access policy"
        );
        Ok(EncryptedBlob {
            ciphertext: BASE64.encode(out),
            data_to_encrypt_hash: format!("{:x}", Sha256::digest(payload.bytes())),
            sealed: payload.is_sealed(),
        })
    }

    async fn decrypt(
        &self,
        blob: &EncryptedBlob,
        policy: &AccessPolicy,
        credential: &Credential,
    ) -> Result<Zeroizing<Vec<u8>>, AccessError> {
        AccessControlService::authorize(self, policy, credential).await?;

        let raw = BASE64
            .decode(&blob.ciphertext)
            .map_err(|e| AccessError::Malformed(format!("ciphertext is not base64: {e}")))?;
        if raw.len() < NONCE_SIZE {
            return Err(AccessError::Malformed("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);

        let aad = policy_aad(policy)?;
        let plaintext = Zeroizing::new(
            self.cipher()
                .decrypt(
                    XNonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad: &aad,
                    },
                )
                .map_err(|_| {
                    AccessError::Malformed(
                        "ciphertext does not open under this policy and service key".into(),
                    )
                })?,
        );

        if !format!("{:x}", Sha256::digest(&*plaintext))
            .eq_ignore_ascii_case(&blob.data_to_encrypt_hash)
        {
            return Err(AccessError::Malformed("dataToEncryptHash mismatch".into()));
        }

        if !blob.sealed {
            return Ok(plaintext);
        }
        let identity = self.transport.as_ref().ok_or_else(|| {
            AccessError::Transport("payload is sealed but no transport identity is loaded".into())
        })?;
        identity
            .open(&plaintext)
            .map_err(|e| AccessError::Transport(e.to_string()))
    }
}

fn policy_aad(policy: &AccessPolicy) -> Result<[u8; 32], AccessError> {
    policy
        .digest()
        .map_err(|e| AccessError::Malformed(format!("policy digest: {e}")))
}

pub(crate) async fn load_or_create_key(path: &Path) -> Result<[u8; KEY_SIZE], AccessError> {
    let io = |e: std::io::Error| AccessError::Service(format!("{}: {e}", path.display()));

    if path.exists() {
        let text = Zeroizing::new(tokio::fs::read_to_string(path).await.map_err(io)?);
        let bytes = Zeroizing::new(BASE64.decode(text.trim()).map_err(|e| {
            AccessError::Service(format!("service key {} is not base64: {e}", path.display()))
        })?);
        return bytes.as_slice().try_into().map_err(|_| {
            AccessError::Service(format!(
                "service key {} is {} bytes (expected {KEY_SIZE})",
                path.display(),
                bytes.len()
            ))
        });
    }

    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io)?;
    }
    let encoded = Zeroizing::new(BASE64.encode(key));
    tokio::fs::write(path, encoded.as_bytes()).await.map_err(io)?;
    info!(path = %path.display(), "generated access-control key");
    Ok(key)
}

async fn load_or_create_identity(path: &Path) -> Result<TransportIdentity, AccessError> {
    let io = |e: std::io::Error| AccessError::Transport(format!("{}: {e}", path.display()));

    if path.exists() {
        let text = Zeroizing::new(tokio::fs::read_to_string(path).await.map_err(io)?);
        return TransportIdentity::parse(&text).map_err(|e| AccessError::Transport(e.to_string()));
    }

    let identity = TransportIdentity::generate();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io)?;
    }
    let contents = Zeroizing::new(format!(
        "# public key: {}\n{}\n",
        identity.recipient(),
        identity.to_secret_string().as_str()
    ));
    tokio::fs::write(path, contents.as_bytes()).await.map_err(io)?;
    info!(path = %path.display(), recipient = %identity.recipient(), "generated transport identity");
    Ok(identity)
}
