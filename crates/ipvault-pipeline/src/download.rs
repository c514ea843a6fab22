//! Download orchestrator: resolve a manifest into the key store, then serve
//! `/download/<id>` through the interceptor.
//!
//! Identifier-mode entries keep the policy they were released under. Every
//! resolve and every download of such an entry re-verifies the caller's
//! credential against that policy; only the key material is reused.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ipvault_access::{AccessControlService, AccessError};
use ipvault_core::{Clock, ContentAddress, Credential};
use ipvault_crypto::{AccessPolicy, ManifestEnvelope, MetadataBundle, ALGORITHM_AES_CTR};
use ipvault_keystore::KeyStore;
use ipvault_storage::BlobStore;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::intercept::{DecryptedResponse, DownloadInterceptor, Interception, DOWNLOAD_PREFIX};

/// Where a resolved document can be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTicket {
    pub identifier: String,
    pub url: String,
    /// Unix millis; `None` for session-scoped entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl DownloadTicket {
    fn new(identifier: String, expires_at: Option<u64>) -> Self {
        let url = format!("{DOWNLOAD_PREFIX}{identifier}");
        Self {
            identifier,
            url,
            expires_at,
        }
    }
}

pub struct DownloadOrchestrator {
    store: Arc<dyn BlobStore>,
    access: Option<Arc<dyn AccessControlService>>,
    keystore: Arc<KeyStore>,
    interceptor: DownloadInterceptor,
    clock: Arc<dyn Clock>,
    manual_ttl: Duration,
    /// identifier -> policy its key material was released under
    policies: Mutex<HashMap<String, AccessPolicy>>,
}

impl DownloadOrchestrator {
    pub fn new(
        store: Arc<dyn BlobStore>,
        access: Option<Arc<dyn AccessControlService>>,
        keystore: Arc<KeyStore>,
        clock: Arc<dyn Clock>,
        manual_ttl: Duration,
    ) -> Self {
        let interceptor = DownloadInterceptor::new(Arc::clone(&keystore), Arc::clone(&store));
        Self {
            store,
            access,
            keystore,
            interceptor,
            clock,
            manual_ttl,
            policies: Mutex::new(HashMap::new()),
        }
    }

    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    fn policies(&self) -> MutexGuard<'_, HashMap<String, AccessPolicy>> {
        self.policies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn access(&self) -> PipelineResult<&Arc<dyn AccessControlService>> {
        self.access.as_ref().ok_or_else(|| {
            PipelineError::Validation(
                "no access-control service configured; open the manifest directly".into(),
            )
        })
    }

    /// Resolve the envelope at `metadata_cid` for `credential`.
    ///
    /// The envelope address becomes the identifier. When the key material is
    /// already in the key store for this session the caller is still checked
    /// against the envelope's policy; only the decryption is skipped.
    pub async fn open_by_identifier(
        &self,
        metadata_cid: &ContentAddress,
        credential: &Credential,
    ) -> PipelineResult<DownloadTicket> {
        let id = metadata_cid.as_str();
        let access = self.access()?;

        let cached = self.policies().get(id).cloned();
        if let Some(policy) = cached {
            if self.keystore.contains(id)? {
                access
                    .authorize(&policy, credential)
                    .await
                    .map_err(|e| refused(e, id, credential))?;
                debug!(id, "key material already resolved this session");
                return Ok(DownloadTicket::new(id.to_string(), None));
            }
        }

        let raw = self.store.get(metadata_cid).await?;
        let envelope = ManifestEnvelope::from_json(&raw)?;
        let policy = envelope.access_control_conditions;
        let bundle_json = access
            .decrypt(&envelope.encrypted_manifest, &policy, credential)
            .await
            .map_err(|e| refused(e, id, credential))?;
        let bundle = MetadataBundle::from_json(&bundle_json)?;

        self.keystore
            .put_bundle(id, &bundle, ALGORITHM_AES_CTR, None)?;
        self.policies().insert(id.to_string(), policy);
        info!(
            id,
            name = %bundle.manifest.file_metadata.name,
            size = bundle.manifest.size(),
            "manifest resolved"
        );
        Ok(DownloadTicket::new(id.to_string(), None))
    }

    /// Register a pasted metadata bundle under a fresh short-lived identifier.
    pub fn open_manifest(&self, bundle_json: &[u8]) -> PipelineResult<DownloadTicket> {
        let bundle = MetadataBundle::from_json(bundle_json)?;
        let id = manual_identifier(self.clock.now_millis());

        self.keystore
            .put_bundle(&id, &bundle, ALGORITHM_AES_CTR, Some(self.manual_ttl))?;
        self.keystore.schedule_deletion(id.clone(), self.manual_ttl);

        let expires_at = self.clock.now_millis() + self.manual_ttl.as_millis() as u64;
        info!(id, ttl_secs = self.manual_ttl.as_secs(), "manifest opened");
        Ok(DownloadTicket::new(id, Some(expires_at)))
    }

    /// Run the interceptor for `id` on behalf of `credential`.
    ///
    /// Identifier-mode entries are served only to a verified credential that
    /// satisfies the entry's policy at request time. Manifest-mode and
    /// unknown identifiers need no credential.
    pub async fn intercept(
        &self,
        id: &str,
        credential: Option<&Credential>,
        range: Option<&str>,
        cancel: CancellationToken,
    ) -> PipelineResult<Interception> {
        let policy = self.policies().get(id).cloned();
        if let Some(policy) = policy {
            let credential = credential.ok_or_else(|| {
                PipelineError::Access(AccessError::Unauthenticated(format!(
                    "{id} was resolved under an access policy; credentials required"
                )))
            })?;
            self.access()?
                .authorize(&policy, credential)
                .await
                .map_err(|e| refused(e, id, credential))?;
        }

        let path = format!("{DOWNLOAD_PREFIX}{id}");
        Ok(self.interceptor.intercept(&path, range, cancel).await?)
    }

    /// Stream the decrypted document registered under `id`.
    pub async fn download(
        &self,
        id: &str,
        credential: Option<&Credential>,
        range: Option<&str>,
        cancel: CancellationToken,
    ) -> PipelineResult<DecryptedResponse> {
        match self.intercept(id, credential, range, cancel).await? {
            Interception::Respond(response) => Ok(response),
            Interception::Passthrough => Err(PipelineError::UnknownIdentifier(id.to_string())),
        }
    }
}

fn refused(e: AccessError, id: &str, credential: &Credential) -> PipelineError {
    match &e {
        AccessError::Denied(_) => info!(id, subject = credential.subject(), "access denied"),
        AccessError::Unauthenticated(_) => {
            info!(id, subject = credential.subject(), "credential rejected")
        }
        _ => {}
    }
    PipelineError::Access(e)
}

/// `manifest-<millis>-<8 random alphanumerics>`
fn manual_identifier(now_millis: u64) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("manifest-{now_millis}-{suffix}")
}
