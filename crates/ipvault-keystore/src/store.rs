//! Session-scoped key store.
//!
//! Content keys are wrapped under a [`StoreKey`] that lives only in this
//! process. Rows written under a different store key (a previous session)
//! cannot be unwrapped; they are treated as absent and purged on read.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ipvault_core::config::{expand_tilde, KeyStoreConfig};
use ipvault_core::Clock;
use ipvault_crypto::{unwrap_handle, wrap_key, ContentKey, Iv, KeyHandle, Manifest, MetadataBundle, StoreKey};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{open_backend, KeyStoreBackend};
use crate::error::{KeyStoreError, KeyStoreResult};
use crate::record::{KeyRow, ManifestRow};

/// A complete, unexpired entry: everything a download needs.
#[derive(Debug)]
pub struct KeyStoreEntry {
    pub identifier: String,
    pub manifest: Manifest,
    pub key: KeyHandle,
    pub iv: Iv,
    pub algorithm: String,
    pub created_at: u64,
    pub expires_at: Option<u64>,
}

pub struct KeyStore {
    backend: Mutex<Box<dyn KeyStoreBackend>>,
    store_key: StoreKey,
    epoch: String,
    clock: Arc<dyn Clock>,
}

impl KeyStore {
    /// Fresh session over `backend`.
    pub fn new(backend: Box<dyn KeyStoreBackend>, clock: Arc<dyn Clock>) -> Self {
        Self::with_store_key(backend, StoreKey::generate(), clock)
    }

    pub fn with_store_key(
        backend: Box<dyn KeyStoreBackend>,
        store_key: StoreKey,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let epoch = store_key.epoch();
        Self {
            backend: Mutex::new(backend),
            store_key,
            epoch,
            clock,
        }
    }

    /// Open the backend named by the `[keystore]` config section.
    pub fn open(config: &KeyStoreConfig, clock: Arc<dyn Clock>) -> KeyStoreResult<Self> {
        let path = config.path.as_deref().map(expand_tilde);
        let backend = open_backend(path.as_deref())?;
        let store = Self::new(backend, clock);
        info!(
            path = ?path,
            epoch = %store.epoch,
            "key store opened"
        );
        Ok(store)
    }

    /// Tag of this session's store key.
    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn KeyStoreBackend>> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifetime(&self, ttl: Option<Duration>) -> (u64, Option<u64>) {
        let now = self.clock.now_millis();
        let expires_at = ttl.map(|ttl| now.saturating_add(ttl.as_millis() as u64));
        (now, expires_at)
    }

    fn manifest_row(&self, manifest: &Manifest, ttl: Option<Duration>) -> ManifestRow {
        let (created_at, expires_at) = self.lifetime(ttl);
        ManifestRow {
            manifest: manifest.clone(),
            created_at,
            expires_at,
        }
    }

    fn key_row(
        &self,
        key: &ContentKey,
        iv: &Iv,
        algorithm: &str,
        ttl: Option<Duration>,
    ) -> KeyStoreResult<KeyRow> {
        let (created_at, expires_at) = self.lifetime(ttl);
        Ok(KeyRow {
            wrapped_key: BASE64.encode(wrap_key(&self.store_key, key)?),
            iv: BASE64.encode(iv.as_bytes()),
            algorithm: algorithm.to_string(),
            epoch: self.epoch.clone(),
            created_at,
            expires_at,
        })
    }

    /// Write rows for `id` and flush. A failed flush restores the rows
    /// `id` had before, so memory never runs ahead of disk.
    fn write_rows(
        &self,
        id: &str,
        manifest: Option<&ManifestRow>,
        key: Option<&KeyRow>,
    ) -> KeyStoreResult<()> {
        let mut backend = self.lock();
        let before = (backend.manifest(id)?, backend.key(id)?);
        backend.put_rows(id, manifest, key)?;

        let Err(e) = backend.flush() else {
            return Ok(());
        };
        warn!(id, error = %e, "key store flush failed, rolling back");
        let undo = backend
            .remove(id)
            .and_then(|_| backend.put_rows(id, before.0.as_ref(), before.1.as_ref()));
        if let Err(undo) = undo {
            warn!(id, error = %undo, "key store rollback failed");
        }
        Err(e)
    }

    /// Store the manifest row for `id`.
    pub fn put_manifest(
        &self,
        id: &str,
        manifest: &Manifest,
        ttl: Option<Duration>,
    ) -> KeyStoreResult<()> {
        let row = self.manifest_row(manifest, ttl);
        self.write_rows(id, Some(&row), None)
    }

    /// Wrap and store the content key row for `id`.
    pub fn put_key(
        &self,
        id: &str,
        key: &ContentKey,
        iv: &Iv,
        algorithm: &str,
        ttl: Option<Duration>,
    ) -> KeyStoreResult<()> {
        let row = self.key_row(key, iv, algorithm, ttl)?;
        self.write_rows(id, None, Some(&row))
    }

    /// Store both rows for `id` in one step.
    pub fn put_bundle(
        &self,
        id: &str,
        bundle: &MetadataBundle,
        algorithm: &str,
        ttl: Option<Duration>,
    ) -> KeyStoreResult<()> {
        let manifest = self.manifest_row(&bundle.manifest, ttl);
        let key = self.key_row(&bundle.key, &bundle.iv, algorithm, ttl)?;
        self.write_rows(id, Some(&manifest), Some(&key))?;
        debug!(id, expires_at = ?manifest.expires_at, "key store entry written");
        Ok(())
    }

    /// Look up `id`. Expired and stale-session entries are purged and
    /// reported as absent; so are half-written entries.
    pub fn get(&self, id: &str) -> KeyStoreResult<Option<KeyStoreEntry>> {
        let now = self.clock.now_millis();
        let mut backend = self.lock();

        let (Some(manifest), Some(key)) = (backend.manifest(id)?, backend.key(id)?) else {
            return Ok(None);
        };

        let expires_at = [manifest.expires_at, key.expires_at]
            .into_iter()
            .flatten()
            .min();
        if expires_at.is_some_and(|at| now >= at) {
            debug!(id, "key store entry expired");
            backend.remove(id)?;
            backend.flush()?;
            return Ok(None);
        }

        if key.epoch != self.epoch {
            debug!(id, row_epoch = %key.epoch, "key store entry from a previous session");
            backend.remove(id)?;
            backend.flush()?;
            return Ok(None);
        }

        let decode = |field: &str, value: &str| {
            BASE64.decode(value).map_err(|e| KeyStoreError::Corrupt {
                id: id.to_string(),
                reason: format!("{field}: {e}"),
            })
        };
        let wrapped = decode("wrappedKey", &key.wrapped_key)?;
        let iv = Iv::from_slice(&decode("iv", &key.iv)?)?;

        let handle = match unwrap_handle(&self.store_key, &wrapped) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(id, error = %e, "key store entry failed to unwrap, purging");
                backend.remove(id)?;
                backend.flush()?;
                return Ok(None);
            }
        };

        Ok(Some(KeyStoreEntry {
            identifier: id.to_string(),
            manifest: manifest.manifest,
            key: handle,
            iv,
            algorithm: key.algorithm,
            created_at: manifest.created_at.min(key.created_at),
            expires_at,
        }))
    }

    /// Whether `get(id)` would currently return an entry.
    pub fn contains(&self, id: &str) -> KeyStoreResult<bool> {
        let now = self.clock.now_millis();
        let backend = self.lock();
        let (Some(manifest), Some(key)) = (backend.manifest(id)?, backend.key(id)?) else {
            return Ok(false);
        };
        let expired = [manifest.expires_at, key.expires_at]
            .into_iter()
            .flatten()
            .any(|at| now >= at);
        Ok(!expired && key.epoch == self.epoch)
    }

    pub fn delete(&self, id: &str) -> KeyStoreResult<bool> {
        let mut backend = self.lock();
        let removed = backend.remove(id)?;
        backend.flush()?;
        if removed {
            debug!(id, "key store entry deleted");
        }
        Ok(removed)
    }

    /// Number of identifiers with at least one row.
    pub fn len(&self) -> KeyStoreResult<usize> {
        Ok(self.lock().rows()?.len())
    }

    pub fn is_empty(&self) -> KeyStoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop every entry past its `expiresAt`. Returns how many went.
    pub fn purge_expired(&self) -> KeyStoreResult<usize> {
        let now = self.clock.now_millis();
        let mut backend = self.lock();
        let expired: Vec<String> = backend
            .rows()?
            .into_iter()
            .filter(|row| row.is_expired(now))
            .map(|row| row.id)
            .collect();
        for id in &expired {
            backend.remove(id)?;
        }
        backend.flush()?;
        if !expired.is_empty() {
            info!(count = expired.len(), "purged expired key store entries");
        }
        Ok(expired.len())
    }

    /// Drop every entry created more than `max_age` ago.
    pub fn purge_older_than(&self, max_age: Duration) -> KeyStoreResult<usize> {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(max_age.as_millis() as u64);
        let mut backend = self.lock();
        let old = backend.created_before(cutoff)?;
        for id in &old {
            backend.remove(id)?;
        }
        backend.flush()?;
        if !old.is_empty() {
            info!(count = old.len(), max_age_secs = max_age.as_secs(), "purged old key store entries");
        }
        Ok(old.len())
    }

    /// Delete `id` after `after` elapses (tokio time).
    pub fn schedule_deletion(self: &Arc<Self>, id: String, after: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            match store.delete(&id) {
                Ok(true) => info!(id, "scheduled key store deletion completed"),
                Ok(false) => debug!(id, "scheduled deletion found nothing to delete"),
                Err(e) => warn!(id, error = %e, "scheduled key store deletion failed"),
            }
        })
    }
}
