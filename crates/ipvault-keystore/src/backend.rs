//! Key store backends.
//!
//! Two backends are available:
//!   - **JSON** (default): loads entirely into memory, flushed atomically via
//!     temp+rename. With no path it is a pure in-memory store.
//!   - **RocksDB** (behind the `rocksdb` feature): `manifests`, `cryptoKeys`
//!     and `createdAt` column families, one write batch per identifier.
//!
//! Both implement [`KeyStoreBackend`]; callers hold them behind one lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KeyStoreError, KeyStoreResult};
use crate::record::{KeyRow, ManifestRow, RowMeta};

/// Storage for the two tables, keyed by identifier.
pub trait KeyStoreBackend: Send {
    fn manifest(&self, id: &str) -> KeyStoreResult<Option<ManifestRow>>;

    fn key(&self, id: &str) -> KeyStoreResult<Option<KeyRow>>;

    /// Write whichever rows are given for `id` in one step.
    fn put_rows(
        &mut self,
        id: &str,
        manifest: Option<&ManifestRow>,
        key: Option<&KeyRow>,
    ) -> KeyStoreResult<()>;

    /// Drop both rows for `id`. Returns whether anything was removed.
    fn remove(&mut self, id: &str) -> KeyStoreResult<bool>;

    /// Lifecycle of every stored identifier.
    fn rows(&self) -> KeyStoreResult<Vec<RowMeta>>;

    /// Identifiers created strictly before `cutoff` (ms).
    fn created_before(&self, cutoff: u64) -> KeyStoreResult<Vec<String>> {
        Ok(self
            .rows()?
            .into_iter()
            .filter(|row| row.created_at < cutoff)
            .map(|row| row.id)
            .collect())
    }

    /// Flush pending changes to durable storage.
    fn flush(&mut self) -> KeyStoreResult<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    manifests: BTreeMap<String, ManifestRow>,
    #[serde(default, rename = "cryptoKeys")]
    crypto_keys: BTreeMap<String, KeyRow>,
}

/// In-memory tables, optionally persisted to a JSON file.
pub struct JsonKeyStore {
    path: Option<PathBuf>,
    tables: Tables,
    dirty: bool,
}

impl JsonKeyStore {
    /// Process-local store; nothing touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tables: Tables::default(),
            dirty: false,
        }
    }

    /// Load or create a store at `path`. A missing file is an empty store.
    pub fn open(path: &Path) -> KeyStoreResult<Self> {
        let tables = if path.exists() {
            let content = std::fs::read(path).map_err(|source| KeyStoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_slice(&content)?
        } else {
            Tables::default()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            tables,
            dirty: false,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl KeyStoreBackend for JsonKeyStore {
    fn manifest(&self, id: &str) -> KeyStoreResult<Option<ManifestRow>> {
        Ok(self.tables.manifests.get(id).cloned())
    }

    fn key(&self, id: &str) -> KeyStoreResult<Option<KeyRow>> {
        Ok(self.tables.crypto_keys.get(id).cloned())
    }

    fn put_rows(
        &mut self,
        id: &str,
        manifest: Option<&ManifestRow>,
        key: Option<&KeyRow>,
    ) -> KeyStoreResult<()> {
        if let Some(row) = manifest {
            self.tables.manifests.insert(id.to_string(), row.clone());
            self.dirty = true;
        }
        if let Some(row) = key {
            self.tables.crypto_keys.insert(id.to_string(), row.clone());
            self.dirty = true;
        }
        Ok(())
    }

    fn remove(&mut self, id: &str) -> KeyStoreResult<bool> {
        let had_manifest = self.tables.manifests.remove(id).is_some();
        let had_key = self.tables.crypto_keys.remove(id).is_some();
        let removed = had_manifest || had_key;
        self.dirty |= removed;
        Ok(removed)
    }

    fn rows(&self) -> KeyStoreResult<Vec<RowMeta>> {
        let mut ids: Vec<&String> = self
            .tables
            .manifests
            .keys()
            .chain(self.tables.crypto_keys.keys())
            .collect();
        ids.sort();
        ids.dedup();

        Ok(ids
            .into_iter()
            .filter_map(|id| {
                RowMeta::merge(
                    id,
                    self.tables.manifests.get(id),
                    self.tables.crypto_keys.get(id),
                )
            })
            .collect())
    }

    fn flush(&mut self) -> KeyStoreResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let Some(path) = &self.path else {
            self.dirty = false;
            return Ok(());
        };

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| KeyStoreError::Io { path, source }
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let json = serde_json::to_vec_pretty(&self.tables)?;

        // Atomic write: write to temp file, then rename
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &json).map_err(io_err(tmp_path.as_path()))?;
        std::fs::rename(&tmp_path, path).map_err(io_err(path.as_path()))?;

        self.dirty = false;
        Ok(())
    }
}

impl Drop for JsonKeyStore {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                tracing::warn!("failed to flush key store on drop: {e}");
            }
        }
    }
}

#[cfg(feature = "rocksdb")]
mod rocksdb_backend {
    use super::*;
    use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, DB};

    const CF_MANIFESTS: &str = "manifests";
    const CF_KEYS: &str = "cryptoKeys";
    const CF_CREATED: &str = "createdAt";

    /// RocksDB-backed key store. Writes go straight to the WAL, so `flush()`
    /// is a no-op.
    pub struct RocksDbKeyStore {
        db: DB,
    }

    impl RocksDbKeyStore {
        /// Open or create a RocksDB key store at the given path.
        pub fn open(path: &Path) -> KeyStoreResult<Self> {
            let mut opts = Options::default();
            opts.create_if_missing(true);
            opts.create_missing_column_families(true);

            let db = DB::open_cf(&opts, path, [CF_MANIFESTS, CF_KEYS, CF_CREATED])?;
            Ok(Self { db })
        }

        fn cf(&self, name: &'static str) -> KeyStoreResult<&ColumnFamily> {
            self.db
                .cf_handle(name)
                .ok_or(KeyStoreError::MissingColumnFamily(name))
        }

        fn get_json<T: serde::de::DeserializeOwned>(
            &self,
            cf: &'static str,
            id: &str,
        ) -> KeyStoreResult<Option<T>> {
            match self.db.get_cf(self.cf(cf)?, id.as_bytes())? {
                Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                    KeyStoreError::Corrupt {
                        id: id.to_string(),
                        reason: format!("{cf}: {e}"),
                    }
                }),
                None => Ok(None),
            }
        }
    }

    /// `createdAt` index key: zero-padded so byte order is time order.
    fn index_key(created_at: u64, id: &str) -> String {
        format!("{created_at:020}/{id}")
    }

    impl KeyStoreBackend for RocksDbKeyStore {
        fn manifest(&self, id: &str) -> KeyStoreResult<Option<ManifestRow>> {
            self.get_json(CF_MANIFESTS, id)
        }

        fn key(&self, id: &str) -> KeyStoreResult<Option<KeyRow>> {
            self.get_json(CF_KEYS, id)
        }

        fn put_rows(
            &mut self,
            id: &str,
            manifest: Option<&ManifestRow>,
            key: Option<&KeyRow>,
        ) -> KeyStoreResult<()> {
            let mut batch = WriteBatch::default();
            if let Some(row) = manifest {
                batch.put_cf(self.cf(CF_MANIFESTS)?, id, serde_json::to_vec(row)?);
                batch.put_cf(self.cf(CF_CREATED)?, index_key(row.created_at, id), b"");
            }
            if let Some(row) = key {
                batch.put_cf(self.cf(CF_KEYS)?, id, serde_json::to_vec(row)?);
                batch.put_cf(self.cf(CF_CREATED)?, index_key(row.created_at, id), b"");
            }
            self.db.write(batch)?;
            Ok(())
        }

        fn remove(&mut self, id: &str) -> KeyStoreResult<bool> {
            let manifest = self.manifest(id)?;
            let key = self.key(id)?;
            if manifest.is_none() && key.is_none() {
                return Ok(false);
            }

            let mut batch = WriteBatch::default();
            batch.delete_cf(self.cf(CF_MANIFESTS)?, id);
            batch.delete_cf(self.cf(CF_KEYS)?, id);
            for created_at in [
                manifest.map(|m| m.created_at),
                key.map(|k| k.created_at),
            ]
            .into_iter()
            .flatten()
            {
                batch.delete_cf(self.cf(CF_CREATED)?, index_key(created_at, id));
            }
            self.db.write(batch)?;
            Ok(true)
        }

        fn rows(&self) -> KeyStoreResult<Vec<RowMeta>> {
            let mut ids = Vec::new();
            for cf in [CF_MANIFESTS, CF_KEYS] {
                for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
                    let (key, _) = item?;
                    ids.push(String::from_utf8_lossy(&key).into_owned());
                }
            }
            ids.sort();
            ids.dedup();

            let mut rows = Vec::with_capacity(ids.len());
            for id in ids {
                let manifest = self.manifest(&id)?;
                let key = self.key(&id)?;
                if let Some(meta) = RowMeta::merge(&id, manifest.as_ref(), key.as_ref()) {
                    rows.push(meta);
                }
            }
            Ok(rows)
        }

        fn created_before(&self, cutoff: u64) -> KeyStoreResult<Vec<String>> {
            let mut ids = Vec::new();
            for item in self.db.iterator_cf(self.cf(CF_CREATED)?, IteratorMode::Start) {
                let (key, _) = item?;
                let key = String::from_utf8_lossy(&key);
                let Some((stamp, id)) = key.split_once('/') else {
                    continue;
                };
                match stamp.parse::<u64>() {
                    Ok(created_at) if created_at < cutoff => ids.push(id.to_string()),
                    Ok(_) => break,
                    Err(_) => continue,
                }
            }
            ids.sort();
            ids.dedup();
            Ok(ids)
        }

        fn flush(&mut self) -> KeyStoreResult<()> {
            Ok(())
        }
    }
}

#[cfg(feature = "rocksdb")]
pub use rocksdb_backend::RocksDbKeyStore;

/// Open the backend for `path`.
///
/// `None` is in-memory. Paths ending in `.json` use the JSON backend;
/// anything else is RocksDB when compiled with the `rocksdb` feature.
pub fn open_backend(path: Option<&Path>) -> KeyStoreResult<Box<dyn KeyStoreBackend>> {
    let Some(path) = path else {
        return Ok(Box::new(JsonKeyStore::in_memory()));
    };

    let is_json = path.extension().is_some_and(|ext| ext == "json");

    #[cfg(feature = "rocksdb")]
    if !is_json {
        return Ok(Box::new(RocksDbKeyStore::open(path)?));
    }

    #[cfg(not(feature = "rocksdb"))]
    if !is_json {
        tracing::warn!(
            path = %path.display(),
            "RocksDB not compiled in (missing 'rocksdb' feature), falling back to JSON backend"
        );
    }

    Ok(Box::new(JsonKeyStore::open(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_row(created_at: u64, expires_at: Option<u64>) -> KeyRow {
        KeyRow {
            wrapped_key: "AA==".into(),
            iv: "AA==".into(),
            algorithm: "AES-CTR".into(),
            epoch: "0000".into(),
            created_at,
            expires_at,
        }
    }

    #[test]
    fn open_nonexistent_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonKeyStore::open(&dir.path().join("keys.json")).unwrap();
        assert!(store.rows().unwrap().is_empty());
    }

    #[test]
    fn put_flush_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/keys.json");

        let mut store = JsonKeyStore::open(&path).unwrap();
        store.put_rows("doc", None, Some(&key_row(10, None))).unwrap();
        store.flush().unwrap();

        let reloaded = JsonKeyStore::open(&path).unwrap();
        assert_eq!(reloaded.key("doc").unwrap(), Some(key_row(10, None)));

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"cryptoKeys\""));
        assert!(raw.contains("\"manifests\""));
    }

    #[test]
    fn remove_reports_presence() {
        let mut store = JsonKeyStore::in_memory();
        store.put_rows("a", None, Some(&key_row(1, None))).unwrap();
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
    }

    #[test]
    fn created_before_filters_by_time() {
        let mut store = JsonKeyStore::in_memory();
        store.put_rows("old", None, Some(&key_row(5, None))).unwrap();
        store.put_rows("new", None, Some(&key_row(50, None))).unwrap();
        assert_eq!(store.created_before(10).unwrap(), vec!["old".to_string()]);
    }

    #[test]
    fn in_memory_flush_is_noop() {
        let mut store = JsonKeyStore::in_memory();
        store.put_rows("a", None, Some(&key_row(1, None))).unwrap();
        store.flush().unwrap();
        assert!(store.path().is_none());
    }

    #[test]
    fn open_backend_none_is_memory() {
        let backend = open_backend(None).unwrap();
        assert!(backend.rows().unwrap().is_empty());
    }
}
