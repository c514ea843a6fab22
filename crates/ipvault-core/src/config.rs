use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{IpvaultError, IpvaultResult};

/// Top-level configuration (loaded from ipvault.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpvaultConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub keystore: KeyStoreConfig,
    pub access: AccessConfig,
}

impl IpvaultConfig {
    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> IpvaultResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| IpvaultError::Config(format!("{}: {e}", path.display())))
    }
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_prefix("~/")) {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Gateway listen address serving /download/<id> (default: 127.0.0.1:8080)
    pub listen: String,
    /// Prometheus metrics endpoint (default: 127.0.0.1:9100)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend service: "s3", "fs" or "memory"
    pub backend: String,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Root directory for the "fs" backend
    pub root: PathBuf,
    /// Key prefix under which blobs are written
    pub prefix: String,
    /// Enforce HTTPS for S3 connections
    pub enforce_tls: bool,
}

/// Chunked upload tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Base chunk size in bytes (default: 1 MiB)
    pub chunk_size: u64,
    /// Grow the chunk size for large files so they need at most `max_chunks` chunks
    pub adaptive_chunking: bool,
    /// Target chunk count used by adaptive sizing (default: 16)
    pub max_chunks: u64,
    /// Upper bound for a single chunk in bytes (default: 100 MiB)
    pub max_chunk_size: u64,
    /// Concurrent chunk uploads in flight (default: 4)
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStoreConfig {
    /// Key store file; in-memory only when unset
    pub path: Option<PathBuf>,
    /// Lifetime of manually opened manifests in seconds (default: 300)
    pub manual_manifest_ttl_secs: u64,
    /// Entries older than this are purged on start-up (default: 24h)
    pub max_age_secs: u64,
}

/// Access-control service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Enable policy-gated manifests; uploads fall back to a plain bundle when false
    pub enabled: bool,
    /// Service secret file (base64, created on first use)
    pub service_key_file: Option<PathBuf>,
    /// age identity used for enhanced-security transport sealing
    pub transport_identity_file: Option<PathBuf>,
    /// Key that signs and verifies bearer session tokens (base64, created on first use)
    pub session_key_file: Option<PathBuf>,
    /// JSON balance ledger consulted when evaluating conditions
    pub ledger_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".into(),
            metrics_addr: Some("127.0.0.1:9100".into()),
            log_level: "info".into(),
            log_format: "json".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "fs".into(),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "ipvault".into(),
            root: PathBuf::from("~/.local/share/ipvault/blobs"),
            prefix: "ipvault".into(),
            enforce_tls: false,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            adaptive_chunking: true,
            max_chunks: 16,
            max_chunk_size: 100 * 1024 * 1024,
            concurrency: 4,
        }
    }
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("~/.local/share/ipvault/keystore.json")),
            manual_manifest_ttl_secs: 300,
            max_age_secs: 24 * 60 * 60,
        }
    }
}
