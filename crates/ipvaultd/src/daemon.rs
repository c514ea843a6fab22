//! Daemon lifecycle: storage, key store, access control, gateway and metrics

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use ipvault_access::{AccessControlService, LocalAccessControl};
use ipvault_core::config::IpvaultConfig;
use ipvault_core::{Clock, SystemClock};
use ipvault_keystore::KeyStore;
use ipvault_pipeline::DownloadOrchestrator;
use ipvault_storage::{BlobStore, OpendalBlobStore};

use crate::gateway::{self, AppState};
use crate::metrics::{GatewayMetrics, HealthState};

/// How often expired manifest-mode entries are swept.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(config: IpvaultConfig) -> Result<()> {
    info!("daemon starting");

    // ── Storage ──────────────────────────────────────────────────────────
    let (access_key, secret_key) = s3_credentials(&config.storage.backend)?;
    let operator = ipvault_storage::build_from_core_config(
        &config.storage,
        &access_key,
        secret_key.expose_secret(),
    )
    .context("building storage operator")?;
    match ipvault_storage::check_health(&operator).await {
        Ok(()) => info!(backend = %config.storage.backend, "storage: connected"),
        Err(e) => warn!(backend = %config.storage.backend, "storage: {e}"),
    }
    let store: Arc<dyn BlobStore> = Arc::new(OpendalBlobStore::new(
        operator.clone(),
        config.storage.prefix.clone(),
    ));

    // ── Key store ────────────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let keystore = Arc::new(
        KeyStore::open(&config.keystore, clock.clone()).context("opening key store")?,
    );
    let max_age = Duration::from_secs(config.keystore.max_age_secs);
    match keystore.purge_older_than(max_age) {
        Ok(n) if n > 0 => info!(purged = n, "dropped old key store entries"),
        Ok(_) => {}
        Err(e) => warn!("key store purge failed: {e}"),
    }
    tokio::spawn(purge_loop(keystore.clone()));

    // ── Access control ───────────────────────────────────────────────────
    let access: Option<Arc<dyn AccessControlService>> = if config.access.enabled {
        let service = LocalAccessControl::from_config(&config.access, clock.clone())
            .await
            .context("initializing access control")?;
        info!("access control: enabled");
        Some(Arc::new(service))
    } else {
        warn!("access control disabled; only manifest mode downloads are available");
        None
    };

    // ── Metrics ──────────────────────────────────────────────────────────
    let mut registry = Registry::default();
    let metrics = GatewayMetrics::new(&mut registry);
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let health = HealthState {
            registry: Arc::new(registry),
            operator,
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, health).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    // ── Gateway ──────────────────────────────────────────────────────────
    let downloads = Arc::new(DownloadOrchestrator::new(
        store.clone(),
        access,
        keystore,
        clock,
        Duration::from_secs(config.keystore.manual_manifest_ttl_secs),
    ));
    let app = gateway::router(AppState {
        downloads,
        store,
        metrics,
    });

    let listener = tokio::net::TcpListener::bind(&config.daemon.listen)
        .await
        .with_context(|| format!("gateway bind {}", config.daemon.listen))?;
    info!(addr = %config.daemon.listen, "gateway: listening on /download, /api");

    notify_ready();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server")?;

    info!("daemon stopped");
    Ok(())
}

/// S3 keys come from the environment; other backends need none.
fn s3_credentials(backend: &str) -> Result<(String, SecretString)> {
    if backend != "s3" {
        return Ok((String::new(), SecretString::from(String::new())));
    }
    let access_key = std::env::var("AWS_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("IPVAULT_ACCESS_KEY_ID"))
        .context("S3 credentials not set: export AWS_ACCESS_KEY_ID")?;
    let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("IPVAULT_SECRET_ACCESS_KEY"))
        .context("AWS_SECRET_ACCESS_KEY not set")?;
    Ok((access_key, SecretString::from(secret_key)))
}

async fn purge_loop(keystore: Arc<KeyStore>) {
    let mut tick = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tick.tick().await;
        if let Err(e) = keystore.purge_expired() {
            warn!("expired entry sweep failed: {e}");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("installing ctrl-c handler: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn notify_ready() {
    // Send sd_notify(READY=1) to systemd if running as a service
    // Uses $NOTIFY_SOCKET env var; no-op if not set
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_s3_needs_no_credentials() {
        let (key, secret) = s3_credentials("memory").unwrap();
        assert!(key.is_empty());
        assert!(secret.expose_secret().is_empty());
    }
}
