//! ipvaultd: ipvault gateway daemon
//!
//! Usage:
//!   ipvaultd [--config /etc/ipvault/config.toml] [--log info] [--log-format json|text]
//!
//! Serves decrypted documents on `/download/<id>` and the manifest API on
//! `/api`; Prometheus metrics on the configured metrics address.

mod daemon;
mod gateway;
mod metrics;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use ipvault_core::config::IpvaultConfig;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ipvaultd", version, about = "ipvault gateway daemon")]
struct Cli {
    /// Path to ipvault.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "IPVAULT_CONFIG",
        default_value = "/etc/ipvault/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [daemon].log_level
    #[arg(long, env = "IPVAULT_LOG")]
    log: Option<String>,

    /// Log format; overrides [daemon].log_format
    #[arg(long, env = "IPVAULT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Override [daemon].listen
    #[arg(long)]
    listen: Option<String>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config first: it supplies the logging defaults. Its warnings are
    // reported once logging is up.
    let (mut config, missing) = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.daemon.log_format.as_str() {
        "text" => LogFormat::Text,
        _ => LogFormat::Json,
    });
    init_logging(&level, &format);

    if missing {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }
    if let Some(listen) = cli.listen {
        config.daemon.listen = listen;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "ipvaultd starting"
    );

    daemon::run(config).await
}

/// Returns the config and whether the file was missing.
async fn load_config(path: &Path) -> Result<(IpvaultConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok((config, false))
    } else {
        Ok((IpvaultConfig::default(), true))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
