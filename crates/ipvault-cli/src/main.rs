//! ipvault: protect documents and fetch them back
//!
//! Commands:
//!   upload <file> --contract <addr> --token-id <id>   - encrypt, upload and lock behind a token policy
//!   download <metadataCid> [-o <out>]                  - resolve an envelope and decrypt the document
//!   open-manifest <bundle.json> [-o <out>]             - decrypt using a metadata bundle directly
//!   session issue <address> [--ttl <secs>]             - mint a bearer token for a wallet address
//!   config show                                        - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use ipvault_access::{AccessControlService, LocalAccessControl, SessionTokens};
use ipvault_core::config::IpvaultConfig;
use ipvault_core::{Clock, ContentAddress, Credential, SystemClock};
use ipvault_crypto::{AccessPolicy, AssetTarget};
use ipvault_keystore::KeyStore;
use ipvault_pipeline::{
    preview_input, DecryptedResponse, DownloadOrchestrator, FileInput, ProgressFn,
    UploadOptions, UploadOrchestrator, UploadReceipt, UploadRequest,
};
use ipvault_storage::{BlobStore, OpendalBlobStore};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "ipvault",
    version,
    about = "ipvault document protection client",
    long_about = "ipvault: encrypt documents client-side, store them content-addressed, \
                  and release the keys only to token holders"
)]
struct Cli {
    /// Path to ipvault.toml configuration file
    #[arg(long, short = 'c', env = "IPVAULT_CONFIG", default_value = "/etc/ipvault/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "IPVAULT_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

/// Caller identity presented to the access-control service.
#[derive(clap::Args, Debug)]
struct SessionArgs {
    /// Wallet address of the caller
    #[arg(long, env = "IPVAULT_SUBJECT")]
    subject: String,

    /// Session bearer token
    #[arg(long, env = "IPVAULT_BEARER", hide_env_values = true)]
    bearer: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a file and upload it under a token-gated policy
    ///
    /// Prints the upload result as JSON: rootCid plus metadataCid, or the raw
    /// metadataBundle when access control is disabled.
    Upload {
        /// File to protect
        file: PathBuf,
        /// ERC-1155 contract whose token unlocks the document
        #[arg(long)]
        contract: String,
        /// Token id within the contract
        #[arg(long)]
        token_id: String,
        /// Chain the contract lives on
        #[arg(long, default_value = "ethereum")]
        chain: String,
        /// Also grant access to this wallet address
        #[arg(long)]
        recipient: Option<String>,
        /// Seal the manifest to the access-control service's transport key
        #[arg(long)]
        enhanced_security: bool,
        /// Also upload a downsampled public preview (text files only)
        #[arg(long)]
        with_preview: bool,
        /// Content type recorded in the manifest (default: guessed from extension)
        #[arg(long)]
        content_type: Option<String>,
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Resolve an envelope by its metadataCid and write the decrypted document
    Download {
        /// Envelope address returned by `upload`
        metadata_cid: String,
        /// Output path (default: file name recorded in the manifest)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// Byte range to fetch, e.g. "bytes=0-1023"
        #[arg(long)]
        range: Option<String>,
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Decrypt a document using a metadata bundle file
    #[command(name = "open-manifest")]
    OpenManifest {
        /// Metadata bundle JSON (as printed by `upload` without access control)
        bundle: PathBuf,
        /// Output path (default: file name recorded in the manifest)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// Byte range to fetch, e.g. "bytes=0-1023"
        #[arg(long)]
        range: Option<String>,
    },

    /// Session token management
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum SessionAction {
    /// Print a bearer token for ADDRESS signed with the configured session key
    Issue {
        /// Wallet address the token is bound to
        address: String,
        /// Token lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: u64,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);
    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
        Commands::Session {
            action: SessionAction::Issue { address, ttl },
        } => cmd_session_issue(&config, &address, Duration::from_secs(ttl)).await,
        Commands::Upload {
            file,
            contract,
            token_id,
            chain,
            recipient,
            enhanced_security,
            with_preview,
            content_type,
            session,
        } => {
            let target = AssetTarget::new(contract, chain, token_id).context("invalid contract")?;
            cmd_upload(
                &config,
                &file,
                &target,
                UploadFlags {
                    recipient,
                    enhanced_security,
                    with_preview,
                    content_type,
                },
                &session.credential()?,
            )
            .await
        }
        Commands::Download {
            metadata_cid,
            output,
            range,
            session,
        } => {
            cmd_download(
                &config,
                &metadata_cid,
                output.as_deref(),
                range.as_deref(),
                &session.credential()?,
            )
            .await
        }
        Commands::OpenManifest {
            bundle,
            output,
            range,
        } => cmd_open_manifest(&config, &bundle, output.as_deref(), range.as_deref()).await,
    }
}

impl SessionArgs {
    fn credential(&self) -> Result<Credential> {
        Credential::new(&self.subject, &self.bearer).context("invalid session credential")
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Config loading ────────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<IpvaultConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        tracing::warn!("config file not found: {}  (using defaults)", path.display());
        Ok(IpvaultConfig::default())
    }
}

// ── Pipeline wiring ───────────────────────────────────────────────────────────

/// Blob store from the `[storage]` section.
///
/// S3 keys come from AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY.
fn build_store(config: &IpvaultConfig) -> Result<Arc<dyn BlobStore>> {
    let (access_key, secret_key) = if config.storage.backend == "s3" {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID")
            .or_else(|_| std::env::var("IPVAULT_ACCESS_KEY_ID"))
            .context(
                "S3 credentials not set\n\
                 Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.\n\
                 Example:\n\
                 \texport AWS_ACCESS_KEY_ID=your-key\n\
                 \texport AWS_SECRET_ACCESS_KEY=your-secret",
            )?;
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .or_else(|_| std::env::var("IPVAULT_SECRET_ACCESS_KEY"))
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        (access_key, SecretString::from(secret_key))
    } else {
        (String::new(), SecretString::from(String::new()))
    };

    let op = ipvault_storage::build_from_core_config(
        &config.storage,
        &access_key,
        secret_key.expose_secret(),
    )
    .context("building storage operator")?;
    Ok(Arc::new(OpendalBlobStore::new(op, config.storage.prefix.clone())))
}

async fn build_access(config: &IpvaultConfig) -> Result<Option<Arc<dyn AccessControlService>>> {
    if !config.access.enabled {
        return Ok(None);
    }
    let service = LocalAccessControl::from_config(&config.access, Arc::new(SystemClock))
        .await
        .context("initializing access control")?;
    Ok(Some(Arc::new(service)))
}

async fn build_downloads(config: &IpvaultConfig) -> Result<DownloadOrchestrator> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let keystore =
        Arc::new(KeyStore::open(&config.keystore, clock.clone()).context("opening key store")?);
    Ok(DownloadOrchestrator::new(
        build_store(config)?,
        build_access(config).await?,
        keystore,
        clock,
        Duration::from_secs(config.keystore.manual_manifest_ttl_secs),
    ))
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str, template: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn step_bar(prefix: &str) -> ProgressBar {
    make_progress_bar(0, prefix, "{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
}

fn byte_bar(total: u64, prefix: &str) -> ProgressBar {
    make_progress_bar(
        total,
        prefix,
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    )
}

// ── `ipvault upload` ──────────────────────────────────────────────────────────

struct UploadFlags {
    recipient: Option<String>,
    enhanced_security: bool,
    with_preview: bool,
    content_type: Option<String>,
}

async fn cmd_upload(
    config: &IpvaultConfig,
    path: &Path,
    target: &AssetTarget,
    flags: UploadFlags,
    session: &Credential,
) -> Result<()> {
    let orchestrator = UploadOrchestrator::new(
        build_store(config)?,
        build_access(config).await?,
        Arc::new(SystemClock),
        UploadOptions::from(&config.upload),
    );

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let content_type = flags
        .content_type
        .unwrap_or_else(|| guess_content_type(path).to_string());
    let reader = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let size = reader
        .metadata()
        .await
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    let file = FileInput {
        name: name.clone(),
        content_type,
        size,
        reader,
    };

    eprintln!(
        "Protecting {} ({}) for {}:{} #{}",
        path.display(),
        fmt_bytes(size),
        target.chain,
        target.contract_address,
        target.token_id,
    );

    let pb = step_bar("upload");
    let pb_clone = pb.clone();
    let progress: ProgressFn = Box::new(move |done, total, msg| {
        pb_clone.set_length(total);
        pb_clone.set_position(done);
        pb_clone.set_message(msg.to_string());
    });

    let mut rng = OsRng;
    if flags.with_preview {
        let text = read_preview_text(path).await?;
        let preview = preview_input(&name, &text, &mut rng);
        let asset = orchestrator
            .protect(
                file,
                preview,
                target,
                flags.recipient,
                flags.enhanced_security,
                session,
                &mut rng,
                Some(&progress),
            )
            .await
            .context("upload failed")?;
        pb.finish_with_message("done".to_string());
        print_receipt("document", &asset.document)?;
        print_receipt("preview", &asset.preview)?;
    } else {
        let receipt = orchestrator
            .upload(
                UploadRequest {
                    file,
                    policy: AccessPolicy::full_content(target),
                    recipient: flags.recipient,
                    enhanced_security: flags.enhanced_security,
                },
                session,
                &mut rng,
                Some(&progress),
            )
            .await
            .context("upload failed")?;
        pb.finish_with_message("done".to_string());
        print_receipt("document", &receipt)?;
    }
    Ok(())
}

/// Leading text the public preview is sampled from.
const PREVIEW_SOURCE_LIMIT: u64 = 64 * 1024;

/// First [`PREVIEW_SOURCE_LIMIT`] bytes of `path` as UTF-8, cut back to the
/// last whole character.
async fn read_preview_text(path: &Path) -> Result<String> {
    let mut head = Vec::new();
    tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?
        .take(PREVIEW_SOURCE_LIMIT)
        .read_to_end(&mut head)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    utf8_prefix(head).context("--with-preview needs a UTF-8 text document")
}

fn utf8_prefix(bytes: Vec<u8>) -> Result<String, std::string::FromUtf8Error> {
    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        // Only a truncated trailing character: drop it.
        Err(e) if e.utf8_error().error_len().is_none() => {
            let valid = e.utf8_error().valid_up_to();
            let mut bytes = e.into_bytes();
            bytes.truncate(valid);
            String::from_utf8(bytes)
        }
        Err(e) => Err(e),
    }
}

fn print_receipt(label: &str, receipt: &UploadReceipt) -> Result<()> {
    eprintln!(
        "  {label}: {} chunks, {}, sha256 {}",
        receipt.chunk_count,
        fmt_bytes(receipt.size),
        &receipt.file_hash[..16.min(receipt.file_hash.len())]
    );
    if receipt.metadata_bundle.is_some() {
        eprintln!("  access control is disabled: keep the metadata bundle below secret");
    }
    let json = serde_json::to_string_pretty(&receipt.summary()).context("serializing result")?;
    println!("{json}");
    Ok(())
}

// ── `ipvault download` / `ipvault open-manifest` ──────────────────────────────

async fn cmd_download(
    config: &IpvaultConfig,
    metadata_cid: &str,
    output: Option<&Path>,
    range: Option<&str>,
    session: &Credential,
) -> Result<()> {
    let downloads = build_downloads(config).await?;
    let cid = ContentAddress::parse(metadata_cid).context("invalid metadataCid")?;
    let ticket = downloads
        .open_by_identifier(&cid, session)
        .await
        .with_context(|| format!("resolving {metadata_cid}"))?;
    let response = downloads
        .download(&ticket.identifier, Some(session), range, CancellationToken::new())
        .await
        .context("starting download")?;
    write_response(response, output).await
}

async fn cmd_open_manifest(
    config: &IpvaultConfig,
    bundle: &Path,
    output: Option<&Path>,
    range: Option<&str>,
) -> Result<()> {
    let downloads = build_downloads(config).await?;
    let raw = tokio::fs::read(bundle)
        .await
        .with_context(|| format!("reading {}", bundle.display()))?;
    let ticket = downloads.open_manifest(&raw).context("invalid metadata bundle")?;
    let response = downloads
        .download(&ticket.identifier, None, range, CancellationToken::new())
        .await
        .context("starting download")?;
    write_response(response, output).await
}

/// Stream to `<out>.part`, renamed into place only once the file hash checks out.
async fn write_response(response: DecryptedResponse, output: Option<&Path>) -> Result<()> {
    let DecryptedResponse { meta, mut body, .. } = response;
    let out = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output(&meta.filename));
    let part = out.with_extension(match out.extension() {
        Some(ext) => format!("{}.part", ext.to_string_lossy()),
        None => "part".to_string(),
    });

    eprintln!("Downloading {} → {}", meta.filename, out.display());
    let pb = byte_bar(meta.content_length, "download");
    let mut file = tokio::fs::File::create(&part)
        .await
        .with_context(|| format!("creating {}", part.display()))?;

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                pb.abandon_with_message("failed".to_string());
                drop(file);
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e).context("download failed");
            }
        };
        file.write_all(&chunk)
            .await
            .with_context(|| format!("writing {}", part.display()))?;
        pb.inc(chunk.len() as u64);
    }
    file.flush().await.context("flushing output")?;
    drop(file);
    tokio::fs::rename(&part, &out)
        .await
        .with_context(|| format!("moving {} into place", out.display()))?;

    pb.finish_with_message("done".to_string());
    eprintln!("  type:   {}", meta.content_type);
    eprintln!("  bytes:  {}", fmt_bytes(meta.content_length));
    if let Some(range) = meta.range {
        eprintln!("  range:  {}", range.content_range(meta.total_size));
    }
    Ok(())
}

/// Manifest file names are untrusted: keep only the final component.
fn default_output(filename: &str) -> PathBuf {
    let base = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty() && n != "..")
        .unwrap_or_else(|| "download.bin".to_string());
    PathBuf::from(base)
}

// ── `ipvault session issue` ───────────────────────────────────────────────────

async fn cmd_session_issue(config: &IpvaultConfig, address: &str, ttl: Duration) -> Result<()> {
    if config.access.session_key_file.is_none() {
        anyhow::bail!(
            "access.session_key_file is not set; a token from a throwaway key would \
             not be accepted by anyone"
        );
    }
    let tokens = SessionTokens::from_config(&config.access, Arc::new(SystemClock))
        .await
        .context("loading session key")?;
    let token = tokens.issue(address, ttl).context("issuing session token")?;
    eprintln!("token for {address}, valid {}s", ttl.as_secs());
    println!("{token}");
    Ok(())
}

// ── `ipvault config show` ─────────────────────────────────────────────────────

fn cmd_config_show(config: &IpvaultConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "txt" | "md" => "text/plain",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "zip" => "application/zip",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(10 * 1024 * 1024), "10.0 MB");
    }

    #[test]
    fn test_default_output_strips_directories() {
        assert_eq!(default_output("../../etc/passwd"), PathBuf::from("passwd"));
        assert_eq!(default_output("report.pdf"), PathBuf::from("report.pdf"));
        assert_eq!(default_output(".."), PathBuf::from("download.bin"));
        assert_eq!(default_output(""), PathBuf::from("download.bin"));
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type(Path::new("a/b/Claims.PDF")), "application/pdf");
        assert_eq!(guess_content_type(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn test_cli_parses_upload() {
        let cli = Cli::try_parse_from([
            "ipvault",
            "upload",
            "doc.pdf",
            "--contract",
            "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd",
            "--token-id",
            "7",
            "--subject",
            "0x1111111111111111111111111111111111111111",
            "--bearer",
            "t",
            "--enhanced-security",
        ])
        .unwrap();
        match cli.command {
            Commands::Upload {
                token_id,
                chain,
                enhanced_security,
                ..
            } => {
                assert_eq!(token_id, "7");
                assert_eq!(chain, "ethereum");
                assert!(enhanced_security);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_session_issue() {
        let cli = Cli::try_parse_from([
            "ipvault",
            "session",
            "issue",
            "0x1111111111111111111111111111111111111111",
            "--ttl",
            "60",
        ])
        .unwrap();
        match cli.command {
            Commands::Session {
                action: SessionAction::Issue { ttl, .. },
            } => assert_eq!(ttl, 60),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_utf8_prefix_drops_split_character() {
        let mut bytes = "naïve".as_bytes().to_vec();
        bytes.truncate(3); // "na" plus the first byte of 'ï'
        assert_eq!(utf8_prefix(bytes).unwrap(), "na");
        assert!(utf8_prefix(vec![0xff, b'a']).is_err());
    }

    #[tokio::test]
    async fn test_preview_text_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.txt");
        tokio::fs::write(&path, "x".repeat(PREVIEW_SOURCE_LIMIT as usize + 10))
            .await
            .unwrap();
        let text = read_preview_text(&path).await.unwrap();
        assert_eq!(text.len() as u64, PREVIEW_SOURCE_LIMIT);
    }

    #[test]
    fn test_cli_parses_open_manifest() {
        let cli = Cli::try_parse_from(["ipvault", "open-manifest", "b.json", "-o", "out.pdf"]).unwrap();
        assert!(matches!(cli.command, Commands::OpenManifest { .. }));
    }
}
