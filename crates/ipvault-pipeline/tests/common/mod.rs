//! Shared harness for pipeline integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use ipvault_access::{AccessControlService, BalanceLedger, LocalAccessControl, SessionTokens};
use ipvault_core::{Clock, ContentAddress, Credential, ManualClock};
use ipvault_crypto::{AccessPolicy, AssetTarget, TransportIdentity};
use ipvault_keystore::{JsonKeyStore, KeyStore};
use ipvault_pipeline::{
    DecryptedResponse, DownloadOrchestrator, FileInput, UploadOptions, UploadOrchestrator,
    UploadRequest,
};
use ipvault_storage::{memory_operator, BlobStore, OpendalBlobStore, StorageError};
use std::io::Cursor;

pub const CONTRACT: &str = "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd";
pub const CHAIN: &str = "ethereum";
pub const TOKEN_ID: &str = "7";
pub const OWNER: &str = "0x1111111111111111111111111111111111111111";
pub const STRANGER: &str = "0x2222222222222222222222222222222222222222";
pub const START_MILLIS: u64 = 1_700_000_000_000;
const SESSION_KEY: [u8; 32] = [9; 32];

fn session_tokens(clock: Arc<dyn Clock>) -> SessionTokens {
    SessionTokens::new(SESSION_KEY, clock)
}

/// Wraps a blob store: counts puts, can fail after N puts and delay early
/// puts so they complete out of order.
pub struct CountingStore {
    inner: OpendalBlobStore,
    puts: AtomicUsize,
    fail_after: Option<usize>,
    stagger: Option<Duration>,
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: OpendalBlobStore::new(memory_operator().expect("memory operator"), "test"),
            puts: AtomicUsize::new(0),
            fail_after: None,
            stagger: None,
        }
    }

    /// Every put after the first `n` fails.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Put `i` sleeps `(8 - i) * step` so earlier chunks finish last.
    pub fn staggered(mut self, step: Duration) -> Self {
        self.stagger = Some(step);
        self
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &OpendalBlobStore {
        &self.inner
    }

    /// Number of blobs actually written.
    pub async fn stored(&self) -> usize {
        self.inner
            .operator()
            .list("test/blobs/")
            .await
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.metadata().mode().is_file())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Overwrite the stored bytes of `address`, bypassing addressing.
    pub async fn corrupt(&self, address: &ContentAddress, data: Vec<u8>) {
        let path = self.inner.blob_path(address);
        self.inner.operator().write(&path, data).await.expect("overwrite blob");
    }
}

#[async_trait]
impl BlobStore for CountingStore {
    async fn put(&self, data: Bytes, session: &Credential) -> Result<ContentAddress, StorageError> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after {
            if n >= limit {
                return Err(StorageError::Backend(opendal::Error::new(
                    opendal::ErrorKind::Unexpected,
                    "injected failure",
                )));
            }
        }
        if let Some(step) = self.stagger {
            tokio::time::sleep(step * 8u32.saturating_sub(n as u32)).await;
        }
        self.inner.put(data, session).await
    }

    async fn get(&self, address: &ContentAddress) -> Result<Bytes, StorageError> {
        self.inner.get(address).await
    }
}

pub struct Harness {
    pub store: Arc<CountingStore>,
    pub ledger: Arc<BalanceLedger>,
    pub access: Arc<LocalAccessControl>,
    pub keystore: Arc<KeyStore>,
    pub clock: Arc<ManualClock>,
    pub upload: UploadOrchestrator,
    pub download: DownloadOrchestrator,
}

impl Harness {
    pub fn new(options: UploadOptions) -> Self {
        Self::with_store(CountingStore::new(), options, true)
    }

    pub fn with_store(store: CountingStore, options: UploadOptions, access: bool) -> Self {
        let store = Arc::new(store);
        let ledger = Arc::new(BalanceLedger::new());
        ledger.set_balance(CHAIN, CONTRACT, TOKEN_ID, OWNER, "1");
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let verifier = Arc::new(session_tokens(clock.clone()));
        let local = Arc::new(
            LocalAccessControl::ephemeral(ledger.clone(), verifier)
                .with_transport(TransportIdentity::generate()),
        );
        let keystore = Arc::new(KeyStore::new(
            Box::new(JsonKeyStore::in_memory()),
            clock.clone() as Arc<dyn Clock>,
        ));
        let service: Option<Arc<dyn AccessControlService>> =
            access.then(|| local.clone() as Arc<dyn AccessControlService>);

        let upload = UploadOrchestrator::new(
            store.clone(),
            service.clone(),
            clock.clone(),
            options,
        );
        let download = DownloadOrchestrator::new(
            store.clone(),
            service,
            keystore.clone(),
            clock.clone(),
            Duration::from_secs(300),
        );
        Self {
            store,
            ledger,
            access: local,
            keystore,
            clock,
            upload,
            download,
        }
    }
}

pub fn options(chunk_size: u64) -> UploadOptions {
    UploadOptions {
        chunk_size,
        adaptive_chunking: false,
        ..UploadOptions::default()
    }
}

pub fn target() -> AssetTarget {
    AssetTarget::new(CONTRACT, CHAIN, TOKEN_ID).expect("valid target")
}

/// Credential carrying a token the harness verifier accepts for a day.
pub fn credential(address: &str) -> Credential {
    let token = session_tokens(Arc::new(ManualClock::new(START_MILLIS)))
        .issue(address, Duration::from_secs(86_400))
        .expect("issue token");
    Credential::new(address, token).expect("valid credential")
}

/// `address` claimed with a token issued to someone else.
pub fn forged_credential(address: &str, token_holder: &str) -> Credential {
    let token = credential(token_holder).bearer().to_owned();
    Credential::new(address, token).expect("well-formed credential")
}

pub fn request(name: &str, data: Vec<u8>) -> UploadRequest<Cursor<Vec<u8>>> {
    UploadRequest {
        file: FileInput::from_bytes(name, "application/octet-stream", data),
        policy: AccessPolicy::full_content(&target()),
        recipient: None,
        enhanced_security: false,
    }
}

/// Deterministic non-repeating test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8).collect()
}

pub async fn collect(response: DecryptedResponse) -> Result<Vec<u8>, ipvault_pipeline::InterceptError> {
    let chunks: Vec<Bytes> = response.body.try_collect().await?;
    Ok(chunks.concat())
}
