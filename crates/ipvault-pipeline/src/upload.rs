//! Upload orchestrator: chunk → encrypt → upload → manifest → envelope.
//!
//! A run either publishes a complete envelope or nothing: any failure before
//! the envelope upload aborts the run, and chunks already stored stay
//! unreferenced.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use ipvault_access::{AccessControlService, KeyPayload};
use ipvault_chunks::{choose_chunk_size, FileHasher, FixedChunker};
use ipvault_core::config::UploadConfig;
use ipvault_core::{Clock, ContentAddress, Credential};
use ipvault_crypto::{
    encrypt_chunk, preview, AccessPolicy, AssetTarget, ChunkInfo, ContentKey, FileMetadata, Iv,
    Manifest, ManifestEnvelope, MetadataBundle, SecureRandom, CHUNK_WINDOW,
};
use ipvault_storage::BlobStore;
use rand::Rng;
use serde::Serialize;
use tokio::io::AsyncRead;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{PipelineError, PipelineResult};

/// Progress callback type (done, total, message)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

/// A file to protect.
pub struct FileInput<R> {
    pub name: String,
    pub content_type: String,
    /// Declared size; the run fails if the reader yields a different count.
    pub size: u64,
    pub reader: R,
}

impl FileInput<Cursor<Vec<u8>>> {
    pub fn from_bytes(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            size: data.len() as u64,
            reader: Cursor::new(data),
        }
    }
}

/// Downsampled text preview of a document.
pub fn preview_input<R: Rng + ?Sized>(
    name: &str,
    text: &str,
    rng: &mut R,
) -> FileInput<Cursor<Vec<u8>>> {
    FileInput::from_bytes(
        format!("preview-{name}"),
        "text/plain",
        preview::downsample(text, rng).into_bytes(),
    )
}

pub struct UploadRequest<R> {
    pub file: FileInput<R>,
    pub policy: AccessPolicy,
    /// Grant this address access in addition to `policy`.
    pub recipient: Option<String>,
    /// Seal the bundle to the access-control service's transport key.
    pub enhanced_security: bool,
}

#[derive(Debug)]
pub struct UploadReceipt {
    /// Address of the ordered chunk address list
    pub root_cid: ContentAddress,
    /// Envelope address; absent on the fallback path
    pub metadata_cid: Option<ContentAddress>,
    /// Unencrypted bundle JSON, only when no access-control service is configured
    pub metadata_bundle: Option<Zeroizing<Vec<u8>>>,
    pub file_hash: String,
    pub chunk_count: usize,
    pub size: u64,
}

/// Upload result as returned to clients.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub root_cid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_bundle: Option<String>,
}

impl UploadReceipt {
    pub fn summary(&self) -> UploadSummary {
        UploadSummary {
            root_cid: self.root_cid.to_string(),
            metadata_cid: self.metadata_cid.as_ref().map(ToString::to_string),
            metadata_bundle: self
                .metadata_bundle
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned()),
        }
    }
}

/// Document and preview receipts of one protected asset.
#[derive(Debug)]
pub struct ProtectedAsset {
    pub document: UploadReceipt,
    pub preview: UploadReceipt,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: u64,
    pub adaptive_chunking: bool,
    pub max_chunks: u64,
    pub max_chunk_size: u64,
    /// Chunk uploads in flight at once
    pub concurrency: usize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl From<&UploadConfig> for UploadOptions {
    fn from(cfg: &UploadConfig) -> Self {
        Self {
            chunk_size: cfg.chunk_size,
            adaptive_chunking: cfg.adaptive_chunking,
            max_chunks: cfg.max_chunks,
            max_chunk_size: cfg.max_chunk_size,
            concurrency: cfg.concurrency,
        }
    }
}

impl UploadOptions {
    fn chunk_size_for(&self, file_size: u64) -> u64 {
        if self.adaptive_chunking {
            choose_chunk_size(file_size, self.chunk_size, self.max_chunks, self.max_chunk_size)
        } else {
            self.chunk_size
        }
    }
}

pub struct UploadOrchestrator {
    store: Arc<dyn BlobStore>,
    access: Option<Arc<dyn AccessControlService>>,
    clock: Arc<dyn Clock>,
    options: UploadOptions,
}

impl UploadOrchestrator {
    pub fn new(
        store: Arc<dyn BlobStore>,
        access: Option<Arc<dyn AccessControlService>>,
        clock: Arc<dyn Clock>,
        options: UploadOptions,
    ) -> Self {
        Self {
            store,
            access,
            clock,
            options,
        }
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    /// Protect one file under `request.policy`.
    pub async fn upload<R>(
        &self,
        request: UploadRequest<R>,
        session: &Credential,
        rng: &mut dyn SecureRandom,
        progress: Option<&ProgressFn>,
    ) -> PipelineResult<UploadReceipt>
    where
        R: AsyncRead + Unpin + Send,
    {
        let UploadRequest {
            file,
            policy,
            recipient,
            enhanced_security,
        } = request;

        // Validation: nothing below this block touches the network until it passes.
        if file.size == 0 {
            return Err(PipelineError::Validation(format!("{} is empty", file.name)));
        }
        let policy = match recipient.as_deref() {
            Some(address) => policy.with_recipient(address)?,
            None => policy,
        };
        let transport = if enhanced_security {
            let recipient = self
                .access
                .as_ref()
                .and_then(|access| access.transport_recipient())
                .ok_or_else(|| {
                    PipelineError::Validation(
                        "enhanced security needs an access-control service with a transport key"
                            .into(),
                    )
                })?;
            Some(recipient)
        } else {
            None
        };
        let chunk_size = self.options.chunk_size_for(file.size);
        if chunk_size == 0 || chunk_size > CHUNK_WINDOW {
            return Err(PipelineError::Validation(format!(
                "chunk size {chunk_size} outside 1..={CHUNK_WINDOW}"
            )));
        }
        let concurrency = self.options.concurrency.max(1);

        // Fresh key and IV for every run.
        let key = ContentKey::generate(rng);
        let iv = Iv::generate(rng);

        let expected_chunks = file.size.div_ceil(chunk_size);
        let total_steps = expected_chunks + 1;
        let report = |done: u64, message: &str| {
            if let Some(p) = progress {
                p(done, total_steps, message);
            }
        };

        info!(
            name = %file.name,
            size = file.size,
            chunk_size,
            chunks = expected_chunks,
            uploader = session.subject(),
            "upload started"
        );

        let mut hasher = FileHasher::new();
        let mut chunks: Vec<ChunkInfo> = Vec::with_capacity(expected_chunks as usize);
        {
            let chunker =
                FixedChunker::new(file.reader, chunk_size as usize)?.with_len_hint(file.size);
            let key = &key;
            let iv = &iv;
            let hasher = &mut hasher;
            let store = &self.store;

            let uploads = chunker
                .into_stream()
                .map(move |item| -> PipelineResult<_> {
                    let chunk = item?;
                    hasher.update(&chunk.data);
                    let ciphertext = encrypt_chunk(key, iv, chunk.index, &chunk.data)?;
                    let store = Arc::clone(store);
                    Ok(async move {
                        let size = chunk.len() as u64;
                        let cid = store.put(Bytes::from(ciphertext), session).await?;
                        debug!(index = chunk.index, %cid, size, "chunk uploaded");
                        Ok::<_, PipelineError>(ChunkInfo {
                            cid,
                            offset: chunk.offset,
                            size,
                            encrypted_size: size,
                            counter: chunk.index,
                        })
                    })
                })
                .try_buffered(concurrency);
            let mut uploads = std::pin::pin!(uploads);

            // try_buffered yields in submission order, whatever order uploads finish in.
            while let Some(info) = uploads.try_next().await? {
                chunks.push(info);
                let done = chunks.len() as u64;
                report(done, &format!("uploaded chunk {done}/{expected_chunks}"));
            }
        }

        if hasher.bytes_hashed() != file.size {
            return Err(PipelineError::Validation(format!(
                "{} declared {} bytes but {} were read",
                file.name,
                file.size,
                hasher.bytes_hashed()
            )));
        }
        let file_hash = hasher.finalize_hex();

        let manifest = Manifest::build(
            FileMetadata {
                name: file.name.clone(),
                size: file.size,
                content_type: file.content_type.clone(),
                chunk_size,
            },
            file_hash.clone(),
            &key,
            chunks,
        )?;
        let root_cid = manifest.root();
        let chunk_count = manifest.chunks.len();
        let bundle = MetadataBundle::new(manifest, key, iv);
        let bundle_json = bundle.to_json()?;

        let Some(access) = &self.access else {
            report(total_steps, "manifest ready (no access-control service)");
            info!(%root_cid, chunks = chunk_count, "upload finished without access control");
            return Ok(UploadReceipt {
                root_cid,
                metadata_cid: None,
                metadata_bundle: Some(bundle_json),
                file_hash,
                chunk_count,
                size: file.size,
            });
        };

        let payload = match &transport {
            Some(recipient) => KeyPayload::Sealed(recipient.seal(&bundle_json)?),
            None => KeyPayload::Plain(bundle_json),
        };
        let encrypted = access.encrypt(payload, &policy).await?;
        let envelope = ManifestEnvelope::new(policy, encrypted, self.clock.now_millis());
        let metadata_cid = self
            .store
            .put(Bytes::from(envelope.to_json()?), session)
            .await?;
        report(total_steps, "manifest uploaded");

        info!(
            %root_cid,
            %metadata_cid,
            chunks = chunk_count,
            sealed = transport.is_some(),
            "upload finished"
        );
        Ok(UploadReceipt {
            root_cid,
            metadata_cid: Some(metadata_cid),
            metadata_bundle: None,
            file_hash,
            chunk_count,
            size: file.size,
        })
    }

    /// Two independent runs: the document under the full-content policy and
    /// the preview under the preview policy, each with its own key.
    #[allow(clippy::too_many_arguments)]
    pub async fn protect<D, P>(
        &self,
        document: FileInput<D>,
        preview: FileInput<P>,
        target: &AssetTarget,
        recipient: Option<String>,
        enhanced_security: bool,
        session: &Credential,
        rng: &mut dyn SecureRandom,
        progress: Option<&ProgressFn>,
    ) -> PipelineResult<ProtectedAsset>
    where
        D: AsyncRead + Unpin + Send,
        P: AsyncRead + Unpin + Send,
    {
        let document = self
            .upload(
                UploadRequest {
                    file: document,
                    policy: AccessPolicy::full_content(target),
                    recipient,
                    enhanced_security,
                },
                session,
                rng,
                progress,
            )
            .await?;

        let preview = self
            .upload(
                UploadRequest {
                    file: preview,
                    policy: AccessPolicy::preview(target),
                    recipient: None,
                    enhanced_security,
                },
                session,
                rng,
                progress,
            )
            .await?;

        Ok(ProtectedAsset { document, preview })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipvault_core::ManualClock;
    use ipvault_storage::{memory_operator, OpendalBlobStore};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Mutex;

    const CONTRACT: &str = "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd";

    fn orchestrator(chunk_size: u64) -> UploadOrchestrator {
        let store = OpendalBlobStore::new(memory_operator().unwrap(), "t");
        UploadOrchestrator::new(
            Arc::new(store),
            None,
            Arc::new(ManualClock::new(0)),
            UploadOptions {
                chunk_size,
                adaptive_chunking: false,
                ..UploadOptions::default()
            },
        )
    }

    fn request(data: &[u8]) -> UploadRequest<Cursor<Vec<u8>>> {
        let target = AssetTarget::new(CONTRACT, "ethereum", "1").unwrap();
        UploadRequest {
            file: FileInput::from_bytes("doc.bin", "application/octet-stream", data.to_vec()),
            policy: AccessPolicy::full_content(&target),
            recipient: None,
            enhanced_security: false,
        }
    }

    fn session() -> Credential {
        Credential::new("0x1111111111111111111111111111111111111111", "jwt").unwrap()
    }

    #[tokio::test]
    async fn fallback_returns_bundle() {
        let orch = orchestrator(4);
        let mut rng = StdRng::seed_from_u64(1);
        let receipt = orch
            .upload(request(b"0123456789"), &session(), &mut rng, None)
            .await
            .unwrap();

        assert_eq!(receipt.chunk_count, 3);
        assert!(receipt.metadata_cid.is_none());
        let bundle = MetadataBundle::from_json(receipt.metadata_bundle.as_ref().unwrap()).unwrap();
        assert_eq!(bundle.manifest.root(), receipt.root_cid);
        assert_eq!(bundle.manifest.file_hash, ipvault_chunks::sha256_hex(b"0123456789"));

        let summary = serde_json::to_value(receipt.summary()).unwrap();
        assert!(summary.get("metadataBundle").is_some());
        assert!(summary.get("metadataCid").is_none());
    }

    #[tokio::test]
    async fn progress_ends_at_total() {
        let orch = orchestrator(4);
        let mut rng = StdRng::seed_from_u64(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress: ProgressFn = Box::new(move |done, total, _| {
            sink.lock().unwrap().push((done, total));
        });

        orch.upload(request(b"0123456789"), &session(), &mut rng, Some(&progress))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
    }

    #[tokio::test]
    async fn empty_file_is_rejected() {
        let orch = orchestrator(4);
        let mut rng = StdRng::seed_from_u64(3);
        let err = orch
            .upload(request(b""), &session(), &mut rng, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn bad_recipient_is_rejected() {
        let orch = orchestrator(4);
        let mut rng = StdRng::seed_from_u64(4);
        let mut req = request(b"data");
        req.recipient = Some("not-an-address".into());
        let err = orch.upload(req, &session(), &mut rng, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Policy(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn enhanced_security_needs_service() {
        let orch = orchestrator(4);
        let mut rng = StdRng::seed_from_u64(5);
        let mut req = request(b"data");
        req.enhanced_security = true;
        let err = orch.upload(req, &session(), &mut rng, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn short_read_is_detected() {
        let orch = orchestrator(4);
        let mut rng = StdRng::seed_from_u64(6);
        let mut req = request(b"abc");
        req.file.size = 10;
        let err = orch.upload(req, &session(), &mut rng, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)), "got {err:?}");
    }

    #[test]
    fn test_adaptive_chunk_size() {
        let opts = UploadOptions::default();
        assert_eq!(opts.chunk_size_for(10 * 1024 * 1024), 1024 * 1024);
        assert_eq!(opts.chunk_size_for(100 * 1024 * 1024), 8 * 1024 * 1024);
    }

    #[test]
    fn test_preview_input_is_text() {
        let mut rng = StdRng::seed_from_u64(7);
        let input = preview_input("report.txt", "value 100", &mut rng);
        assert_eq!(input.name, "preview-report.txt");
        assert_eq!(input.content_type, "text/plain");
        assert!(input.size > 0);
    }
}
