//! Download interceptor: `/download/<id>` → decrypted byte stream.
//!
//! Matching is a pure predicate on the request path. A matched identifier
//! that is not in the key store passes through untouched. Otherwise a
//! producer task fetches chunks in order, decrypts them and feeds a bounded
//! channel; the response body drains it. Chunks without a recorded size
//! take their length from the fetched ciphertext, and the running offset
//! must land exactly on the file size.
//!
//! ```text
//! Idle → Matched → Resolving → Streaming → Complete
//!                      │            ├─────→ Failed
//!                      │            └─────→ Aborted
//!                      └→ Passthrough
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use ipvault_chunks::FileHasher;
use ipvault_crypto::{decrypt_chunk, ChunkInfo, CryptoError};
use ipvault_keystore::{KeyStore, KeyStoreEntry, KeyStoreError};
use ipvault_storage::{BlobStore, StorageError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::range::{parse_range, ByteRange};

/// Path prefix of intercepted download requests.
pub const DOWNLOAD_PREFIX: &str = "/download/";

/// Decrypted chunks buffered ahead of the consumer.
const STREAM_BUFFER: usize = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InterceptState {
    #[default]
    Idle,
    Matched,
    Resolving,
    Streaming,
    Complete,
    Failed,
    Passthrough,
    /// The consumer went away before the last chunk.
    Aborted,
}

impl InterceptState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InterceptState::Complete
                | InterceptState::Failed
                | InterceptState::Passthrough
                | InterceptState::Aborted
        )
    }

    /// Edges of the state diagram in the module docs.
    pub fn can_advance(self, next: InterceptState) -> bool {
        use InterceptState::*;
        matches!(
            (self, next),
            (Idle, Matched)
                | (Matched, Resolving)
                | (Resolving, Streaming | Passthrough | Failed)
                | (Streaming, Complete | Failed | Aborted)
        )
    }
}

fn advance(state: &watch::Sender<InterceptState>, next: InterceptState) {
    let prev = state.send_replace(next);
    debug_assert!(prev.can_advance(next), "illegal transition {prev:?} -> {next:?}");
}

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("range not satisfiable for a {size}-byte file")]
    RangeNotSatisfiable { size: u64 },

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("file hash mismatch: manifest says {expected}, decrypted {actual}")]
    Integrity { expected: String, actual: String },

    #[error("download cancelled")]
    Cancelled,
}

/// Identifier of a `/download/<id>` path, if it is one.
pub fn match_path(path: &str) -> Option<&str> {
    let id = path.strip_prefix(DOWNLOAD_PREFIX)?;
    let id = id.split(['?', '#']).next().unwrap_or(id);
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id)
}

/// Response headers for a decrypted download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    pub content_type: String,
    pub filename: String,
    /// Bytes in this response (the range length for partial responses)
    pub content_length: u64,
    pub total_size: u64,
    pub range: Option<ByteRange>,
}

impl ResponseMeta {
    /// 206 for range responses, 200 otherwise.
    pub fn status(&self) -> u16 {
        if self.range.is_some() {
            206
        } else {
            200
        }
    }

    pub fn content_disposition(&self) -> String {
        let safe: String = self
            .filename
            .chars()
            .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
            .collect();
        format!("attachment; filename=\"{safe}\"")
    }

    /// Header name/value pairs, in the order they are sent.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("content-type", self.content_type.clone()),
            ("content-disposition", self.content_disposition()),
            ("content-length", self.content_length.to_string()),
            ("accept-ranges", "bytes".to_string()),
        ];
        if let Some(range) = &self.range {
            headers.push(("content-range", range.content_range(self.total_size)));
        }
        headers
    }
}

/// Plaintext body. Dropping it cancels the producer.
pub struct DecryptStream {
    inner: ReceiverStream<Result<Bytes, InterceptError>>,
    _guard: DropGuard,
}

impl Stream for DecryptStream {
    type Item = Result<Bytes, InterceptError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

pub struct DecryptedResponse {
    pub meta: ResponseMeta,
    pub body: DecryptStream,
    pub state: watch::Receiver<InterceptState>,
}

pub enum Interception {
    /// Not ours: let the request through unchanged.
    Passthrough,
    Respond(DecryptedResponse),
}

pub struct DownloadInterceptor {
    keystore: Arc<KeyStore>,
    store: Arc<dyn BlobStore>,
}

impl DownloadInterceptor {
    pub fn new(keystore: Arc<KeyStore>, store: Arc<dyn BlobStore>) -> Self {
        Self { keystore, store }
    }

    /// Handle a request for `path`. `range` is the raw `Range` header.
    pub async fn intercept(
        &self,
        path: &str,
        range: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<Interception, InterceptError> {
        let (state_tx, state_rx) = watch::channel(InterceptState::default());
        let Some(id) = match_path(path) else {
            return Ok(Interception::Passthrough);
        };
        advance(&state_tx, InterceptState::Matched);

        advance(&state_tx, InterceptState::Resolving);
        let entry = match self.keystore.get(id) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(id, "identifier not in key store, passing through");
                advance(&state_tx, InterceptState::Passthrough);
                return Ok(Interception::Passthrough);
            }
            Err(e) => {
                advance(&state_tx, InterceptState::Failed);
                return Err(e.into());
            }
        };

        let total_size = entry.manifest.size();
        let range = match range.map(|h| parse_range(h, total_size)).transpose() {
            Ok(range) => range.flatten(),
            Err(_) => {
                advance(&state_tx, InterceptState::Failed);
                return Err(InterceptError::RangeNotSatisfiable { size: total_size });
            }
        };

        let meta = ResponseMeta {
            content_type: entry.manifest.file_metadata.content_type.clone(),
            filename: entry.manifest.file_metadata.name.clone(),
            content_length: range.map_or(total_size, |r| r.byte_len()),
            total_size,
            range,
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        advance(&state_tx, InterceptState::Streaming);
        info!(id, size = total_size, range = ?range, "streaming decrypted download");

        tokio::spawn(produce(
            entry,
            Arc::clone(&self.store),
            range,
            tx,
            state_tx,
            cancel.clone(),
        ));

        Ok(Interception::Respond(DecryptedResponse {
            meta,
            body: DecryptStream {
                inner: ReceiverStream::new(rx),
                _guard: cancel.drop_guard(),
            },
            state: state_rx,
        }))
    }
}

enum Stop {
    Cancelled,
    Failed(InterceptError),
}

async fn produce(
    entry: KeyStoreEntry,
    store: Arc<dyn BlobStore>,
    range: Option<ByteRange>,
    tx: mpsc::Sender<Result<Bytes, InterceptError>>,
    state: watch::Sender<InterceptState>,
    cancel: CancellationToken,
) {
    let id = entry.identifier.clone();
    match stream_chunks(&entry, store.as_ref(), range, &tx, &cancel).await {
        Ok(()) => {
            debug!(id, "download complete");
            advance(&state, InterceptState::Complete);
        }
        Err(Stop::Cancelled) => {
            debug!(id, "download aborted by consumer");
            advance(&state, InterceptState::Aborted);
        }
        Err(Stop::Failed(e)) => {
            warn!(id, error = %e, "download failed");
            advance(&state, InterceptState::Failed);
            // Consumer may already be gone; nothing else to tell.
            let _ = tx.send(Err(e)).await;
        }
    }
}

async fn stream_chunks(
    entry: &KeyStoreEntry,
    store: &dyn BlobStore,
    range: Option<ByteRange>,
    tx: &mpsc::Sender<Result<Bytes, InterceptError>>,
    cancel: &CancellationToken,
) -> Result<(), Stop> {
    // Only a full-file stream can be checked against fileHash.
    let mut hasher = range.is_none().then(FileHasher::new);
    let fail = |e: InterceptError| Stop::Failed(e);
    let total = entry.manifest.size();
    let sized = entry.manifest.is_sized();
    let mut offset = 0u64;

    for chunk in &entry.manifest.chunks {
        if let Some(r) = &range {
            if offset > r.end {
                break;
            }
            if sized && !r.overlaps(chunk.offset, chunk.size) {
                offset = chunk.offset + chunk.size;
                continue;
            }
        }

        let ciphertext = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Stop::Cancelled),
            fetched = store.get(&chunk.cid) => fetched.map_err(|e| fail(e.into()))?,
        };

        let plaintext = decrypt(entry, chunk, offset, &ciphertext).map_err(|e| fail(e.into()))?;
        if let Some(h) = hasher.as_mut() {
            h.update(&plaintext);
        }
        let start = offset;
        let len = plaintext.len() as u64;
        offset += len;

        let out = match &range {
            Some(r) => {
                let from = r.start.saturating_sub(start);
                let to = (r.end + 1).min(offset) - start;
                if from >= to {
                    continue;
                }
                Bytes::from(plaintext).slice(from as usize..to as usize)
            }
            None => Bytes::from(plaintext),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Stop::Cancelled),
            sent = tx.send(Ok(out)) => {
                if sent.is_err() {
                    return Err(Stop::Cancelled);
                }
            }
        }
    }

    let needed = range.map_or(total, |r| r.end + 1);
    if offset < needed {
        return Err(fail(InterceptError::Crypto(CryptoError::DecryptionFailure(format!(
            "chunks cover {offset} of {total} bytes"
        )))));
    }

    if let Some(h) = hasher {
        let actual = h.finalize_hex();
        if !actual.eq_ignore_ascii_case(&entry.manifest.file_hash) {
            return Err(fail(InterceptError::Integrity {
                expected: entry.manifest.file_hash.clone(),
                actual,
            }));
        }
    }
    Ok(())
}

/// `offset` is where this chunk starts in the plaintext.
fn decrypt(
    entry: &KeyStoreEntry,
    chunk: &ChunkInfo,
    offset: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let len = ciphertext.len() as u64;
    if chunk.size > 0 && len != chunk.encrypted_size {
        return Err(CryptoError::DecryptionFailure(format!(
            "chunk {} is {len} bytes, manifest says {}",
            chunk.counter, chunk.encrypted_size
        )));
    }
    let total = entry.manifest.size();
    if len == 0 || offset + len > total {
        return Err(CryptoError::DecryptionFailure(format!(
            "chunk {} ({len} bytes at offset {offset}) does not fit a {total}-byte file",
            chunk.counter
        )));
    }
    decrypt_chunk(&entry.key, &entry.iv, chunk.counter, ciphertext)
}
