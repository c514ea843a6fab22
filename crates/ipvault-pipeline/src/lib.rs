//! ipvault-pipeline: upload orchestrator, download interceptor and download
//! orchestrator
//!
//! Upload: read → fixed-size chunks → AES-256-CTR → content-addressed store →
//! manifest → policy-encrypted envelope.
//!
//! Download: envelope → access-control service → key store → `/download/<id>`
//! → in-order fetch, decrypt and stream.

pub mod download;
pub mod error;
pub mod intercept;
pub mod range;
pub mod upload;

pub use download::{DownloadOrchestrator, DownloadTicket};
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use intercept::{
    match_path, DecryptStream, DecryptedResponse, DownloadInterceptor, InterceptError,
    InterceptState, Interception, ResponseMeta, DOWNLOAD_PREFIX,
};
pub use range::{parse_range, ByteRange, Unsatisfiable};
pub use upload::{
    preview_input, FileInput, ProgressFn, ProtectedAsset, UploadOptions, UploadOrchestrator,
    UploadReceipt, UploadRequest, UploadSummary,
};
