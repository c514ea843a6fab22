//! HTTP gateway: `/download/<id>` interception and the manifest API
//!
//! Routes:
//!   GET  /download/{id}      — decrypted stream; unknown ids fall through to a raw blob.
//!                              Resolved identifiers need the same credentials as resolve.
//!   POST /api/manifests      — register a pasted metadata bundle (short-lived)
//!   POST /api/resolve/{cid}  — resolve an envelope for the calling credential
//!   GET  /api/blobs/{cid}    — raw blob passthrough

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt;
use ipvault_access::AccessError;
use ipvault_core::{ContentAddress, Credential};
use ipvault_pipeline::{
    DownloadOrchestrator, DownloadTicket, ErrorKind, InterceptError, Interception, PipelineError,
};
use ipvault_storage::{BlobStore, StorageError};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::GatewayMetrics;

const SUBJECT_HEADER: &str = "x-subject-address";

#[derive(Clone)]
pub struct AppState {
    pub downloads: Arc<DownloadOrchestrator>,
    pub store: Arc<dyn BlobStore>,
    pub metrics: GatewayMetrics,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/download/{id}", get(download_handler))
        .route("/api/manifests", post(open_manifest_handler))
        .route("/api/resolve/{cid}", post(resolve_handler))
        .route("/api/blobs/{cid}", get(blob_handler))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("missing or malformed credentials: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Pipeline(PipelineError::UnknownIdentifier(_)) => StatusCode::NOT_FOUND,
            ApiError::Pipeline(PipelineError::Access(AccessError::Unauthenticated(_))) => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::Pipeline(PipelineError::Intercept(InterceptError::RangeNotSatisfiable {
                ..
            })) => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Pipeline(e) => match e.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::AccessDenied => StatusCode::FORBIDDEN,
                ErrorKind::Cryptographic => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Storage(StorageError::NotFound(_) | StorageError::UnsupportedAddress(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Storage(StorageError::Integrity(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Storage(StorageError::Backend(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "request failed");
        } else {
            debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        let mut response = (status, Json(json!({ "error": self.to_string() }))).into_response();
        if let ApiError::Pipeline(PipelineError::Intercept(InterceptError::RangeNotSatisfiable {
            size,
        })) = &self
        {
            if let Ok(value) = format!("bytes */{size}").parse() {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}

async fn download_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let credential = optional_credential(&headers)?;

    let interception = state
        .downloads
        .intercept(
            &id,
            credential.as_ref(),
            range.as_deref(),
            CancellationToken::new(),
        )
        .await
        .map_err(|e| {
            state.metrics.download("failed");
            ApiError::Pipeline(e)
        })?;

    let response = match interception {
        Interception::Respond(response) => response,
        Interception::Passthrough => {
            state.metrics.download("passthrough");
            let address = ContentAddress::parse(id)
                .map_err(|e| ApiError::Pipeline(PipelineError::UnknownIdentifier(e.to_string())))?;
            return raw_blob(&state, &address).await;
        }
    };
    state.metrics.download("decrypted");

    let mut builder = Response::builder().status(response.meta.status());
    for (name, value) in response.meta.headers() {
        builder = builder.header(name, value);
    }
    let metrics = state.metrics.clone();
    let body = response
        .body
        .inspect_ok(move |chunk| metrics.streamed(chunk.len() as u64));
    builder
        .body(Body::from_stream(body))
        .map_err(|e| ApiError::BadRequest(format!("building response: {e}")))
}

async fn open_manifest_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DownloadTicket>, ApiError> {
    let ticket = state.downloads.open_manifest(&body)?;
    state.metrics.manifest_opened("manifest");
    Ok(Json(ticket))
}

async fn resolve_handler(
    State(state): State<AppState>,
    Path(cid): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DownloadTicket>, ApiError> {
    let credential = credential_from(&headers)?;
    let cid = ContentAddress::parse(cid).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let ticket = state.downloads.open_by_identifier(&cid, &credential).await?;
    state.metrics.manifest_opened("identifier");
    Ok(Json(ticket))
}

async fn blob_handler(
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> Result<Response, ApiError> {
    let address = ContentAddress::parse(cid).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    raw_blob(&state, &address).await
}

async fn raw_blob(state: &AppState, address: &ContentAddress) -> Result<Response, ApiError> {
    let data = state.store.get(address).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response())
}

/// Credentials when the request carries any, `None` when it carries none.
fn optional_credential(headers: &HeaderMap) -> Result<Option<Credential>, ApiError> {
    if headers.contains_key(header::AUTHORIZATION) || headers.contains_key(SUBJECT_HEADER) {
        credential_from(headers).map(Some)
    } else {
        Ok(None)
    }
}

fn credential_from(headers: &HeaderMap) -> Result<Credential, ApiError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("expected Authorization: Bearer <token>".into()))?;
    let subject = headers
        .get(SUBJECT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {SUBJECT_HEADER} header")))?;
    Credential::new(subject, bearer).map_err(|e| ApiError::Unauthorized(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use ipvault_access::{AccessControlService, BalanceLedger, LocalAccessControl, SessionTokens};
    use ipvault_core::{Clock, ManualClock};
    use ipvault_crypto::{AccessPolicy, AssetTarget};
    use ipvault_keystore::{JsonKeyStore, KeyStore};
    use ipvault_pipeline::{FileInput, UploadOptions, UploadOrchestrator, UploadRequest};
    use ipvault_storage::{memory_operator, OpendalBlobStore};
    use prometheus_client::registry::Registry;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;
    use tower::ServiceExt;

    const CONTRACT: &str = "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd";
    const OWNER: &str = "0x1111111111111111111111111111111111111111";
    const STRANGER: &str = "0x2222222222222222222222222222222222222222";

    struct Fixture {
        app: Router,
        upload: UploadOrchestrator,
        plain_upload: UploadOrchestrator,
        tokens: Arc<SessionTokens>,
    }

    impl Fixture {
        fn bearer(&self, subject: &str) -> String {
            let token = self.tokens.issue(subject, Duration::from_secs(600)).unwrap();
            format!("Bearer {token}")
        }
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn BlobStore> =
            Arc::new(OpendalBlobStore::new(memory_operator().unwrap(), "gw"));
        let ledger = Arc::new(BalanceLedger::new());
        ledger.set_balance("ethereum", CONTRACT, "1", OWNER, "3");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let tokens = Arc::new(SessionTokens::ephemeral(clock.clone()));
        let access: Arc<dyn AccessControlService> =
            Arc::new(LocalAccessControl::ephemeral(ledger, tokens.clone()));
        let keystore = Arc::new(KeyStore::new(
            Box::new(JsonKeyStore::in_memory()),
            clock.clone(),
        ));
        let options = UploadOptions {
            chunk_size: 8,
            adaptive_chunking: false,
            ..UploadOptions::default()
        };

        let downloads = Arc::new(DownloadOrchestrator::new(
            store.clone(),
            Some(access.clone()),
            keystore,
            clock.clone(),
            Duration::from_secs(300),
        ));
        let state = AppState {
            downloads,
            store: store.clone(),
            metrics: GatewayMetrics::new(&mut Registry::default()),
        };
        Fixture {
            app: router(state),
            upload: UploadOrchestrator::new(
                store.clone(),
                Some(access),
                clock.clone(),
                options.clone(),
            ),
            plain_upload: UploadOrchestrator::new(store, None, clock, options),
            tokens,
        }
    }

    fn request(data: &[u8]) -> UploadRequest<std::io::Cursor<Vec<u8>>> {
        let target = AssetTarget::new(CONTRACT, "ethereum", "1").unwrap();
        UploadRequest {
            file: FileInput::from_bytes("doc.txt", "text/plain", data.to_vec()),
            policy: AccessPolicy::full_content(&target),
            recipient: None,
            enhanced_security: false,
        }
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn manifest_mode_download() {
        let f = fixture();
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut rng = StdRng::seed_from_u64(1);
        let session = Credential::new(OWNER, "t").unwrap();
        let receipt = f
            .plain_upload
            .upload(request(data), &session, &mut rng, None)
            .await
            .unwrap();
        let bundle = receipt.metadata_bundle.unwrap().to_vec();

        let response = f
            .app
            .clone()
            .oneshot(Request::post("/api/manifests").body(Body::from(bundle)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ticket: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        let url = ticket["url"].as_str().unwrap().to_string();
        assert!(url.starts_with("/download/manifest-1000-"));
        assert_eq!(ticket["expiresAt"], 301_000);

        let response = f
            .app
            .clone()
            .oneshot(Request::get(&url).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"doc.txt\""
        );
        assert_eq!(body_bytes(response).await, data);

        let response = f
            .app
            .oneshot(
                Request::get(&url)
                    .header(header::RANGE, "bytes=4-8")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 4-8/43");
        assert_eq!(body_bytes(response).await, b"quick");
    }

    #[tokio::test]
    async fn identifier_mode_requires_credentials() {
        let f = fixture();
        let mut rng = StdRng::seed_from_u64(2);
        let session = Credential::new(OWNER, "t").unwrap();
        let receipt = f
            .upload
            .upload(request(b"confidential"), &session, &mut rng, None)
            .await
            .unwrap();
        let cid = receipt.metadata_cid.unwrap();
        let uri = format!("/api/resolve/{cid}");

        let anonymous = f
            .app
            .clone()
            .oneshot(Request::post(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let stranger = f
            .app
            .clone()
            .oneshot(
                Request::post(&uri)
                    .header(header::AUTHORIZATION, f.bearer(STRANGER))
                    .header(SUBJECT_HEADER, STRANGER)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(stranger.status(), StatusCode::FORBIDDEN);

        let owner = f
            .app
            .clone()
            .oneshot(
                Request::post(&uri)
                    .header(header::AUTHORIZATION, f.bearer(OWNER))
                    .header(SUBJECT_HEADER, OWNER)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(owner.status(), StatusCode::OK);

        let response = f
            .app
            .clone()
            .oneshot(
                Request::get(format!("/download/{cid}"))
                    .header(header::AUTHORIZATION, f.bearer(OWNER))
                    .header(SUBJECT_HEADER, OWNER)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"confidential");

        // Resolved by the owner; nobody else streams it.
        let anonymous = f
            .app
            .clone()
            .oneshot(Request::get(format!("/download/{cid}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let stranger = f
            .app
            .clone()
            .oneshot(
                Request::get(format!("/download/{cid}"))
                    .header(header::AUTHORIZATION, f.bearer(STRANGER))
                    .header(SUBJECT_HEADER, STRANGER)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(stranger.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn forged_subject_header_is_rejected() {
        let f = fixture();
        let mut rng = StdRng::seed_from_u64(4);
        let session = Credential::new(OWNER, "t").unwrap();
        let receipt = f
            .upload
            .upload(request(b"confidential"), &session, &mut rng, None)
            .await
            .unwrap();
        let cid = receipt.metadata_cid.unwrap();

        // Stranger's own token, owner's address.
        let forged = f
            .app
            .clone()
            .oneshot(
                Request::post(format!("/api/resolve/{cid}"))
                    .header(header::AUTHORIZATION, f.bearer(STRANGER))
                    .header(SUBJECT_HEADER, OWNER)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);

        let made_up = f
            .app
            .clone()
            .oneshot(
                Request::post(format!("/api/resolve/{cid}"))
                    .header(header::AUTHORIZATION, "Bearer anything")
                    .header(SUBJECT_HEADER, OWNER)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(made_up.status(), StatusCode::UNAUTHORIZED);

        let owner = f
            .app
            .clone()
            .oneshot(
                Request::post(format!("/api/resolve/{cid}"))
                    .header(header::AUTHORIZATION, f.bearer(OWNER))
                    .header(SUBJECT_HEADER, OWNER)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(owner.status(), StatusCode::OK);

        let forged_download = f
            .app
            .clone()
            .oneshot(
                Request::get(format!("/download/{cid}"))
                    .header(header::AUTHORIZATION, f.bearer(STRANGER))
                    .header(SUBJECT_HEADER, OWNER)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(forged_download.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_identifier_falls_through_to_blob() {
        let f = fixture();
        let mut rng = StdRng::seed_from_u64(3);
        let session = Credential::new(OWNER, "t").unwrap();
        let receipt = f
            .upload
            .upload(request(b"raw envelope"), &session, &mut rng, None)
            .await
            .unwrap();
        let cid = receipt.metadata_cid.unwrap();

        // Not resolved yet: /download serves the stored envelope as-is.
        let response = f
            .app
            .clone()
            .oneshot(Request::get(format!("/download/{cid}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let envelope: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(envelope["version"], "IPVAULT-ENCRYPTED-V1");

        let missing = f
            .app
            .oneshot(Request::get("/download/nothing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_manifest_is_rejected() {
        let f = fixture();
        let response = f
            .app
            .oneshot(
                Request::post("/api/manifests")
                    .body(Body::from("{\"not\":\"a bundle\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
