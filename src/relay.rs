use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderName, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use axum_extra::extract::Multipart;
use tokio_util::sync::CancellationToken;

use crate::blob_store::{BlobStore, MemoryBlobStore};
use crate::protocol::{
    progress_percent, ChunkQuery, ErrorBody, FileDescriptor, RegisterFileRequest, RelayStatus,
    SessionRef, StartSessionRequest, SuccessBody, UploadAck, HEADER_CHUNK_INDEX, HEADER_FILE_ID,
    HEADER_TOTAL_CHUNKS,
};
use crate::rate_limit::{Direction, RateKey, RateLimiter, DEFAULT_RATE_CAP};
use crate::session_store::{RelaySessionStore, StoreError, DEFAULT_STORAGE_LIMIT};
use crate::{codec, logging, rlog};

/// Slack on top of the chunk size for multipart framing and the session field.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

const ANONYMOUS_PEER: &str = "anonymous";

#[derive(Clone)]
pub struct RelayConfig {
    pub storage_limit: u64,
    /// Per-peer cap in bytes per second for each direction; zero disables.
    pub rate_limit_bps: u64,
    pub max_chunk_bytes: usize,
    pub stats_interval: Duration,
    pub log_sink: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            storage_limit: DEFAULT_STORAGE_LIMIT,
            rate_limit_bps: DEFAULT_RATE_CAP,
            max_chunk_bytes: codec::RELAY_CHUNK_SIZE,
            stats_interval: Duration::from_secs(60),
            log_sink: None,
        }
    }
}

#[derive(Clone)]
pub struct RelayState {
    config: RelayConfig,
    store: Arc<RelaySessionStore>,
    limiter: Arc<RateLimiter>,
    shutdown: CancellationToken,
    start_time: Instant,
}

pub fn app(state: RelayState) -> Router {
    let body_limit = state.config.max_chunk_bytes + MULTIPART_OVERHEAD;
    Router::new()
        .route("/relay/status", get(relay_status))
        .route("/relay/session/start", post(start_session))
        .route("/relay/session/:session_id", delete(end_session))
        .route("/relay/file/register", post(register_file))
        .route(
            "/relay/file/:file_id/chunk/:chunk_index",
            post(upload_chunk).get(download_chunk).delete(delete_chunk),
        )
        .route("/relay/file/:file_id/status", get(file_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

impl RelayState {
    pub fn new(config: RelayConfig, blobs: Arc<dyn BlobStore>) -> Self {
        let store = Arc::new(RelaySessionStore::new(blobs, config.storage_limit));
        let limiter = Arc::new(RateLimiter::with_system_clock(config.rate_limit_bps));
        Self {
            config,
            store,
            limiter,
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        }
    }

    pub fn in_memory(config: RelayConfig) -> Self {
        Self::new(config, Arc::new(MemoryBlobStore::new()))
    }

    pub fn store(&self) -> &Arc<RelaySessionStore> {
        &self.store
    }

    /// Release throttled requests and free every session.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        let drained = self.store.shutdown().await;
        log_message(
            &self.config,
            format!(
                "relay: shut down after {}s, drained {} session(s)",
                self.start_time.elapsed().as_secs(),
                drained
            ),
        );
        drained
    }

    pub fn start_stats_log_task(&self, mut shutdown_rx: tokio::sync::oneshot::Receiver<()>) {
        if self.config.stats_interval.is_zero() {
            return;
        }
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state.config.stats_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sessions = state.store.session_count().await;
                        log_message(
                            &state.config,
                            format!("relay: {} active session(s)", sessions),
                        );
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
        });
    }

    async fn throttle(&self, direction: Direction, peer_id: &str, bytes: usize) {
        let key = RateKey::peer(direction, peer_id);
        self.limiter
            .throttle(&key, bytes as u64, &self.shutdown)
            .await;
    }
}

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: message.into(),
        code: code.to_string(),
        message: None,
        waiting: None,
    };
    (status, Json(body)).into_response()
}

fn store_error(error: StoreError) -> Response {
    let status = match &error {
        StoreError::SessionNotFound(_)
        | StoreError::FileNotFound(_)
        | StoreError::ChunkNotYetUploaded { .. } => StatusCode::NOT_FOUND,
        StoreError::MissingPeerId
        | StoreError::InvalidFileMetadata(_)
        | StoreError::PayloadMissing
        | StoreError::ChunkOutOfRange { .. } => StatusCode::BAD_REQUEST,
        StoreError::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        StoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if let StoreError::ChunkNotYetUploaded { .. } = &error {
        let body = ErrorBody {
            error: error.to_string(),
            code: error.code().to_string(),
            message: Some("chunk has not been uploaded by the sender yet, retry later".to_string()),
            waiting: Some(true),
        };
        return (status, Json(body)).into_response();
    }
    api_error(status, error.code(), error.to_string())
}

fn parse_chunk_index(raw: &str) -> Result<u32, Response> {
    raw.parse().map_err(|_| {
        api_error(
            StatusCode::BAD_REQUEST,
            "invalid_chunk_index",
            format!("invalid chunk index: {raw}"),
        )
    })
}

fn missing_session() -> Response {
    api_error(
        StatusCode::NOT_FOUND,
        "session_not_found",
        "no valid session",
    )
}

async fn relay_status(State(state): State<RelayState>) -> impl IntoResponse {
    Json(RelayStatus {
        status: "online".to_string(),
        timestamp: logging::iso_timestamp(SystemTime::now()),
        sessions: state.store.session_count().await,
    })
}

async fn start_session(
    State(state): State<RelayState>,
    body: Option<Json<StartSessionRequest>>,
) -> Response {
    let peer_id = body
        .and_then(|Json(request)| request.peer_id)
        .unwrap_or_default();
    match state.store.start_session(&peer_id).await {
        Ok(info) => {
            log_message(
                &state.config,
                format!(
                    "relay: session {} started by {}",
                    logging::session_id(&info.session_id),
                    logging::peer_id(&peer_id)
                ),
            );
            Json(info).into_response()
        }
        Err(error) => store_error(error),
    }
}

async fn end_session(
    State(state): State<RelayState>,
    Path(session_id): Path<String>,
) -> Response {
    if !state.store.end_session(&session_id).await {
        return store_error(StoreError::SessionNotFound(session_id));
    }
    log_message(
        &state.config,
        format!("relay: session {} ended", logging::session_id(&session_id)),
    );
    Json(SuccessBody { success: true }).into_response()
}

async fn register_file(
    State(state): State<RelayState>,
    body: Option<Json<serde_json::Value>>,
) -> Response {
    // A badly typed field is invalid metadata, not a missing session.
    let body = body.map(|Json(value)| value).unwrap_or_default();
    let Some(session_id) = body
        .get("sessionId")
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
    else {
        return missing_session();
    };
    let request: RegisterFileRequest = serde_json::from_value(body).unwrap_or_default();

    let (file_id, file_name, file_size, total_chunks) = match (
        request.file_id,
        request.file_name,
        request.file_size,
        request.total_chunks,
    ) {
        (Some(id), Some(name), Some(size), Some(total)) => (id, name, size, total),
        _ => {
            // Report an unknown session before malformed metadata.
            if let Err(error) = state.store.session_info(&session_id).await {
                return store_error(error);
            }
            return api_error(
                StatusCode::BAD_REQUEST,
                "invalid_file_metadata",
                "missing file fields",
            );
        }
    };
    let descriptor = FileDescriptor {
        file_id,
        file_name,
        file_size: u64::try_from(file_size).unwrap_or(0),
        total_chunks: u32::try_from(total_chunks).unwrap_or(0),
    };

    let file_id = descriptor.file_id.clone();
    let total_chunks = descriptor.total_chunks;
    match state.store.register_file(&session_id, descriptor).await {
        Ok(()) => {
            log_message(
                &state.config,
                format!(
                    "relay: file {} registered in {} ({} chunks)",
                    logging::file_id(&file_id),
                    logging::session_id(&session_id),
                    total_chunks
                ),
            );
            Json(SuccessBody { success: true }).into_response()
        }
        Err(error) => store_error(error),
    }
}

async fn upload_chunk(
    State(state): State<RelayState>,
    Path((file_id, chunk_index)): Path<(String, String)>,
    mut multipart: Multipart,
) -> Response {
    let index = match parse_chunk_index(&chunk_index) {
        Ok(index) => index,
        Err(response) => return response,
    };

    let mut session_id: Option<String> = None;
    let mut chunk: Option<Vec<u8>> = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return api_error(
                    StatusCode::BAD_REQUEST,
                    "payload_missing",
                    format!("failed to read multipart body: {e}"),
                )
            }
        };
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "sessionId" => session_id = field.text().await.ok(),
            "chunk" => match field.bytes().await {
                Ok(bytes) => chunk = Some(bytes.to_vec()),
                Err(e) => {
                    return api_error(
                        StatusCode::BAD_REQUEST,
                        "payload_missing",
                        format!("failed to read chunk: {e}"),
                    )
                }
            },
            _ => {}
        }
    }

    let Some(session_id) = session_id.filter(|s| !s.is_empty()) else {
        return missing_session();
    };
    let bytes = chunk.unwrap_or_default();

    let outcome = match state
        .store
        .put_chunk(&session_id, &file_id, index, &bytes)
        .await
    {
        Ok(outcome) => outcome,
        Err(error) => return store_error(error),
    };

    if outcome.newly_stored && outcome.uploaded_count == outcome.total_chunks {
        log_message(
            &state.config,
            format!(
                "relay: file {} fully uploaded ({} chunks)",
                logging::file_id(&file_id),
                outcome.total_chunks
            ),
        );
    }

    let owner = state
        .store
        .session_owner(&session_id)
        .await
        .unwrap_or_else(|_| ANONYMOUS_PEER.to_string());
    state.throttle(Direction::Upload, &owner, bytes.len()).await;

    Json(UploadAck {
        success: true,
        file_id,
        chunk_index: index,
        uploaded_chunks: outcome.uploaded_count,
        total_chunks: outcome.total_chunks,
        progress: progress_percent(outcome.uploaded_count, outcome.total_chunks),
    })
    .into_response()
}

async fn download_chunk(
    State(state): State<RelayState>,
    Path((file_id, chunk_index)): Path<(String, String)>,
    Query(query): Query<ChunkQuery>,
) -> Response {
    let index = match parse_chunk_index(&chunk_index) {
        Ok(index) => index,
        Err(response) => return response,
    };
    let Some(session_id) = query.session_id.as_deref().filter(|s| !s.is_empty()) else {
        return missing_session();
    };
    let peer_id = query.peer_id.as_deref().filter(|p| !p.is_empty());

    let chunk = match state
        .store
        .get_chunk(
            session_id,
            &file_id,
            index,
            peer_id,
            query.find_across_sessions(),
        )
        .await
    {
        Ok(chunk) => chunk,
        Err(error) => return store_error(error),
    };

    state
        .throttle(
            Direction::Download,
            peer_id.unwrap_or(ANONYMOUS_PEER),
            chunk.bytes.len(),
        )
        .await;

    let headers = [
        (CONTENT_TYPE, "application/octet-stream".to_string()),
        (CACHE_CONTROL, "no-cache, no-store, must-revalidate".to_string()),
        (HeaderName::from_static(HEADER_CHUNK_INDEX), index.to_string()),
        (
            HeaderName::from_static(HEADER_TOTAL_CHUNKS),
            chunk.total_chunks.to_string(),
        ),
        (HeaderName::from_static(HEADER_FILE_ID), file_id),
    ];
    (StatusCode::OK, headers, chunk.bytes).into_response()
}

async fn delete_chunk(
    State(state): State<RelayState>,
    Path((file_id, chunk_index)): Path<(String, String)>,
    body: Option<Json<SessionRef>>,
) -> Response {
    let index = match parse_chunk_index(&chunk_index) {
        Ok(index) => index,
        Err(response) => return response,
    };
    let Some(session_id) = body
        .and_then(|Json(body)| body.session_id)
        .filter(|s| !s.is_empty())
    else {
        return missing_session();
    };

    match state.store.delete_chunk(&session_id, &file_id, index).await {
        Ok(true) => Json(SuccessBody { success: true }).into_response(),
        Ok(false) => api_error(
            StatusCode::NOT_FOUND,
            "chunk_not_found",
            format!("chunk {index} of {file_id} not found"),
        ),
        Err(error) => store_error(error),
    }
}

async fn file_status(
    State(state): State<RelayState>,
    Path(file_id): Path<String>,
    Query(query): Query<SessionRef>,
) -> Response {
    let Some(session_id) = query.session_id.filter(|s| !s.is_empty()) else {
        return missing_session();
    };
    match state.store.file_status(&session_id, &file_id).await {
        Ok(status) => Json(status).into_response(),
        Err(error) => store_error(error),
    }
}

fn log_message(config: &RelayConfig, message: String) {
    if let Some(log_sink) = &config.log_sink {
        log_sink(message);
    } else {
        rlog!("{message}");
    }
}
