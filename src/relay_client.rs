//! Async client for the relay HTTP API.
//!
//! A `RelayClient` owns one relay session at a time, a queue per direction
//! and a direction-keyed rate limiter. Chunk transfers go through the queue,
//! then the limiter, then the network, with a cancellation checkpoint at
//! each step and inside retry backoff.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::protocol::{
    ErrorBody, FileDescriptor, FileStatus, RegisterFileRequest, RelayStatus, SessionInfo,
    SessionRef, StartSessionRequest, UploadAck, HEADER_TOTAL_CHUNKS,
};
use crate::queue::{Outcome, TransferQueue, DEFAULT_MAX_CONCURRENT};
use crate::rate_limit::{Direction, RateKey, RateLimiter, Throttle, DEFAULT_RATE_CAP};
use crate::{logging, rlog};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            initial_delay: Duration::from_millis(200),
            factor: 1.2,
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(retry as i32);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    pub base_url: String,
    pub peer_id: String,
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
    /// Client-side cap per direction in bytes per second; zero disables.
    pub rate_limit_bps: u64,
    pub request_timeout: Duration,
}

impl RelayClientConfig {
    pub fn new(base_url: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            peer_id: peer_id.into(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            retry: RetryPolicy::default(),
            rate_limit_bps: DEFAULT_RATE_CAP,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub enum ClientError {
    Http(String),
    Status {
        status: u16,
        code: String,
        message: String,
    },
    NoSession,
    ChunkNotYetUploaded {
        file_id: String,
        index: u32,
    },
    RetriesExhausted {
        attempts: u32,
        last: Box<ClientError>,
    },
    Decode(String),
}

impl ClientError {
    /// Transport failures, relay-side 5xx and chunks the sender has not
    /// uploaded yet are worth retrying; other 4xx are caller errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(_) | ClientError::ChunkNotYetUploaded { .. } => true,
            ClientError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Error code reported by the relay, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Status { code, .. } => Some(code),
            ClientError::ChunkNotYetUploaded { .. } => Some("chunk_not_yet_uploaded"),
            ClientError::RetriesExhausted { last, .. } => last.code(),
            _ => None,
        }
    }

    fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Status { status: 404, .. })
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Http(detail) => write!(f, "relay request failed: {detail}"),
            ClientError::Status {
                status,
                code,
                message,
            } => write!(f, "relay returned {status} ({code}): {message}"),
            ClientError::NoSession => write!(f, "no relay session"),
            ClientError::ChunkNotYetUploaded { file_id, index } => {
                write!(f, "chunk {index} of {file_id} not uploaded yet")
            }
            ClientError::RetriesExhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            ClientError::Decode(detail) => write!(f, "invalid relay response: {detail}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            ClientError::Decode(error.to_string())
        } else {
            ClientError::Http(error.to_string())
        }
    }
}

/// One chunk fetched from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedChunk {
    pub index: u32,
    pub total_chunks: Option<u32>,
    pub bytes: Vec<u8>,
}

pub struct RelayClient {
    http: reqwest::Client,
    config: RelayClientConfig,
    session: Mutex<Option<SessionInfo>>,
    registered: Mutex<HashMap<String, FileDescriptor>>,
    uploads: TransferQueue,
    downloads: TransferQueue,
    limiter: RateLimiter,
}

impl RelayClient {
    pub fn new(config: RelayClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            uploads: TransferQueue::new("upload", config.max_concurrent),
            downloads: TransferQueue::new("download", config.max_concurrent),
            limiter: RateLimiter::with_system_clock(config.rate_limit_bps),
            session: Mutex::new(None),
            registered: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.config.peer_id
    }

    pub fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    pub fn upload_queue(&self) -> &TransferQueue {
        &self.uploads
    }

    pub fn download_queue(&self) -> &TransferQueue {
        &self.downloads
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    fn session_slot(&self) -> MutexGuard<'_, Option<SessionInfo>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn registered(&self) -> MutexGuard<'_, HashMap<String, FileDescriptor>> {
        self.registered.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.session_slot().clone()
    }

    pub fn session_id(&self) -> Result<String, ClientError> {
        self.session_slot()
            .as_ref()
            .map(|s| s.session_id.clone())
            .ok_or(ClientError::NoSession)
    }

    pub async fn status(&self) -> Result<RelayStatus, ClientError> {
        let response = self.http.get(self.url("/relay/status")).send().await?;
        Ok(check(response).await?.json().await?)
    }

    /// Whether the relay answers its status endpoint.
    pub async fn check_server(&self) -> bool {
        match self.status().await {
            Ok(status) => status.status == "online",
            Err(error) => {
                rlog!("relay client: {} unreachable: {}", self.base_url(), error);
                false
            }
        }
    }

    /// Start a fresh session, ending any previous one first.
    pub async fn start_session(&self) -> Result<SessionInfo, ClientError> {
        self.end_session().await;
        let body = StartSessionRequest {
            peer_id: Some(self.config.peer_id.clone()),
        };
        let response = self
            .http
            .post(self.url("/relay/session/start"))
            .json(&body)
            .send()
            .await?;
        let info: SessionInfo = check(response).await?.json().await?;
        rlog!(
            "relay client: {} started {}",
            logging::peer_id(&self.config.peer_id),
            logging::session_id(&info.session_id)
        );
        *self.session_slot() = Some(info.clone());
        Ok(info)
    }

    /// The current session, starting one if there is none.
    pub async fn ensure_session(&self) -> Result<SessionInfo, ClientError> {
        if let Some(info) = self.session() {
            return Ok(info);
        }
        self.start_session().await
    }

    /// End the current session. Best-effort: failures are logged and an
    /// already-gone session counts as ended.
    pub async fn end_session(&self) -> bool {
        let Some(info) = self.session_slot().take() else {
            return false;
        };
        self.registered().clear();
        let url = self.url(&format!("/relay/session/{}", info.session_id));
        let result = match self.http.delete(url).send().await {
            Ok(response) => check(response).await.map(|_| ()),
            Err(error) => Err(error.into()),
        };
        match result {
            Ok(()) => true,
            Err(error) if error.is_not_found() => true,
            Err(error) => {
                rlog!(
                    "relay client: failed to end {}: {}",
                    logging::session_id(&info.session_id),
                    error
                );
                false
            }
        }
    }

    pub async fn register_file(&self, file: &FileDescriptor) -> Result<(), ClientError> {
        let session_id = self.session_id()?;
        let body = RegisterFileRequest::new(&session_id, file);
        let response = self
            .http
            .post(self.url("/relay/file/register"))
            .json(&body)
            .send()
            .await?;
        check(response).await?;
        self.registered()
            .insert(file.file_id.clone(), file.clone());
        Ok(())
    }

    /// Upload one chunk through the upload queue, retrying transient
    /// failures.
    pub async fn upload_chunk(
        &self,
        file_id: &str,
        index: u32,
        bytes: &[u8],
        scope: &CancellationToken,
    ) -> Result<Outcome<UploadAck>, ClientError> {
        let session_id = self.session_id()?;
        let key = RateKey::direction(Direction::Upload);
        let outcome = self
            .uploads
            .run(scope, |token| async move {
                if let Throttle::Aborted = self
                    .limiter
                    .throttle(&key, bytes.len() as u64, &token)
                    .await
                {
                    return Ok(Outcome::Aborted);
                }
                let session_id = session_id.as_str();
                self.retrying(&token, move || {
                    self.post_chunk(session_id, file_id, index, bytes)
                })
                .await
            })
            .await?;
        Ok(flatten(outcome))
    }

    /// Download one chunk through the download queue.
    ///
    /// Reads under this client's own session with cross-session lookup, so
    /// the file must be registered here too. A `file_not_found` answer
    /// re-registers the file once before retrying.
    pub async fn download_chunk(
        &self,
        file_id: &str,
        index: u32,
        scope: &CancellationToken,
    ) -> Result<Outcome<DownloadedChunk>, ClientError> {
        let session_id = self.session_id()?;
        let key = RateKey::direction(Direction::Download);
        let outcome = self
            .downloads
            .run(scope, |token| async move {
                if let Throttle::Aborted = self.limiter.throttle(&key, 0, &token).await {
                    return Ok::<_, ClientError>(Outcome::Aborted);
                }
                let resynced = AtomicBool::new(false);
                let (session_id, resynced) = (session_id.as_str(), &resynced);
                let outcome = self
                    .retrying(&token, move || async move {
                        match self.fetch_chunk(session_id, file_id, index).await {
                            Err(error)
                                if error.code() == Some("file_not_found")
                                    && !resynced.swap(true, Ordering::SeqCst) =>
                            {
                                self.resync_file(file_id).await?;
                                self.fetch_chunk(session_id, file_id, index).await
                            }
                            other => other,
                        }
                    })
                    .await?;
                if let Outcome::Done(chunk) = &outcome {
                    self.limiter.account(&key, chunk.bytes.len() as u64);
                }
                Ok::<_, ClientError>(outcome)
            })
            .await?;
        Ok(flatten(outcome))
    }

    /// Delete one chunk from the current session. Best-effort.
    pub async fn delete_chunk(&self, file_id: &str, index: u32) -> bool {
        let Ok(session_id) = self.session_id() else {
            return false;
        };
        let url = self.url(&format!("/relay/file/{file_id}/chunk/{index}"));
        let body = SessionRef {
            session_id: Some(session_id),
        };
        let result = match self.http.delete(url).json(&body).send().await {
            Ok(response) => check(response).await.map(|_| ()),
            Err(error) => Err(error.into()),
        };
        match result {
            Ok(()) => true,
            Err(error) => {
                rlog!(
                    "relay client: failed to delete chunk {} of {}: {}",
                    index,
                    logging::file_id(file_id),
                    error
                );
                false
            }
        }
    }

    pub async fn file_status(&self, file_id: &str) -> Result<FileStatus, ClientError> {
        let session_id = self.session_id()?;
        self.file_status_in(&session_id, file_id).await
    }

    /// Status of `file_id` as registered in another peer's session.
    pub async fn file_status_in(
        &self,
        session_id: &str,
        file_id: &str,
    ) -> Result<FileStatus, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/relay/file/{file_id}/status")))
            .query(&[("sessionId", session_id)])
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Abort everything queued or running in both directions.
    pub fn abort_all(&self) -> usize {
        self.uploads.abort() + self.downloads.abort()
    }

    async fn post_chunk(
        &self,
        session_id: &str,
        file_id: &str,
        index: u32,
        bytes: &[u8],
    ) -> Result<UploadAck, ClientError> {
        let form = Form::new()
            .text("sessionId", session_id.to_string())
            .part(
                "chunk",
                Part::bytes(bytes.to_vec()).file_name(format!("chunk_{index}")),
            );
        let response = self
            .http
            .post(self.url(&format!("/relay/file/{file_id}/chunk/{index}")))
            .multipart(form)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn fetch_chunk(
        &self,
        session_id: &str,
        file_id: &str,
        index: u32,
    ) -> Result<DownloadedChunk, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/relay/file/{file_id}/chunk/{index}")))
            .query(&[
                ("sessionId", session_id),
                ("peerId", self.config.peer_id.as_str()),
                ("findAcrossSessions", "true"),
            ])
            .send()
            .await?;
        let response = match check(response).await {
            Ok(response) => response,
            Err(error) if error.code() == Some("chunk_not_yet_uploaded") => {
                return Err(ClientError::ChunkNotYetUploaded {
                    file_id: file_id.to_string(),
                    index,
                })
            }
            Err(error) => return Err(error),
        };
        let total_chunks = response
            .headers()
            .get(HEADER_TOTAL_CHUNKS)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let bytes = response.bytes().await?.to_vec();
        Ok(DownloadedChunk {
            index,
            total_chunks,
            bytes,
        })
    }

    async fn resync_file(&self, file_id: &str) -> Result<(), ClientError> {
        let known = self.registered().get(file_id).cloned();
        let Some(file) = known else {
            return Err(ClientError::Status {
                status: StatusCode::NOT_FOUND.as_u16(),
                code: "file_not_found".to_string(),
                message: format!("{file_id} is not registered with this client"),
            });
        };
        rlog!(
            "relay client: re-registering {} after file_not_found",
            logging::file_id(file_id)
        );
        self.register_file(&file).await
    }

    async fn retrying<T, F, Fut>(
        &self,
        token: &CancellationToken,
        mut attempt: F,
    ) -> Result<Outcome<T>, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let policy = &self.config.retry;
        let mut attempts = 0;
        loop {
            if token.is_cancelled() {
                return Ok(Outcome::Aborted);
            }
            attempts += 1;
            let error = match attempt().await {
                Ok(value) => return Ok(Outcome::Done(value)),
                Err(error) => error,
            };
            if !error.is_retryable() {
                return Err(error);
            }
            if attempts >= policy.max_attempts.max(1) {
                return Err(ClientError::RetriesExhausted {
                    attempts,
                    last: Box::new(error),
                });
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(Outcome::Aborted),
                _ = tokio::time::sleep(policy.delay(attempts - 1)) => {}
            }
        }
    }
}

fn flatten<T>(outcome: Outcome<Outcome<T>>) -> Outcome<T> {
    match outcome {
        Outcome::Done(inner) => inner,
        Outcome::Aborted => Outcome::Aborted,
    }
}

/// Pass through success responses; turn relay error bodies into
/// `ClientError::Status`.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => (body.code, body.error),
        Err(_) => ("http_error".to_string(), text),
    };
    Err(ClientError::Status {
        status: status.as_u16(),
        code,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_to_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(200));
        assert_eq!(policy.delay(1), Duration::from_millis(240));
        assert_eq!(policy.delay(30), Duration::from_secs(2));
    }

    #[test]
    fn only_transient_errors_retry() {
        let status = |status: u16, code: &str| ClientError::Status {
            status,
            code: code.to_string(),
            message: String::new(),
        };
        assert!(ClientError::Http("reset".into()).is_retryable());
        assert!(status(503, "internal").is_retryable());
        assert!(ClientError::ChunkNotYetUploaded {
            file_id: "f".into(),
            index: 0
        }
        .is_retryable());
        assert!(!status(413, "quota_exceeded").is_retryable());
        assert!(!status(400, "chunk_out_of_range").is_retryable());
        assert!(!ClientError::NoSession.is_retryable());
    }

    #[test]
    fn exhausted_retries_keep_the_last_code() {
        let error = ClientError::RetriesExhausted {
            attempts: 15,
            last: Box::new(ClientError::ChunkNotYetUploaded {
                file_id: "f".into(),
                index: 3,
            }),
        };
        assert_eq!(error.code(), Some("chunk_not_yet_uploaded"));
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn chunk_ops_need_a_session() {
        let client = RelayClient::new(RelayClientConfig::new("http://127.0.0.1:9", "alice")).unwrap();
        let scope = CancellationToken::new();
        assert!(matches!(
            client.upload_chunk("f", 0, b"x", &scope).await,
            Err(ClientError::NoSession)
        ));
        assert!(matches!(
            client.download_chunk("f", 0, &scope).await,
            Err(ClientError::NoSession)
        ));
        assert!(!client.end_session().await);
        assert!(!client.delete_chunk("f", 0).await);
    }
}
