//! Wire types for the direct peer channel and the relay HTTP API.
//!
//! ## Direct channel
//! - Frames are JSON objects tagged by `dataType`.
//! - `FILE` frames with `chunkIndex == -1` carry metadata only ("META");
//!   all other `FILE` frames carry base64 chunk bytes in `data`.
//! - The sender finishes a file with a `FILE_HASH` frame holding the
//!   lowercase hex SHA-256 of the whole file.
//! - `RELAY_*` frames coordinate a transfer that goes through the relay
//!   instead of the channel, and `PING` frames carry heartbeats.
//!
//! ## Relay HTTP
//! Request and response bodies are camelCase JSON. Error responses carry
//! `{error, code}` where `code` is a stable machine-readable string.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// `chunkIndex` of a metadata-only `FILE` frame.
pub const META_CHUNK_INDEX: i64 = -1;

pub const MESSAGE_META: &str = "META";
pub const MESSAGE_HASH_VALUE: &str = "HASH_VALUE";
pub const MESSAGE_HASH_MATCH: &str = "HASH_MATCH";
pub const MESSAGE_HASH_MISMATCH: &str = "HASH_MISMATCH";
pub const MESSAGE_MISSING_CHUNKS: &str = "MISSING_CHUNKS";
pub const MESSAGE_PING: &str = "ping";
pub const MESSAGE_PONG: &str = "pong";

pub const HEADER_CHUNK_INDEX: &str = "x-chunk-index";
pub const HEADER_TOTAL_CHUNKS: &str = "x-total-chunks";
pub const HEADER_FILE_ID: &str = "x-file-id";

#[derive(Debug)]
pub enum ProtocolError {
    Serde(serde_json::Error),
    Base64(base64::DecodeError),
    MissingData { file_id: String, chunk_index: i64 },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Serde(error) => write!(f, "serde error: {error}"),
            ProtocolError::Base64(error) => write!(f, "invalid chunk encoding: {error}"),
            ProtocolError::MissingData {
                file_id,
                chunk_index,
            } => write!(f, "chunk {chunk_index} of {file_id} has no data"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<serde_json::Error> for ProtocolError {
    fn from(error: serde_json::Error) -> Self {
        ProtocolError::Serde(error)
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(error: base64::DecodeError) -> Self {
        ProtocolError::Base64(error)
    }
}

/// A `FILE` frame: metadata (`chunkIndex == -1`) or one chunk of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFrame {
    pub file_id: String,
    pub file_name: String,
    #[serde(default)]
    pub file_type: String,
    pub file_size: u64,
    pub chunk_index: i64,
    pub total_chunks: u32,
    pub chunk_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl FileFrame {
    pub fn is_meta(&self) -> bool {
        self.chunk_index == META_CHUNK_INDEX
    }

    pub fn set_data(&mut self, bytes: &[u8]) {
        self.data = Some(STANDARD.encode(bytes));
    }

    pub fn decode_data(&self) -> Result<Vec<u8>, ProtocolError> {
        let data = self.data.as_deref().ok_or_else(|| ProtocolError::MissingData {
            file_id: self.file_id.clone(),
            chunk_index: self.chunk_index,
        })?;
        Ok(STANDARD.decode(data)?)
    }
}

/// Announces a file staged on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayFileInfo {
    pub file_id: String,
    pub file_name: String,
    #[serde(default)]
    pub file_type: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub chunk_size: u32,
    pub session_id: String,
    pub peer_id: String,
    /// SHA-256 of the whole file as lowercase hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "dataType",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ChannelMessage {
    File(FileFrame),
    FileHash {
        file_id: String,
        file_hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    RelayFileInfo(RelayFileInfo),
    /// Chunk bookkeeping for a relay transfer; `MISSING_CHUNKS` asks the
    /// sender to re-upload `missingChunks`.
    RelayChunkInfo {
        file_id: String,
        message: String,
        #[serde(default)]
        missing_chunks: Vec<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
    },
    /// Sent by a receiver once a relay download is complete.
    RelayDownloadReady {
        file_id: String,
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Ping {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },
}

impl ChannelMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn ping(peer_id: &str) -> Self {
        ChannelMessage::Ping {
            message: MESSAGE_PING.to_string(),
            peer_id: Some(peer_id.to_string()),
        }
    }

    pub fn pong(peer_id: &str) -> Self {
        ChannelMessage::Ping {
            message: MESSAGE_PONG.to_string(),
            peer_id: Some(peer_id.to_string()),
        }
    }

    pub fn missing_chunks(file_id: &str, session_id: &str, missing: Vec<u32>) -> Self {
        ChannelMessage::RelayChunkInfo {
            file_id: file_id.to_string(),
            message: MESSAGE_MISSING_CHUNKS.to_string(),
            missing_chunks: missing,
            session_id: Some(session_id.to_string()),
            progress: None,
        }
    }

    /// The file this message refers to, if any.
    pub fn file_id(&self) -> Option<&str> {
        match self {
            ChannelMessage::File(frame) => Some(&frame.file_id),
            ChannelMessage::FileHash { file_id, .. }
            | ChannelMessage::RelayChunkInfo { file_id, .. }
            | ChannelMessage::RelayDownloadReady { file_id, .. } => Some(file_id),
            ChannelMessage::RelayFileInfo(info) => Some(&info.file_id),
            ChannelMessage::Ping { .. } => None,
        }
    }
}

// Relay HTTP bodies.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    #[serde(default)]
    pub peer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: String,
    pub storage_used: u64,
    pub storage_limit: u64,
}

/// File metadata as registered with the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
}

/// Register body; every field is optional on the wire so the relay can
/// answer 400 for missing ones instead of a decode rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterFileRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub total_chunks: Option<i64>,
}

impl RegisterFileRequest {
    pub fn new(session_id: &str, file: &FileDescriptor) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            file_id: Some(file.file_id.clone()),
            file_name: Some(file.file_name.clone()),
            file_size: Some(file.file_size as i64),
            total_chunks: Some(i64::from(file.total_chunks)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAck {
    pub success: bool,
    pub file_id: String,
    pub chunk_index: u32,
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
    pub progress: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkQuery {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub find_across_sessions: Option<String>,
}

impl ChunkQuery {
    pub fn find_across_sessions(&self) -> bool {
        self.find_across_sessions.as_deref() == Some("true")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub uploaded_chunks: Vec<u32>,
    pub downloaded_chunks: BTreeMap<String, Vec<u32>>,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatus {
    pub status: String,
    pub timestamp: String,
    pub sessions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessBody {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting: Option<bool>,
}

/// Fresh transfer id: `file_<unix ms>_<8 hex>`.
pub fn new_file_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("file_{}_{:08x}", millis, rand::random::<u32>())
}

/// `floor(uploaded * 100 / total)`.
pub fn progress_percent(uploaded: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    (u64::from(uploaded) * 100 / u64::from(total)).min(100) as u8
}
