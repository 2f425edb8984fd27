//! Server-side authority over relay sessions, registered files and chunk
//! presence.
//!
//! The session map is guarded by an `RwLock`; each file record has its own
//! mutex, so chunk uploads to different files proceed in parallel while
//! uploads to the same file are serialised. Session storage counters are
//! only changed while the owning file's lock is held.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::{Mutex, RwLock};

use crate::blob_store::{BlobStore, ChunkKey};
use crate::logging;
use crate::protocol::{FileDescriptor, FileStatus, SessionInfo};
use crate::rlog;

/// Per-session storage quota.
pub const DEFAULT_STORAGE_LIMIT: u64 = 5 * 1024 * 1024 * 1024;

const SESSION_TOKEN_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    MissingPeerId,
    SessionNotFound(String),
    FileNotFound(String),
    ChunkNotYetUploaded { file_id: String, index: u32 },
    InvalidFileMetadata(&'static str),
    PayloadMissing,
    ChunkOutOfRange { index: u32, total_chunks: u32 },
    QuotaExceeded { used: u64, limit: u64, requested: u64 },
    Storage(String),
}

impl StoreError {
    /// Stable machine-readable code used in relay error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::MissingPeerId => "missing_peer_id",
            StoreError::SessionNotFound(_) => "session_not_found",
            StoreError::FileNotFound(_) => "file_not_found",
            StoreError::ChunkNotYetUploaded { .. } => "chunk_not_yet_uploaded",
            StoreError::InvalidFileMetadata(_) => "invalid_file_metadata",
            StoreError::PayloadMissing => "payload_missing",
            StoreError::ChunkOutOfRange { .. } => "chunk_out_of_range",
            StoreError::QuotaExceeded { .. } => "quota_exceeded",
            StoreError::Storage(_) => "internal",
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::MissingPeerId => write!(f, "peerId is required"),
            StoreError::SessionNotFound(id) => write!(f, "session not found: {id}"),
            StoreError::FileNotFound(id) => write!(f, "file not found: {id}"),
            StoreError::ChunkNotYetUploaded { file_id, index } => {
                write!(f, "chunk {index} of {file_id} not uploaded yet")
            }
            StoreError::InvalidFileMetadata(field) => {
                write!(f, "missing or invalid file field: {field}")
            }
            StoreError::PayloadMissing => write!(f, "chunk payload missing"),
            StoreError::ChunkOutOfRange {
                index,
                total_chunks,
            } => write!(f, "chunk index {index} outside 0..{total_chunks}"),
            StoreError::QuotaExceeded {
                used,
                limit,
                requested,
            } => write!(
                f,
                "storage limit exceeded: {used} + {requested} bytes > {limit}"
            ),
            StoreError::Storage(detail) => write!(f, "storage error: {detail}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(error: std::io::Error) -> Self {
        StoreError::Storage(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub uploaded_count: u32,
    pub total_chunks: u32,
    /// `false` when the index was already present.
    pub newly_stored: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    pub bytes: Vec<u8>,
    pub total_chunks: u32,
    /// Session the bytes were found in; differs from the request's session
    /// after a cross-session lookup.
    pub source_session: String,
}

struct FileRecord {
    descriptor: FileDescriptor,
    /// Uploaded index → stored byte length.
    uploaded: BTreeMap<u32, u64>,
    downloaded: BTreeMap<String, BTreeSet<u32>>,
    retired: bool,
}

impl FileRecord {
    fn new(descriptor: FileDescriptor) -> Self {
        Self {
            descriptor,
            uploaded: BTreeMap::new(),
            downloaded: BTreeMap::new(),
            retired: false,
        }
    }

    fn stored_bytes(&self) -> u64 {
        self.uploaded.values().sum()
    }

    fn status(&self) -> FileStatus {
        FileStatus {
            file_name: self.descriptor.file_name.clone(),
            file_size: self.descriptor.file_size,
            total_chunks: self.descriptor.total_chunks,
            uploaded_chunks: self.uploaded.keys().copied().collect(),
            downloaded_chunks: self
                .downloaded
                .iter()
                .map(|(peer, chunks)| (peer.clone(), chunks.iter().copied().collect()))
                .collect(),
            completed: self.uploaded.len() as u32 == self.descriptor.total_chunks,
        }
    }
}

struct Session {
    id: String,
    owner_peer_id: String,
    created_at: SystemTime,
    storage_limit: u64,
    storage_used: AtomicU64,
    files: RwLock<HashMap<String, Arc<Mutex<FileRecord>>>>,
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            created_at: logging::iso_timestamp(self.created_at),
            storage_used: self.storage_used.load(Ordering::SeqCst),
            storage_limit: self.storage_limit,
        }
    }

    async fn file(&self, file_id: &str) -> Result<Arc<Mutex<FileRecord>>, StoreError> {
        self.files
            .read()
            .await
            .get(file_id)
            .cloned()
            .ok_or_else(|| StoreError::FileNotFound(file_id.to_string()))
    }

    fn reserve(&self, bytes: u64) -> Result<(), StoreError> {
        let limit = self.storage_limit;
        self.storage_used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(bytes).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|used| StoreError::QuotaExceeded {
                used,
                limit,
                requested: bytes,
            })
    }

    fn release(&self, bytes: u64) {
        let _ = self
            .storage_used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

pub struct RelaySessionStore {
    blobs: Arc<dyn BlobStore>,
    storage_limit: u64,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

fn new_session_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let mut token = [0u8; SESSION_TOKEN_BYTES];
    OsRng.fill_bytes(&mut token);
    format!("session_{}_{}", millis, hex::encode(token))
}

fn validate(file: &FileDescriptor) -> Result<(), StoreError> {
    if file.file_id.trim().is_empty() {
        return Err(StoreError::InvalidFileMetadata("fileId"));
    }
    if file.file_name.trim().is_empty() {
        return Err(StoreError::InvalidFileMetadata("fileName"));
    }
    if file.file_size == 0 {
        return Err(StoreError::InvalidFileMetadata("fileSize"));
    }
    if file.total_chunks == 0 {
        return Err(StoreError::InvalidFileMetadata("totalChunks"));
    }
    Ok(())
}

impl RelaySessionStore {
    pub fn new(blobs: Arc<dyn BlobStore>, storage_limit: u64) -> Self {
        Self {
            blobs,
            storage_limit,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Run a blob operation on the blocking pool.
    async fn blob_op<T, F>(&self, op: F) -> io::Result<T>
    where
        F: FnOnce(&dyn BlobStore) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let blobs = self.blobs.clone();
        tokio::task::spawn_blocking(move || op(blobs.as_ref()))
            .await
            .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e)))
    }

    async fn session(&self, session_id: &str) -> Result<Arc<Session>, StoreError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn start_session(&self, peer_id: &str) -> Result<SessionInfo, StoreError> {
        if peer_id.trim().is_empty() {
            return Err(StoreError::MissingPeerId);
        }
        let session = Arc::new(Session {
            id: new_session_id(),
            owner_peer_id: peer_id.to_string(),
            created_at: SystemTime::now(),
            storage_limit: self.storage_limit,
            storage_used: AtomicU64::new(0),
            files: RwLock::new(HashMap::new()),
        });
        let info = session.info();
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        Ok(info)
    }

    pub async fn session_info(&self, session_id: &str) -> Result<SessionInfo, StoreError> {
        Ok(self.session(session_id).await?.info())
    }

    /// Owner peer id of a live session.
    pub async fn session_owner(&self, session_id: &str) -> Result<String, StoreError> {
        Ok(self.session(session_id).await?.owner_peer_id.clone())
    }

    /// Remove a session and free its chunks. Returns `false` if the session
    /// did not exist.
    pub async fn end_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id);
        let Some(session) = removed else {
            return false;
        };
        for record in session.files.read().await.values() {
            record.lock().await.retired = true;
        }
        let owned = session_id.to_string();
        if let Err(error) = self
            .blob_op(move |blobs| blobs.delete_session(&owned))
            .await
        {
            rlog!(
                "relay: failed to free chunks of {}: {}",
                logging::session_id(session_id),
                error
            );
        }
        true
    }

    pub async fn register_file(
        &self,
        session_id: &str,
        file: FileDescriptor,
    ) -> Result<(), StoreError> {
        let session = self.session(session_id).await?;
        validate(&file)?;

        let mut files = session.files.write().await;
        if let Some(existing) = files.get(&file.file_id).cloned() {
            let mut record = existing.lock().await;
            if record.descriptor == file {
                return Ok(());
            }
            record.retired = true;
            session.release(record.stored_bytes());
            let (owned_session, owned_file) = (session_id.to_string(), file.file_id.clone());
            if let Err(error) = self
                .blob_op(move |blobs| blobs.delete_file(&owned_session, &owned_file))
                .await
            {
                rlog!(
                    "relay: failed to free chunks of replaced {}: {}",
                    logging::file_id(&file.file_id),
                    error
                );
            }
        }
        let file_id = file.file_id.clone();
        files.insert(file_id, Arc::new(Mutex::new(FileRecord::new(file))));
        Ok(())
    }

    pub async fn put_chunk(
        &self,
        session_id: &str,
        file_id: &str,
        index: u32,
        bytes: &[u8],
    ) -> Result<PutOutcome, StoreError> {
        let session = self.session(session_id).await?;
        let record = session.file(file_id).await?;
        if bytes.is_empty() {
            return Err(StoreError::PayloadMissing);
        }

        let mut record = record.lock().await;
        if record.retired {
            return Err(StoreError::FileNotFound(file_id.to_string()));
        }
        let total_chunks = record.descriptor.total_chunks;
        if index >= total_chunks {
            return Err(StoreError::ChunkOutOfRange {
                index,
                total_chunks,
            });
        }

        let newly_stored = !record.uploaded.contains_key(&index);
        if newly_stored {
            let len = bytes.len() as u64;
            session.reserve(len)?;
            let key = ChunkKey::new(session_id, file_id, index);
            let owned = bytes.to_vec();
            if let Err(error) = self.blob_op(move |blobs| blobs.put(&key, &owned)).await {
                session.release(len);
                return Err(error.into());
            }
            record.uploaded.insert(index, len);
        }

        Ok(PutOutcome {
            uploaded_count: record.uploaded.len() as u32,
            total_chunks,
            newly_stored,
        })
    }

    pub async fn get_chunk(
        &self,
        session_id: &str,
        file_id: &str,
        index: u32,
        peer_id: Option<&str>,
        find_across_sessions: bool,
    ) -> Result<ChunkData, StoreError> {
        let session = self.session(session_id).await?;
        let record = session.file(file_id).await?;

        let (total_chunks, present) = {
            let record = record.lock().await;
            (
                record.descriptor.total_chunks,
                record.uploaded.contains_key(&index),
            )
        };
        if index >= total_chunks {
            return Err(StoreError::ChunkOutOfRange {
                index,
                total_chunks,
            });
        }

        let mut found = None;
        if present {
            let key = ChunkKey::new(session_id, file_id, index);
            if let Some(bytes) = self.blob_op(move |blobs| blobs.get(&key)).await? {
                found = Some((bytes, session_id.to_string()));
            }
        }
        if found.is_none() && find_across_sessions {
            found = self.find_in_other_sessions(session_id, file_id, index).await?;
        }
        let Some((bytes, source_session)) = found else {
            return Err(StoreError::ChunkNotYetUploaded {
                file_id: file_id.to_string(),
                index,
            });
        };

        if let Some(peer_id) = peer_id.filter(|p| !p.is_empty()) {
            record
                .lock()
                .await
                .downloaded
                .entry(peer_id.to_string())
                .or_default()
                .insert(index);
        }

        Ok(ChunkData {
            bytes,
            total_chunks,
            source_session,
        })
    }

    async fn find_in_other_sessions(
        &self,
        session_id: &str,
        file_id: &str,
        index: u32,
    ) -> Result<Option<(Vec<u8>, String)>, StoreError> {
        let others: Vec<Arc<Session>> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.id != session_id)
            .cloned()
            .collect();

        for other in others {
            let Ok(record) = other.file(file_id).await else {
                continue;
            };
            if !record.lock().await.uploaded.contains_key(&index) {
                continue;
            }
            let key = ChunkKey::new(&other.id, file_id, index);
            if let Some(bytes) = self.blob_op(move |blobs| blobs.get(&key)).await? {
                return Ok(Some((bytes, other.id.clone())));
            }
        }
        Ok(None)
    }

    /// Delete one chunk. Returns `false` if it was not uploaded.
    pub async fn delete_chunk(
        &self,
        session_id: &str,
        file_id: &str,
        index: u32,
    ) -> Result<bool, StoreError> {
        let session = self.session(session_id).await?;
        let record = session.file(file_id).await?;
        let mut record = record.lock().await;
        let Some(len) = record.uploaded.remove(&index) else {
            return Ok(false);
        };
        session.release(len);
        let key = ChunkKey::new(session_id, file_id, index);
        if let Err(error) = self.blob_op(move |blobs| blobs.delete(&key)).await {
            rlog!(
                "relay: failed to delete chunk {} of {}: {}",
                index,
                logging::file_id(file_id),
                error
            );
        }
        Ok(true)
    }

    pub async fn file_status(
        &self,
        session_id: &str,
        file_id: &str,
    ) -> Result<FileStatus, StoreError> {
        let session = self.session(session_id).await?;
        let record = session.file(file_id).await?;
        let status = record.lock().await.status();
        Ok(status)
    }

    /// End every session. Returns how many were drained.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        let mut drained = 0;
        for id in ids {
            if self.end_session(&id).await {
                drained += 1;
            }
        }
        drained
    }
}
