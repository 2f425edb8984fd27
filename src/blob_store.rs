//! Key→bytes storage for relay chunks.
//!
//! Chunks are addressed by `(session, file, index)`. The session store owns
//! all bookkeeping; a blob store only holds bytes.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub session_id: String,
    pub file_id: String,
    pub index: u32,
}

impl ChunkKey {
    pub fn new(session_id: &str, file_id: &str, index: u32) -> Self {
        Self {
            session_id: session_id.to_string(),
            file_id: file_id.to_string(),
            index,
        }
    }
}

pub trait BlobStore: Send + Sync {
    fn put(&self, key: &ChunkKey, bytes: &[u8]) -> io::Result<()>;
    fn get(&self, key: &ChunkKey) -> io::Result<Option<Vec<u8>>>;
    /// Returns `false` if nothing was stored under `key`.
    fn delete(&self, key: &ChunkKey) -> io::Result<bool>;
    fn delete_file(&self, session_id: &str, file_id: &str) -> io::Result<()>;
    fn delete_session(&self, session_id: &str) -> io::Result<()>;
}

#[derive(Default)]
pub struct MemoryBlobStore {
    chunks: Mutex<HashMap<ChunkKey, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn chunks(&self) -> MutexGuard<'_, HashMap<ChunkKey, Vec<u8>>> {
        self.chunks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.chunks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &ChunkKey, bytes: &[u8]) -> io::Result<()> {
        self.chunks().insert(key.clone(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &ChunkKey) -> io::Result<Option<Vec<u8>>> {
        Ok(self.chunks().get(key).cloned())
    }

    fn delete(&self, key: &ChunkKey) -> io::Result<bool> {
        Ok(self.chunks().remove(key).is_some())
    }

    fn delete_file(&self, session_id: &str, file_id: &str) -> io::Result<()> {
        self.chunks()
            .retain(|key, _| !(key.session_id == session_id && key.file_id == file_id));
        Ok(())
    }

    fn delete_session(&self, session_id: &str) -> io::Result<()> {
        self.chunks().retain(|key, _| key.session_id != session_id);
        Ok(())
    }
}

/// Stores chunks as `<root>/sessions/<session>/<file>/chunk_<index>`.
///
/// Ids are hex-encoded into path components since file ids are chosen by
/// clients.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("sessions"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("sessions").join(hex::encode(session_id))
    }

    fn file_dir(&self, session_id: &str, file_id: &str) -> PathBuf {
        self.session_dir(session_id).join(hex::encode(file_id))
    }

    fn chunk_path(&self, key: &ChunkKey) -> PathBuf {
        self.file_dir(&key.session_id, &key.file_id)
            .join(format!("chunk_{}", key.index))
    }
}

fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &ChunkKey, bytes: &[u8]) -> io::Result<()> {
        let path = self.chunk_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial = path.with_extension("partial");
        fs::write(&partial, bytes)?;
        fs::rename(&partial, &path)
    }

    fn get(&self, key: &ChunkKey) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.chunk_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete(&self, key: &ChunkKey) -> io::Result<bool> {
        match fs::remove_file(self.chunk_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn delete_file(&self, session_id: &str, file_id: &str) -> io::Result<()> {
        remove_dir_if_present(&self.file_dir(session_id, file_id))
    }

    fn delete_session(&self, session_id: &str) -> io::Result<()> {
        remove_dir_if_present(&self.session_dir(session_id))
    }
}
