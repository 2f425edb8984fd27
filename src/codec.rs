//! Chunking, out-of-order reassembly and streaming SHA-256 digests.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

/// Chunk size used on the direct peer channel.
pub const DIRECT_CHUNK_SIZE: usize = 16 * 1024;

/// Chunk size used for relay HTTP uploads.
pub const RELAY_CHUNK_SIZE: usize = 1024 * 1024;

/// Number of chunks concatenated per merge step during reassembly.
pub const MERGE_GROUP_SIZE: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    EmptyChunkSize,
    ChunkOutOfRange { index: u32, total_chunks: u32 },
    IncompleteFile { missing_index: u32 },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::EmptyChunkSize => write!(f, "chunk size must be positive"),
            CodecError::ChunkOutOfRange {
                index,
                total_chunks,
            } => write!(f, "chunk index {index} outside 0..{total_chunks}"),
            CodecError::IncompleteFile { missing_index } => {
                write!(f, "incomplete file: chunk {missing_index} missing")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// `ceil(len / chunk_size)`; an empty blob has no chunks.
pub fn chunk_count(len: usize, chunk_size: usize) -> Result<u32, CodecError> {
    if chunk_size == 0 {
        return Err(CodecError::EmptyChunkSize);
    }
    Ok(len.div_ceil(chunk_size) as u32)
}

/// Split `blob` into ordered chunks of `chunk_size` (the last may be shorter).
pub fn split(blob: &[u8], chunk_size: usize) -> Result<Vec<&[u8]>, CodecError> {
    if chunk_size == 0 {
        return Err(CodecError::EmptyChunkSize);
    }
    Ok(blob.chunks(chunk_size).collect())
}

/// Byte range of chunk `index` inside a blob of `len` bytes.
pub fn chunk_range(
    len: usize,
    chunk_size: usize,
    index: u32,
) -> Result<std::ops::Range<usize>, CodecError> {
    let total_chunks = chunk_count(len, chunk_size)?;
    if index >= total_chunks {
        return Err(CodecError::ChunkOutOfRange {
            index,
            total_chunks,
        });
    }
    let start = index as usize * chunk_size;
    Ok(start..(start + chunk_size).min(len))
}

/// Incremental SHA-256 over a sequence of byte slices.
#[derive(Clone, Default)]
pub struct StreamingDigest {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.bytes += bytes.len() as u64;
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// SHA-256 of a whole blob as lowercase hex.
pub fn digest_hex(blob: &[u8]) -> String {
    hex::encode(Sha256::digest(blob))
}

/// Compare an advertised digest with a computed one. `None` when nothing
/// was advertised.
pub fn verify_digest(expected: Option<&str>, actual: &str) -> Option<bool> {
    expected
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|e| e.eq_ignore_ascii_case(actual))
}

/// Collects chunks in any order and reassembles them once all are present.
#[derive(Debug, Clone)]
pub struct ChunkAssembler {
    total_chunks: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    received_bytes: u64,
}

impl ChunkAssembler {
    pub fn new(total_chunks: u32) -> Self {
        Self {
            total_chunks,
            chunks: BTreeMap::new(),
            received_bytes: 0,
        }
    }

    /// Store a chunk. Returns `false` if that index was already present.
    pub fn insert(&mut self, index: u32, bytes: Vec<u8>) -> Result<bool, CodecError> {
        if index >= self.total_chunks {
            return Err(CodecError::ChunkOutOfRange {
                index,
                total_chunks: self.total_chunks,
            });
        }
        if self.chunks.contains_key(&index) {
            return Ok(false);
        }
        self.received_bytes += bytes.len() as u64;
        self.chunks.insert(index, bytes);
        Ok(true)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.chunks.contains_key(&index)
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.total_chunks
    }

    pub fn missing(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }

    /// Percentage of chunks received, rounded down.
    pub fn progress(&self) -> u8 {
        if self.total_chunks == 0 {
            return 100;
        }
        (u64::from(self.received()) * 100 / u64::from(self.total_chunks)) as u8
    }

    /// Concatenate all chunks in index order, hashing as groups are merged.
    ///
    /// Returns the blob and its lowercase hex SHA-256.
    pub fn reassemble(self) -> Result<(Vec<u8>, String), CodecError> {
        if let Some(missing_index) = (0..self.total_chunks).find(|i| !self.chunks.contains_key(i))
        {
            return Err(CodecError::IncompleteFile { missing_index });
        }

        let mut digest = StreamingDigest::new();
        let mut blob = Vec::with_capacity(self.received_bytes as usize);
        let mut chunks = self.chunks.into_values();
        loop {
            let mut group = Vec::new();
            for chunk in chunks.by_ref().take(MERGE_GROUP_SIZE) {
                group.extend_from_slice(&chunk);
            }
            if group.is_empty() {
                break;
            }
            digest.update(&group);
            blob.extend_from_slice(&group);
        }
        Ok((blob, digest.finalize_hex()))
    }
}
