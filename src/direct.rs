//! File transfer over an open direct channel.
//!
//! The sender streams a META frame, the chunks in small batches and a final
//! `FILE_HASH`. The receiver is a plain state machine: feed it decoded
//! messages and it reports what happened as [`DirectEvent`]s.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelError, DirectChannel};
use crate::codec::{self, ChunkAssembler, CodecError, StreamingDigest, DIRECT_CHUNK_SIZE};
use crate::protocol::{
    progress_percent, ChannelMessage, FileFrame, ProtocolError, MESSAGE_HASH_MATCH,
    MESSAGE_HASH_MISMATCH, MESSAGE_HASH_VALUE, MESSAGE_META, META_CHUNK_INDEX,
};
use crate::queue::Outcome;
use crate::rate_limit::Direction;
use crate::transfer::{
    SpeedSampler, TransferKey, TransferRegistry, TransferState, TransferStatus,
};
use crate::{logging, rlog};

/// Chunks sent back to back before yielding.
pub const MAX_CONCURRENT_CHUNKS: usize = 16;
pub const CHUNK_DELAY: Duration = Duration::from_millis(5);
/// Minimum spacing of receiver progress events.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub enum DirectError {
    ConnectionLost,
    Send(String),
    Codec(CodecError),
    Protocol(ProtocolError),
}

impl fmt::Display for DirectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectError::ConnectionLost => write!(f, "connection lost"),
            DirectError::Send(detail) => write!(f, "send failed: {detail}"),
            DirectError::Codec(error) => write!(f, "{error}"),
            DirectError::Protocol(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for DirectError {}

impl From<ChannelError> for DirectError {
    fn from(error: ChannelError) -> Self {
        match error {
            ChannelError::Closed => DirectError::ConnectionLost,
            ChannelError::Send(detail) => DirectError::Send(detail),
        }
    }
}

impl From<CodecError> for DirectError {
    fn from(error: CodecError) -> Self {
        DirectError::Codec(error)
    }
}

impl From<ProtocolError> for DirectError {
    fn from(error: ProtocolError) -> Self {
        DirectError::Protocol(error)
    }
}

/// A file to push over a direct channel.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingFile<'a> {
    pub file_id: &'a str,
    pub file_name: &'a str,
    pub file_type: &'a str,
    pub bytes: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub total_chunks: u32,
    pub digest: String,
}

/// Send `file` over `channel`. `on_progress(sent, total)` runs after each
/// batch.
pub async fn send_file(
    channel: &dyn DirectChannel,
    file: OutgoingFile<'_>,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(u32, u32),
) -> Result<Outcome<SendReport>, DirectError> {
    let chunks = codec::split(file.bytes, DIRECT_CHUNK_SIZE)?;
    let total_chunks = chunks.len() as u32;
    let frame = |chunk_index: i64| FileFrame {
        file_id: file.file_id.to_string(),
        file_name: file.file_name.to_string(),
        file_type: file.file_type.to_string(),
        file_size: file.bytes.len() as u64,
        chunk_index,
        total_chunks,
        chunk_size: DIRECT_CHUNK_SIZE as u32,
        message: None,
        data: None,
    };

    let mut meta = frame(META_CHUNK_INDEX);
    meta.message = Some(MESSAGE_META.to_string());
    channel.send_message(&ChannelMessage::File(meta))?;

    let mut digest = StreamingDigest::new();
    let mut sent = 0u32;
    let batches: Vec<&[&[u8]]> = chunks.chunks(MAX_CONCURRENT_CHUNKS).collect();
    for (n, batch) in batches.iter().enumerate() {
        if cancel.is_cancelled() {
            return Ok(Outcome::Aborted);
        }
        for chunk in batch.iter() {
            let mut data = frame(i64::from(sent));
            data.set_data(chunk);
            digest.update(chunk);
            channel.send_message(&ChannelMessage::File(data))?;
            sent += 1;
        }
        on_progress(sent, total_chunks);
        if n + 1 < batches.len() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Outcome::Aborted),
                _ = tokio::time::sleep(CHUNK_DELAY) => {}
            }
        }
    }

    let digest = digest.finalize_hex();
    channel.send_message(&ChannelMessage::FileHash {
        file_id: file.file_id.to_string(),
        file_hash: digest.clone(),
        message: Some(MESSAGE_HASH_VALUE.to_string()),
    })?;
    rlog!(
        "direct: sent {} ({} chunks) to {}",
        logging::file_id(file.file_id),
        total_chunks,
        logging::peer_id(channel.remote_peer())
    );
    Ok(Outcome::Done(SendReport {
        total_chunks,
        digest,
    }))
}

/// [`send_file`] registered as a direct upload in `registry`, so the
/// remote peer counts as busy for the liveness monitor. `registry.stop` on
/// the upload's key cancels the send.
pub async fn send_tracked(
    channel: &dyn DirectChannel,
    file: OutgoingFile<'_>,
    registry: &TransferRegistry,
) -> Result<Outcome<SendReport>, DirectError> {
    let file_size = file.bytes.len() as u64;
    let state = TransferState::new(
        file.file_id,
        channel.remote_peer(),
        file.file_name,
        file_size,
        Direction::Upload,
        SpeedSampler::direct(),
    );
    let key = state.key();
    let scope = registry.begin(state);
    let _ = registry.transition(&key, TransferStatus::Transferring);

    let result = send_file(channel, file, &scope, |sent, total| {
        let bytes = (u64::from(sent) * DIRECT_CHUNK_SIZE as u64).min(file_size);
        registry.update(&key, |state| {
            state.record_progress(Instant::now(), bytes, progress_percent(sent, total))
        });
    })
    .await;
    match &result {
        Ok(Outcome::Done(_)) => {
            let _ = registry.transition(&key, TransferStatus::Complete);
        }
        Ok(Outcome::Aborted) => {
            let _ = registry.transition(&key, TransferStatus::Stopped);
        }
        Err(error) => {
            registry.update(&key, |state| state.fail(error.to_string()));
        }
    }
    result
}

/// Mirror receive-side events from `peer_id` into `registry` as direct
/// downloads.
pub fn track_events(registry: &TransferRegistry, peer_id: &str, events: &[DirectEvent]) {
    for event in events {
        match event {
            DirectEvent::Started {
                file_id,
                file_name,
                file_size,
                ..
            } => {
                let state = TransferState::new(
                    file_id,
                    peer_id,
                    file_name,
                    *file_size,
                    Direction::Download,
                    SpeedSampler::direct(),
                );
                let key = state.key();
                registry.begin(state);
                let _ = registry.transition(&key, TransferStatus::Transferring);
            }
            DirectEvent::Progress {
                file_id, progress, ..
            } => {
                registry.update(&download_key(file_id), |state| {
                    let bytes = state.file_size * u64::from(*progress) / 100;
                    state.record_progress(Instant::now(), bytes, *progress)
                });
            }
            DirectEvent::Preparing { file_id } => {
                let _ = registry.transition(&download_key(file_id), TransferStatus::Verifying);
            }
            DirectEvent::Completed { file_id, .. } => {
                let _ = registry.transition(&download_key(file_id), TransferStatus::Complete);
            }
            _ => {}
        }
    }
}

fn download_key(file_id: &str) -> TransferKey {
    TransferKey {
        file_id: file_id.to_string(),
        direction: Direction::Download,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectEvent {
    Started {
        file_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    },
    Progress {
        file_id: String,
        received: u32,
        total_chunks: u32,
        progress: u8,
    },
    /// Every chunk is in; reassembly follows.
    Preparing { file_id: String },
    Completed {
        file_id: String,
        file_name: String,
        file_type: String,
        bytes: Vec<u8>,
        digest: String,
    },
    /// Local and remote digests are both known. `reply` goes back to the
    /// sender.
    Integrity {
        file_id: String,
        matches: bool,
        reply: ChannelMessage,
    },
    /// The receiver's verdict on a file this side sent.
    Verdict { file_id: String, matches: bool },
    /// Anything that is not part of a direct file transfer.
    Other(ChannelMessage),
}

struct Incoming {
    frame: FileFrame,
    assembler: ChunkAssembler,
    last_progress: Option<Instant>,
}

/// Receive side of direct transfers, keyed by file id.
#[derive(Default)]
pub struct DirectReceiver {
    incoming: HashMap<String, Incoming>,
    /// Delivered files; only a new META frame reopens one.
    completed: HashSet<String>,
    local_digests: HashMap<String, String>,
    remote_digests: HashMap<String, String>,
}

impl DirectReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files still being received.
    pub fn in_flight(&self) -> usize {
        self.incoming.len()
    }

    /// Drop every partial file from `peer`'s channel, e.g. after the
    /// connection is lost.
    pub fn reset(&mut self) -> usize {
        let dropped = self.incoming.len();
        self.incoming.clear();
        self.remote_digests.clear();
        dropped
    }

    /// Decode a raw frame, handle it and send any integrity replies on
    /// `channel`.
    pub fn pump(
        &mut self,
        channel: &dyn DirectChannel,
        frame: &[u8],
    ) -> Result<Vec<DirectEvent>, DirectError> {
        let message = ChannelMessage::decode(frame)?;
        let events = self.handle(Instant::now(), message)?;
        for event in &events {
            if let DirectEvent::Integrity { reply, .. } = event {
                channel.send_message(reply)?;
            }
        }
        Ok(events)
    }

    pub fn handle(
        &mut self,
        now: Instant,
        message: ChannelMessage,
    ) -> Result<Vec<DirectEvent>, DirectError> {
        match message {
            ChannelMessage::File(frame) => self.on_file_frame(now, frame),
            ChannelMessage::FileHash {
                file_id,
                file_hash,
                message,
            } => Ok(self.on_hash(file_id, file_hash, message)),
            other => Ok(vec![DirectEvent::Other(other)]),
        }
    }

    fn on_file_frame(
        &mut self,
        now: Instant,
        frame: FileFrame,
    ) -> Result<Vec<DirectEvent>, DirectError> {
        let mut events = Vec::new();
        let file_id = frame.file_id.clone();

        if self.completed.contains(&file_id) {
            if !frame.is_meta() {
                rlog!(
                    "direct: ignoring chunk {} of already delivered {}",
                    frame.chunk_index,
                    logging::file_id(&file_id)
                );
                return Ok(events);
            }
            self.completed.remove(&file_id);
        }

        if !self.incoming.contains_key(&file_id) {
            self.local_digests.remove(&file_id);
            events.push(DirectEvent::Started {
                file_id: file_id.clone(),
                file_name: frame.file_name.clone(),
                file_size: frame.file_size,
                total_chunks: frame.total_chunks,
            });
            let mut header = frame.clone();
            header.data = None;
            self.incoming.insert(
                file_id.clone(),
                Incoming {
                    frame: header,
                    assembler: ChunkAssembler::new(frame.total_chunks),
                    last_progress: None,
                },
            );
        }

        if !frame.is_meta() {
            let index = u32::try_from(frame.chunk_index).map_err(|_| {
                DirectError::Codec(CodecError::ChunkOutOfRange {
                    index: u32::MAX,
                    total_chunks: frame.total_chunks,
                })
            })?;
            let bytes = frame.decode_data()?;
            let Some(incoming) = self.incoming.get_mut(&file_id) else {
                return Ok(events);
            };
            if incoming.assembler.insert(index, bytes)? {
                let done = incoming.assembler.is_complete();
                let due = incoming
                    .last_progress
                    .map_or(true, |at| now.saturating_duration_since(at) >= PROGRESS_INTERVAL);
                if due || done {
                    incoming.last_progress = Some(now);
                    events.push(DirectEvent::Progress {
                        file_id: file_id.clone(),
                        received: incoming.assembler.received(),
                        total_chunks: incoming.assembler.total_chunks(),
                        progress: incoming.assembler.progress(),
                    });
                }
            }
        }

        let complete = self
            .incoming
            .get(&file_id)
            .is_some_and(|incoming| incoming.assembler.is_complete());
        if complete {
            self.finish(&file_id, &mut events)?;
        }
        Ok(events)
    }

    fn finish(&mut self, file_id: &str, events: &mut Vec<DirectEvent>) -> Result<(), DirectError> {
        let Some(incoming) = self.incoming.remove(file_id) else {
            return Ok(());
        };
        events.push(DirectEvent::Preparing {
            file_id: file_id.to_string(),
        });
        let (bytes, digest) = incoming.assembler.reassemble()?;
        self.completed.insert(file_id.to_string());
        self.local_digests
            .insert(file_id.to_string(), digest.clone());
        events.push(DirectEvent::Completed {
            file_id: file_id.to_string(),
            file_name: incoming.frame.file_name,
            file_type: incoming.frame.file_type,
            bytes,
            digest,
        });
        if let Some(remote) = self.remote_digests.remove(file_id) {
            events.push(self.verdict(file_id, &remote));
        }
        Ok(())
    }

    fn on_hash(&mut self, file_id: String, file_hash: String, message: Option<String>) -> Vec<DirectEvent> {
        match message.as_deref() {
            Some(MESSAGE_HASH_MATCH) => {
                return vec![DirectEvent::Verdict {
                    file_id,
                    matches: true,
                }]
            }
            Some(MESSAGE_HASH_MISMATCH) => {
                return vec![DirectEvent::Verdict {
                    file_id,
                    matches: false,
                }]
            }
            _ => {}
        }
        if self.local_digests.contains_key(&file_id) {
            return vec![self.verdict(&file_id, &file_hash)];
        }
        self.remote_digests.insert(file_id, file_hash);
        Vec::new()
    }

    fn verdict(&mut self, file_id: &str, remote: &str) -> DirectEvent {
        let local = self.local_digests.remove(file_id).unwrap_or_default();
        let matches = local == remote;
        if !matches {
            rlog!(
                "direct: integrity mismatch for {} (local {}, remote {})",
                logging::file_id(file_id),
                local,
                remote
            );
        }
        let message = if matches {
            MESSAGE_HASH_MATCH
        } else {
            MESSAGE_HASH_MISMATCH
        };
        DirectEvent::Integrity {
            file_id: file_id.to_string(),
            matches,
            reply: ChannelMessage::FileHash {
                file_id: file_id.to_string(),
                file_hash: local,
                message: Some(message.to_string()),
            },
        }
    }
}
