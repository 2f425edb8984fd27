//! Relay fallback transfers between two peers that share a direct channel.
//!
//! The sender stages the file on the relay and announces it with
//! `RELAY_FILE_INFO`. The receiver makes sure every chunk is present,
//! downloads them and confirms with `RELAY_DOWNLOAD_READY`; missing chunks
//! are negotiated over the channel in between.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelError, DirectChannel};
use crate::codec::{self, ChunkAssembler, CodecError, RELAY_CHUNK_SIZE};
use crate::protocol::{
    new_file_id, progress_percent, ChannelMessage, FileDescriptor, RelayFileInfo,
    MESSAGE_MISSING_CHUNKS,
};
use crate::queue::Outcome;
use crate::rate_limit::{Direction, DEFAULT_RATE_CAP};
use crate::recovery::{
    reupload_missing, MissingChunkRecovery, RecoveryError, ReuploadReport, SourceRegistry,
};
use crate::relay_client::{ClientError, RelayClient};
use crate::transfer::{
    SpeedSampler, TransferKey, TransferRegistry, TransferState, TransferStatus, TransitionError,
};
use crate::{logging, rlog};

#[derive(Debug)]
pub enum TransferError {
    Client(ClientError),
    Codec(CodecError),
    Recovery(RecoveryError),
    Channel(ChannelError),
    Transition(TransitionError),
    /// Some chunks could not be uploaded or downloaded.
    Incomplete { failed: Vec<u32> },
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Client(error) => write!(f, "{error}"),
            TransferError::Codec(error) => write!(f, "{error}"),
            TransferError::Recovery(error) => write!(f, "{error}"),
            TransferError::Channel(error) => write!(f, "{error}"),
            TransferError::Transition(error) => write!(f, "{error}"),
            TransferError::Incomplete { failed } => {
                write!(f, "{} chunk(s) failed: {failed:?}", failed.len())
            }
        }
    }
}

impl std::error::Error for TransferError {}

impl From<ClientError> for TransferError {
    fn from(error: ClientError) -> Self {
        TransferError::Client(error)
    }
}

impl From<CodecError> for TransferError {
    fn from(error: CodecError) -> Self {
        TransferError::Codec(error)
    }
}

impl From<RecoveryError> for TransferError {
    fn from(error: RecoveryError) -> Self {
        TransferError::Recovery(error)
    }
}

impl From<ChannelError> for TransferError {
    fn from(error: ChannelError) -> Self {
        TransferError::Channel(error)
    }
}

impl From<TransitionError> for TransferError {
    fn from(error: TransitionError) -> Self {
        TransferError::Transition(error)
    }
}

/// A file uploaded to the relay and ready to be announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub info: RelayFileInfo,
    pub digest: String,
    /// Indices whose upload failed; the receiver will ask for them.
    pub failed: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderEvent {
    Reuploaded { file_id: String, report: ReuploadReport },
    DownloadConfirmed { file_id: String, peer_id: String },
}

fn record_progress(registry: &TransferRegistry, key: &TransferKey, bytes: u64, done: u32, total: u32) {
    registry.update(key, |state| {
        state.record_progress(Instant::now(), bytes, progress_percent(done, total))
    });
}

fn finish_aborted<T>(registry: &TransferRegistry, key: &TransferKey) -> Outcome<T> {
    let _ = registry.transition(key, TransferStatus::Stopped);
    Outcome::Aborted
}

fn finish_failed(registry: &TransferRegistry, key: &TransferKey, error: &TransferError) {
    registry.update(key, |state| state.fail(error.to_string()));
}

pub struct RelaySender {
    client: Arc<RelayClient>,
    sources: Arc<SourceRegistry>,
    registry: Arc<TransferRegistry>,
}

impl RelaySender {
    pub fn new(
        client: Arc<RelayClient>,
        sources: Arc<SourceRegistry>,
        registry: Arc<TransferRegistry>,
    ) -> Self {
        Self {
            client,
            sources,
            registry,
        }
    }

    pub fn client(&self) -> &Arc<RelayClient> {
        &self.client
    }

    /// Register and upload `bytes` for `recipient`, keeping the source for
    /// later re-uploads. Chunks that fail are reported, not fatal.
    pub async fn stage(
        &self,
        recipient: &str,
        file_name: &str,
        file_type: &str,
        bytes: Arc<Vec<u8>>,
    ) -> Result<Outcome<StagedFile>, TransferError> {
        let session = self.client.ensure_session().await?;
        let total_chunks = codec::chunk_count(bytes.len(), RELAY_CHUNK_SIZE)?;
        let descriptor = FileDescriptor {
            file_id: new_file_id(),
            file_name: file_name.to_string(),
            file_size: bytes.len() as u64,
            total_chunks,
        };
        let file_id = descriptor.file_id.clone();
        self.client.register_file(&descriptor).await?;
        self.sources
            .insert(&file_id, bytes.clone(), RELAY_CHUNK_SIZE, [recipient]);

        let state = TransferState::new(
            &file_id,
            recipient,
            file_name,
            descriptor.file_size,
            Direction::Upload,
            SpeedSampler::relay(DEFAULT_RATE_CAP),
        );
        let key = state.key();
        let scope = self.registry.begin(state);
        let _ = self.registry.transition(&key, TransferStatus::Transferring);

        let chunks = codec::split(&bytes, RELAY_CHUNK_SIZE)?;
        let mut uploads: FuturesUnordered<_> = chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                let index = index as u32;
                let (client, scope, file_id) = (&self.client, &scope, file_id.as_str());
                async move { (index, chunk.len(), client.upload_chunk(file_id, index, chunk, scope).await) }
            })
            .collect();

        let (mut done, mut sent_bytes) = (0u32, 0u64);
        let mut failed = Vec::new();
        while let Some((index, len, result)) = uploads.next().await {
            match result {
                Ok(Outcome::Done(_)) => {
                    done += 1;
                    sent_bytes += len as u64;
                    record_progress(&self.registry, &key, sent_bytes, done, total_chunks);
                }
                Ok(Outcome::Aborted) => return Ok(finish_aborted(&self.registry, &key)),
                Err(error) => {
                    rlog!(
                        "relay send: chunk {} of {} failed: {}",
                        index,
                        logging::file_id(&file_id),
                        error
                    );
                    failed.push(index);
                }
            }
        }
        drop(uploads);
        failed.sort_unstable();
        let _ = self.registry.transition(&key, TransferStatus::Verifying);

        rlog!(
            "relay send: staged {} for {} ({}/{} chunks)",
            logging::file_id(&file_id),
            logging::peer_id(recipient),
            done,
            total_chunks
        );
        let digest = codec::digest_hex(&bytes);
        Ok(Outcome::Done(StagedFile {
            info: RelayFileInfo {
                file_id,
                file_name: file_name.to_string(),
                file_type: file_type.to_string(),
                file_size: descriptor.file_size,
                total_chunks,
                chunk_size: RELAY_CHUNK_SIZE as u32,
                session_id: session.session_id,
                peer_id: self.client.peer_id().to_string(),
                file_hash: Some(digest.clone()),
            },
            digest,
            failed,
        }))
    }

    pub fn announce(
        &self,
        channel: &dyn DirectChannel,
        staged: &StagedFile,
    ) -> Result<(), TransferError> {
        channel.send_message(&ChannelMessage::RelayFileInfo(staged.info.clone()))?;
        Ok(())
    }

    /// Stage `bytes` for the channel's remote peer and announce it.
    pub async fn send(
        &self,
        channel: &dyn DirectChannel,
        file_name: &str,
        file_type: &str,
        bytes: Arc<Vec<u8>>,
    ) -> Result<Outcome<StagedFile>, TransferError> {
        let staged = match self
            .stage(channel.remote_peer(), file_name, file_type, bytes)
            .await?
        {
            Outcome::Done(staged) => staged,
            Outcome::Aborted => return Ok(Outcome::Aborted),
        };
        self.announce(channel, &staged)?;
        Ok(Outcome::Done(staged))
    }

    /// React to relay bookkeeping from the receiver. Other messages are
    /// ignored.
    pub async fn handle_message(
        &self,
        message: &ChannelMessage,
    ) -> Result<Option<SenderEvent>, TransferError> {
        match message {
            ChannelMessage::RelayChunkInfo {
                file_id,
                message,
                missing_chunks,
                ..
            } if message == MESSAGE_MISSING_CHUNKS => {
                let key = TransferKey {
                    file_id: file_id.clone(),
                    direction: Direction::Upload,
                };
                let scope = self.registry.scope(&key).unwrap_or_else(CancellationToken::new);
                let outcome =
                    reupload_missing(&self.client, &self.sources, file_id, missing_chunks, &scope)
                        .await?;
                match outcome {
                    Outcome::Done(report) => Ok(Some(SenderEvent::Reuploaded {
                        file_id: file_id.clone(),
                        report,
                    })),
                    Outcome::Aborted => Ok(None),
                }
            }
            ChannelMessage::RelayDownloadReady {
                file_id, peer_id, ..
            } => {
                self.sources.mark_ready(file_id, peer_id);
                let key = TransferKey {
                    file_id: file_id.clone(),
                    direction: Direction::Upload,
                };
                self.registry.transition(&key, TransferStatus::Complete)?;
                rlog!(
                    "relay send: {} confirmed {}",
                    logging::peer_id(peer_id),
                    logging::file_id(file_id)
                );
                Ok(Some(SenderEvent::DownloadConfirmed {
                    file_id: file_id.clone(),
                    peer_id: peer_id.clone(),
                }))
            }
            _ => Ok(None),
        }
    }
}

/// A relay download, reassembled and hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub file_id: String,
    pub file_name: String,
    pub file_type: String,
    pub bytes: Vec<u8>,
    pub digest: String,
    /// Whether `digest` matches the sender's advertised hash; `None` when
    /// the sender advertised none.
    pub integrity: Option<bool>,
}

pub struct RelayReceiver {
    client: Arc<RelayClient>,
    registry: Arc<TransferRegistry>,
    recovery: MissingChunkRecovery,
}

impl RelayReceiver {
    pub fn new(client: Arc<RelayClient>, registry: Arc<TransferRegistry>) -> Self {
        Self {
            client,
            registry,
            recovery: MissingChunkRecovery::default(),
        }
    }

    pub fn with_recovery(mut self, recovery: MissingChunkRecovery) -> Self {
        self.recovery = recovery;
        self
    }

    /// Fetch the file announced by `info`, recovering missing chunks over
    /// `channel` first, then confirm with `RELAY_DOWNLOAD_READY`.
    pub async fn fetch(
        &self,
        channel: &dyn DirectChannel,
        info: &RelayFileInfo,
    ) -> Result<Outcome<FetchedFile>, TransferError> {
        let state = TransferState::new(
            &info.file_id,
            &info.peer_id,
            &info.file_name,
            info.file_size,
            Direction::Download,
            SpeedSampler::relay(DEFAULT_RATE_CAP),
        );
        let key = state.key();
        let scope = self.registry.begin(state);

        let result = self.fetch_inner(channel, info, &key, &scope).await;
        match &result {
            Ok(Outcome::Done(file)) => {
                let _ = self.registry.transition(&key, TransferStatus::Complete);
                rlog!(
                    "relay fetch: {} complete ({} bytes)",
                    logging::file_id(&file.file_id),
                    file.bytes.len()
                );
            }
            Ok(Outcome::Aborted) => {
                let _ = self.registry.transition(&key, TransferStatus::Stopped);
            }
            Err(error) => finish_failed(&self.registry, &key, error),
        }
        result
    }

    async fn fetch_inner(
        &self,
        channel: &dyn DirectChannel,
        info: &RelayFileInfo,
        key: &TransferKey,
        scope: &CancellationToken,
    ) -> Result<Outcome<FetchedFile>, TransferError> {
        let session = self.client.ensure_session().await?;
        self.client
            .register_file(&FileDescriptor {
                file_id: info.file_id.clone(),
                file_name: info.file_name.clone(),
                file_size: info.file_size,
                total_chunks: info.total_chunks,
            })
            .await?;

        let recovered = self
            .recovery
            .recover(&self.client, channel, &info.session_id, &info.file_id, scope)
            .await?;
        if recovered.is_aborted() {
            return Ok(Outcome::Aborted);
        }

        let _ = self.registry.transition(key, TransferStatus::Transferring);
        let Outcome::Done(assembler) = download_all(
            &self.client,
            &self.registry,
            key,
            &info.file_id,
            info.total_chunks,
            scope,
        )
        .await?
        else {
            return Ok(Outcome::Aborted);
        };

        let _ = self.registry.transition(key, TransferStatus::Verifying);
        let (bytes, digest) = assembler.reassemble()?;
        let integrity = codec::verify_digest(info.file_hash.as_deref(), &digest);
        if integrity == Some(false) {
            rlog!(
                "relay fetch: {} failed its integrity check, delivering anyway",
                logging::file_id(&info.file_id)
            );
        }
        channel.send_message(&ChannelMessage::RelayDownloadReady {
            file_id: info.file_id.clone(),
            peer_id: self.client.peer_id().to_string(),
            session_id: Some(session.session_id),
        })?;
        Ok(Outcome::Done(FetchedFile {
            file_id: info.file_id.clone(),
            file_name: info.file_name.clone(),
            file_type: info.file_type.clone(),
            bytes,
            digest,
            integrity,
        }))
    }
}

/// Download every chunk of a file registered in `client`'s session.
pub async fn download_all(
    client: &RelayClient,
    registry: &TransferRegistry,
    key: &TransferKey,
    file_id: &str,
    total_chunks: u32,
    scope: &CancellationToken,
) -> Result<Outcome<ChunkAssembler>, TransferError> {
    let mut assembler = ChunkAssembler::new(total_chunks);
    let mut downloads: FuturesUnordered<_> = (0..total_chunks)
        .map(|index| async move { (index, client.download_chunk(file_id, index, scope).await) })
        .collect();

    let mut failed = Vec::new();
    while let Some((index, result)) = downloads.next().await {
        match result {
            Ok(Outcome::Done(chunk)) => {
                assembler.insert(index, chunk.bytes)?;
                record_progress(
                    registry,
                    key,
                    assembler.received_bytes(),
                    assembler.received(),
                    total_chunks,
                );
            }
            Ok(Outcome::Aborted) => return Ok(Outcome::Aborted),
            Err(error) => {
                rlog!(
                    "relay fetch: chunk {} of {} failed: {}",
                    index,
                    logging::file_id(file_id),
                    error
                );
                failed.push(index);
            }
        }
    }
    if !failed.is_empty() {
        failed.sort_unstable();
        return Err(TransferError::Incomplete { failed });
    }
    Ok(Outcome::Done(assembler))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Only the lost peer's transfers were stopped.
    Scoped { stopped: usize },
    /// Nobody else had work left: queues aborted and the session ended.
    Full { stopped: usize },
}

/// Relay cleanup after `peer_id` became unreachable.
pub async fn teardown_peer(
    client: &RelayClient,
    registry: &TransferRegistry,
    sources: &SourceRegistry,
    peer_id: &str,
) -> Teardown {
    let stopped = registry.stop_peer_relays(peer_id).len();
    let others: Vec<String> = registry
        .outstanding_peers()
        .into_iter()
        .filter(|other| other != peer_id)
        .collect();
    if !others.is_empty() {
        rlog!(
            "relay teardown: {} lost, keeping session for {} other peer(s)",
            logging::peer_id(peer_id),
            others.len()
        );
        return Teardown::Scoped { stopped };
    }
    client.abort_all();
    client.end_session().await;
    sources.clear();
    rlog!(
        "relay teardown: {} lost, session closed",
        logging::peer_id(peer_id)
    );
    Teardown::Full { stopped }
}
