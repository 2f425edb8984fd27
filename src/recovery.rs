//! Detection and re-upload of chunks that never reached the relay.
//!
//! The receiver polls the sender's session, names the gaps over the direct
//! channel and waits for the sender to fill them from its retained source
//! bytes.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelError, DirectChannel};
use crate::codec::{self, CodecError};
use crate::protocol::{ChannelMessage, FileStatus};
use crate::queue::Outcome;
use crate::relay_client::{ClientError, RelayClient};
use crate::{logging, rlog};

pub const RECOVERY_ATTEMPTS: u32 = 3;
pub const RECOVERY_DELAY: Duration = Duration::from_secs(3);

/// Indices in `0..total` absent from `uploaded`.
pub fn missing_chunks(total: u32, uploaded: &[u32]) -> Vec<u32> {
    let present: BTreeSet<u32> = uploaded.iter().copied().collect();
    (0..total).filter(|i| !present.contains(i)).collect()
}

fn status_missing(status: &FileStatus) -> Vec<u32> {
    missing_chunks(status.total_chunks, &status.uploaded_chunks)
}

#[derive(Debug)]
pub enum RecoveryError {
    RecoveryFailed { missing: Vec<u32> },
    Client(ClientError),
    PeerUnreachable(ChannelError),
    SourceUnavailable(String),
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryError::RecoveryFailed { missing } => {
                write!(f, "chunks still missing after recovery: {missing:?}")
            }
            RecoveryError::Client(error) => write!(f, "{error}"),
            RecoveryError::PeerUnreachable(error) => write!(f, "peer unreachable: {error}"),
            RecoveryError::SourceUnavailable(file_id) => {
                write!(f, "source bytes for {file_id} are no longer held")
            }
        }
    }
}

impl std::error::Error for RecoveryError {}

impl From<ClientError> for RecoveryError {
    fn from(error: ClientError) -> Self {
        RecoveryError::Client(error)
    }
}

impl From<ChannelError> for RecoveryError {
    fn from(error: ChannelError) -> Self {
        RecoveryError::PeerUnreachable(error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    AlreadyComplete,
    /// The sender filled the gaps that were first reported.
    Recovered { requested: Vec<u32> },
}

#[derive(Debug, Clone, Copy)]
pub struct MissingChunkRecovery {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for MissingChunkRecovery {
    fn default() -> Self {
        Self {
            max_attempts: RECOVERY_ATTEMPTS,
            retry_delay: RECOVERY_DELAY,
        }
    }
}

impl MissingChunkRecovery {
    /// Make sure every chunk of `file_id` is present in `sender_session`,
    /// asking the sender over `channel` to re-upload whatever is not.
    pub async fn recover(
        &self,
        client: &RelayClient,
        channel: &dyn DirectChannel,
        sender_session: &str,
        file_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Outcome<Recovery>, RecoveryError> {
        let status = client.file_status_in(sender_session, file_id).await?;
        if status.completed {
            return Ok(Outcome::Done(Recovery::AlreadyComplete));
        }
        let requested = status_missing(&status);
        rlog!(
            "recovery: {} missing {} chunk(s), asking {}",
            logging::file_id(file_id),
            requested.len(),
            logging::peer_id(channel.remote_peer())
        );
        channel.send_message(&ChannelMessage::missing_chunks(
            file_id,
            sender_session,
            requested.clone(),
        ))?;

        let mut missing = requested.clone();
        for attempt in 1..=self.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Outcome::Aborted),
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
            let status = client.file_status_in(sender_session, file_id).await?;
            if status.completed {
                rlog!(
                    "recovery: {} complete after {} poll(s)",
                    logging::file_id(file_id),
                    attempt
                );
                return Ok(Outcome::Done(Recovery::Recovered { requested }));
            }
            missing = status_missing(&status);
        }
        Err(RecoveryError::RecoveryFailed { missing })
    }
}

struct Source {
    bytes: Arc<Vec<u8>>,
    chunk_size: usize,
    waiting_on: BTreeSet<String>,
}

/// Source bytes the sender keeps so missing chunks can be re-uploaded.
///
/// An entry lives until every recipient reports the download ready, or
/// until [`SourceRegistry::clear`] when the session ends.
#[derive(Default)]
pub struct SourceRegistry {
    sources: Mutex<HashMap<String, Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sources(&self) -> MutexGuard<'_, HashMap<String, Source>> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert<I, S>(&self, file_id: &str, bytes: Arc<Vec<u8>>, chunk_size: usize, recipients: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let source = Source {
            bytes,
            chunk_size,
            waiting_on: recipients.into_iter().map(Into::into).collect(),
        };
        self.sources().insert(file_id.to_string(), source);
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.sources().contains_key(file_id)
    }

    pub fn len(&self) -> usize {
        self.sources().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of chunk `index` of `file_id`.
    pub fn chunk(&self, file_id: &str, index: u32) -> Result<Vec<u8>, RecoveryError> {
        let sources = self.sources();
        let source = sources
            .get(file_id)
            .ok_or_else(|| RecoveryError::SourceUnavailable(file_id.to_string()))?;
        let range = codec::chunk_range(source.bytes.len(), source.chunk_size, index).map_err(
            |error: CodecError| {
                RecoveryError::SourceUnavailable(format!("{file_id}: {error}"))
            },
        )?;
        Ok(source.bytes[range].to_vec())
    }

    /// Record that `peer_id` has the whole file. Returns `true` once the
    /// entry was released because nobody else is waiting.
    pub fn mark_ready(&self, file_id: &str, peer_id: &str) -> bool {
        let mut sources = self.sources();
        let Some(source) = sources.get_mut(file_id) else {
            return false;
        };
        source.waiting_on.remove(peer_id);
        if source.waiting_on.is_empty() {
            sources.remove(file_id);
            return true;
        }
        false
    }

    pub fn clear(&self) -> usize {
        let mut sources = self.sources();
        let dropped = sources.len();
        sources.clear();
        dropped
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReuploadReport {
    pub uploaded: Vec<u32>,
    pub failed: Vec<u32>,
}

/// Upload exactly `missing` of `file_id` from `sources`.
pub async fn reupload_missing(
    client: &RelayClient,
    sources: &SourceRegistry,
    file_id: &str,
    missing: &[u32],
    scope: &CancellationToken,
) -> Result<Outcome<ReuploadReport>, RecoveryError> {
    if !sources.contains(file_id) {
        return Err(RecoveryError::SourceUnavailable(file_id.to_string()));
    }

    let uploads = missing.iter().map(|&index| async move {
        let bytes = match sources.chunk(file_id, index) {
            Ok(bytes) => bytes,
            Err(error) => return (index, Err(error)),
        };
        let result = client
            .upload_chunk(file_id, index, &bytes, scope)
            .await
            .map_err(RecoveryError::from);
        (index, result)
    });

    let mut report = ReuploadReport::default();
    let mut aborted = false;
    for (index, result) in join_all(uploads).await {
        match result {
            Ok(Outcome::Done(_)) => report.uploaded.push(index),
            Ok(Outcome::Aborted) => aborted = true,
            Err(error) => {
                rlog!(
                    "recovery: re-upload of chunk {} of {} failed: {}",
                    index,
                    logging::file_id(file_id),
                    error
                );
                report.failed.push(index);
            }
        }
    }
    if aborted {
        return Ok(Outcome::Aborted);
    }
    rlog!(
        "recovery: re-uploaded {} chunk(s) of {} ({} failed)",
        report.uploaded.len(),
        logging::file_id(file_id),
        report.failed.len()
    );
    Ok(Outcome::Done(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_is_the_complement() {
        assert_eq!(missing_chunks(4, &[0, 1, 3]), vec![2]);
        assert_eq!(missing_chunks(3, &[2, 0, 1, 1]), Vec::<u32>::new());
        assert_eq!(missing_chunks(3, &[]), vec![0, 1, 2]);
    }

    #[test]
    fn sources_live_until_every_recipient_is_ready() {
        let registry = SourceRegistry::new();
        registry.insert("f", Arc::new(b"abcdefghij".to_vec()), 4, ["bob", "carol"]);
        assert_eq!(registry.chunk("f", 2).unwrap(), b"ij".to_vec());
        assert!(registry.chunk("f", 3).is_err());

        assert!(!registry.mark_ready("f", "bob"));
        assert!(registry.contains("f"));
        assert!(registry.mark_ready("f", "carol"));
        assert!(registry.is_empty());
        assert!(matches!(
            registry.chunk("f", 0),
            Err(RecoveryError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn clear_drops_everything() {
        let registry = SourceRegistry::new();
        registry.insert("a", Arc::new(vec![1]), 1, ["bob"]);
        registry.insert("b", Arc::new(vec![2]), 1, ["bob"]);
        assert_eq!(registry.clear(), 2);
        assert!(!registry.mark_ready("a", "bob"));
    }
}
