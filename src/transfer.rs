//! Client-side transfer bookkeeping: status machine, smoothed speed and the
//! registry that liveness teardown and the relay flows share.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::rate_limit::Direction;
use crate::{logging, rlog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Direct,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Verifying,
    Complete,
    Stopped,
    Error,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Complete | TransferStatus::Stopped | TransferStatus::Error
        )
    }

    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (Pending, Transferring) | (Transferring, Verifying) => true,
            (Transferring | Verifying, Complete) => true,
            (_, Stopped) | (_, Error) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: TransferStatus,
    pub to: TransferStatus,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal transfer transition {:?} -> {:?}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

const SPEED_HISTORY: usize = 5;
const SPEED_WEIGHTS: [f64; SPEED_HISTORY] = [0.1, 0.15, 0.2, 0.25, 0.3];
/// Spike smoothing only applies once the average exceeds this.
const SMOOTHING_FLOOR: f64 = 100.0 * 1024.0;

/// Weighted moving average of recent throughput samples.
///
/// Relay samples are clamped to the relay's rate cap since response
/// buffering makes instantaneous readings overshoot. Direct samples are
/// damped against sudden jumps relative to the running average.
#[derive(Debug, Clone)]
pub struct SpeedSampler {
    last: Option<(Instant, u64)>,
    history: VecDeque<f64>,
    relay_cap: Option<u64>,
}

impl SpeedSampler {
    pub fn direct() -> Self {
        Self {
            last: None,
            history: VecDeque::with_capacity(SPEED_HISTORY),
            relay_cap: None,
        }
    }

    pub fn relay(cap: u64) -> Self {
        Self {
            relay_cap: Some(cap),
            ..Self::direct()
        }
    }

    fn average(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().sum::<f64>() / self.history.len() as f64
    }

    /// Record the cumulative byte count at `now`; returns bytes per second.
    pub fn record(&mut self, now: Instant, total_bytes: u64) -> u64 {
        let Some((last_at, last_bytes)) = self.last else {
            self.last = Some((now, total_bytes));
            return 0;
        };
        let elapsed = now.saturating_duration_since(last_at).as_secs_f64();
        if elapsed <= 0.0 || total_bytes <= last_bytes {
            return self.average() as u64;
        }
        self.last = Some((now, total_bytes));

        let mut sample = (total_bytes - last_bytes) as f64 / elapsed;
        match self.relay_cap {
            Some(cap) if cap > 0 => {
                if sample > cap as f64 * 1.5 {
                    sample = cap as f64;
                }
            }
            _ => {
                let avg = self.average();
                if avg > SMOOTHING_FLOOR {
                    if sample > avg * 3.0 {
                        sample = avg * 1.5;
                    } else if sample < avg * 0.3 {
                        sample = avg * 0.7;
                    }
                }
            }
        }

        self.history.push_back(sample);
        if self.history.len() > SPEED_HISTORY {
            self.history.pop_front();
        }
        let offset = SPEED_WEIGHTS.len() - self.history.len();
        let (sum, weight) = self
            .history
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(sum, weight), (i, s)| {
                let w = SPEED_WEIGHTS[offset + i];
                (sum + s * w, weight + w)
            });
        (sum / weight) as u64
    }
}

/// Estimated time left at `speed` bytes/s for a file `progress`% done.
pub fn eta(speed: u64, total_size: u64, progress: u8) -> Option<Duration> {
    if speed == 0 || progress >= 100 {
        return None;
    }
    let remaining = total_size.saturating_sub(total_size * u64::from(progress) / 100);
    Some(Duration::from_secs_f64(remaining as f64 / speed as f64))
}

#[derive(Debug, Clone)]
pub struct TransferState {
    pub file_id: String,
    pub peer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub direction: Direction,
    pub transport: Transport,
    progress: u8,
    status: TransferStatus,
    bytes_done: u64,
    speed: u64,
    sampler: SpeedSampler,
    error: Option<String>,
}

impl TransferState {
    pub fn new(
        file_id: &str,
        peer_id: &str,
        file_name: &str,
        file_size: u64,
        direction: Direction,
        sampler: SpeedSampler,
    ) -> Self {
        let transport = if sampler.relay_cap.is_some() {
            Transport::Relay
        } else {
            Transport::Direct
        };
        Self {
            file_id: file_id.to_string(),
            peer_id: peer_id.to_string(),
            file_name: file_name.to_string(),
            file_size,
            direction,
            transport,
            progress: 0,
            status: TransferStatus::Pending,
            bytes_done: 0,
            speed: 0,
            sampler,
            error: None,
        }
    }

    pub fn key(&self) -> TransferKey {
        TransferKey {
            file_id: self.file_id.clone(),
            direction: self.direction,
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn speed(&self) -> u64 {
        self.speed
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn eta(&self) -> Option<Duration> {
        eta(self.speed, self.file_size, self.progress)
    }

    pub fn transition(&mut self, next: TransferStatus) -> Result<(), TransitionError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next == TransferStatus::Complete {
            self.progress = 100;
        }
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(TransferStatus::Error)?;
        self.error = Some(reason.into());
        Ok(())
    }

    /// Record cumulative progress. Moves a pending transfer to
    /// `Transferring`; ignored once terminal.
    pub fn record_progress(&mut self, now: Instant, bytes_done: u64, progress: u8) {
        if self.status.is_terminal() {
            return;
        }
        if self.status == TransferStatus::Pending {
            self.status = TransferStatus::Transferring;
        }
        self.bytes_done = bytes_done.max(self.bytes_done);
        self.progress = progress.min(100).max(self.progress);
        self.speed = self.sampler.record(now, self.bytes_done);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub file_id: String,
    pub direction: Direction,
}

struct Entry {
    state: TransferState,
    scope: CancellationToken,
}

/// All transfers of one client, each with its own cancellation scope.
#[derive(Default)]
pub struct TransferRegistry {
    entries: Mutex<HashMap<TransferKey, Entry>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TransferKey, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a new transfer and return its cancellation scope. A previous
    /// transfer under the same key is stopped.
    pub fn begin(&self, state: TransferState) -> CancellationToken {
        let scope = CancellationToken::new();
        let previous = self.entries().insert(
            state.key(),
            Entry {
                state,
                scope: scope.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.scope.cancel();
        }
        scope
    }

    pub fn snapshot(&self, key: &TransferKey) -> Option<TransferState> {
        self.entries().get(key).map(|entry| entry.state.clone())
    }

    pub fn scope(&self, key: &TransferKey) -> Option<CancellationToken> {
        self.entries().get(key).map(|entry| entry.scope.clone())
    }

    pub fn update<R>(&self, key: &TransferKey, f: impl FnOnce(&mut TransferState) -> R) -> Option<R> {
        self.entries().get_mut(key).map(|entry| f(&mut entry.state))
    }

    pub fn transition(&self, key: &TransferKey, next: TransferStatus) -> Result<(), TransitionError> {
        self.update(key, |state| state.transition(next))
            .unwrap_or(Ok(()))
    }

    /// User abort of a single transfer. False when missing or already terminal.
    pub fn stop(&self, key: &TransferKey) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        entry.scope.cancel();
        if entry.state.status().is_terminal() {
            return false;
        }
        entry.state.transition(TransferStatus::Stopped).is_ok()
    }

    /// Whether any non-terminal transfer with `peer_id` remains.
    pub fn has_outstanding(&self, peer_id: &str) -> bool {
        self.entries()
            .values()
            .any(|e| e.state.peer_id == peer_id && !e.state.status().is_terminal())
    }

    /// Peers that still have non-terminal transfers.
    pub fn outstanding_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .entries()
            .values()
            .filter(|e| !e.state.status().is_terminal())
            .map(|e| e.state.peer_id.clone())
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    /// Stop every in-flight relay transfer with `peer_id` and cancel its
    /// scope. Returns the affected keys.
    pub fn stop_peer_relays(&self, peer_id: &str) -> Vec<TransferKey> {
        let mut stopped = Vec::new();
        for (key, entry) in self.entries().iter_mut() {
            if entry.state.peer_id != peer_id
                || entry.state.transport != Transport::Relay
                || entry.state.status().is_terminal()
            {
                continue;
            }
            entry.scope.cancel();
            let _ = entry.state.transition(TransferStatus::Stopped);
            stopped.push(key.clone());
        }
        if !stopped.is_empty() {
            rlog!(
                "transfer: stopped {} relay transfer(s) with {}",
                stopped.len(),
                logging::peer_id(peer_id)
            );
        }
        stopped
    }

    /// Drop finished transfers.
    pub fn prune_terminal(&self) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| !e.state.status().is_terminal());
        before - entries.len()
    }
}
