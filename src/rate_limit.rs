//! Sliding-window throughput governor shared by the relay server and client.
//!
//! Each accounting unit keeps `(timestamp, bytes)` samples for the last five
//! seconds and treats the sum of the last second as the current rate. The
//! limiter is reactive: the transfer just accounted always proceeds, and the
//! computed wait throttles whatever comes next on the same unit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Samples older than this are dropped.
pub const WINDOW_HORIZON: Duration = Duration::from_secs(5);
/// Samples younger than this make up the current rate.
pub const RATE_HORIZON: Duration = Duration::from_secs(1);
/// Upper bound on a single throttle wait.
pub const MAX_WAIT: Duration = Duration::from_millis(1000);
/// Default cap per direction, in bytes per second.
pub const DEFAULT_RATE_CAP: u64 = 2 * 1024 * 1024;

const UNIT_SWEEP_THRESHOLD: usize = 1024;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock read through tokio, so paused test time applies to it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Synthetic clock advanced by hand.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

/// Accounting unit: a direction, optionally narrowed to one peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub direction: Direction,
    pub peer: Option<String>,
}

impl RateKey {
    pub fn direction(direction: Direction) -> Self {
        Self {
            direction,
            peer: None,
        }
    }

    pub fn peer(direction: Direction, peer: impl Into<String>) -> Self {
        Self {
            direction,
            peer: Some(peer.into()),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct RateWindow {
    samples: VecDeque<(Instant, u64)>,
}

impl RateWindow {
    /// Append a sample and return the rate over the last second.
    pub fn record(&mut self, now: Instant, bytes: u64) -> u64 {
        self.samples.push_back((now, bytes));
        self.prune(now);
        self.current_rate(now)
    }

    pub fn prune(&mut self, now: Instant) {
        while matches!(self.samples.front(), Some((at, _)) if now.saturating_duration_since(*at) >= WINDOW_HORIZON)
        {
            self.samples.pop_front();
        }
    }

    pub fn current_rate(&self, now: Instant) -> u64 {
        self.samples
            .iter()
            .rev()
            .take_while(|(at, _)| now.saturating_duration_since(*at) < RATE_HORIZON)
            .map(|(_, bytes)| *bytes)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Wait needed once the last-second rate reaches `cap`.
///
/// `min(ceil((rate - cap) / cap * 1000) ms, 1000 ms)`; a zero wait is `None`.
pub fn wait_for(rate: u64, cap: u64) -> Option<Duration> {
    if cap == 0 || rate < cap {
        return None;
    }
    let excess_ms = ((rate - cap) as u128 * 1000).div_ceil(cap as u128);
    let wait_ms = excess_ms.min(MAX_WAIT.as_millis()) as u64;
    (wait_ms > 0).then(|| Duration::from_millis(wait_ms))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    Proceed { waited: Duration },
    Aborted,
}

#[derive(Default)]
struct RateUnit {
    window: RateWindow,
    release_at: Option<tokio::time::Instant>,
}

pub struct RateLimiter {
    cap: u64,
    clock: Arc<dyn Clock>,
    units: Mutex<HashMap<RateKey, RateUnit>>,
}

impl RateLimiter {
    /// `cap` is in bytes per second; zero disables limiting.
    pub fn new(cap: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            cap,
            clock,
            units: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_system_clock(cap: u64) -> Self {
        Self::new(cap, Arc::new(SystemClock))
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    fn units(&self) -> MutexGuard<'_, HashMap<RateKey, RateUnit>> {
        self.units.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `bytes` against `key` and return the wait the next transfer
    /// on that unit should observe.
    pub fn account(&self, key: &RateKey, bytes: u64) -> Option<Duration> {
        let mut units = self.units();
        let now = self.clock.now();
        let rate = units.entry(key.clone()).or_default().window.record(now, bytes);
        if units.len() > UNIT_SWEEP_THRESHOLD {
            units.retain(|_, unit| {
                unit.window.prune(now);
                !unit.window.is_empty()
            });
        }
        wait_for(rate, self.cap)
    }

    /// Last-second rate for `key`.
    pub fn current_rate(&self, key: &RateKey) -> u64 {
        let now = self.clock.now();
        self.units()
            .get(key)
            .map(|unit| unit.window.current_rate(now))
            .unwrap_or(0)
    }

    /// Account `bytes` and, if the unit is over its cap, suspend until the
    /// unit's shared release deadline.
    ///
    /// Callers that start waiting while a deadline is pending join it, so a
    /// batch of waiters is released together.
    pub async fn throttle(
        &self,
        key: &RateKey,
        bytes: u64,
        cancel: &CancellationToken,
    ) -> Throttle {
        if cancel.is_cancelled() {
            return Throttle::Aborted;
        }
        let Some(wait) = self.account(key, bytes) else {
            return Throttle::Proceed {
                waited: Duration::ZERO,
            };
        };

        let started = tokio::time::Instant::now();
        let deadline = {
            let mut units = self.units();
            let unit = units.entry(key.clone()).or_default();
            match unit.release_at {
                Some(at) if at > started => at,
                _ => {
                    let at = started + wait;
                    unit.release_at = Some(at);
                    at
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Throttle::Aborted,
            _ = tokio::time::sleep_until(deadline) => Throttle::Proceed {
                waited: deadline.saturating_duration_since(started),
            },
        }
    }
}
