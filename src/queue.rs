//! FIFO transfer queue with bounded concurrency and replaceable cancellation.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::rlog;

pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Result of a queued operation that may have been cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Done(T),
    Aborted,
}

impl<T> Outcome<T> {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Outcome::Aborted)
    }

    pub fn done(self) -> Option<T> {
        match self {
            Outcome::Done(value) => Some(value),
            Outcome::Aborted => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Done(value) => Outcome::Done(f(value)),
            Outcome::Aborted => Outcome::Aborted,
        }
    }
}

pub struct TransferQueue {
    name: String,
    slots: Arc<Semaphore>,
    generation: Mutex<CancellationToken>,
    pending: AtomicUsize,
    active: AtomicUsize,
}

/// Holds one unit of a gauge until dropped.
struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        CountGuard(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TransferQueue {
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            generation: Mutex::new(CancellationToken::new()),
            pending: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tasks waiting for a slot.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Tasks currently holding a slot.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn current_generation(&self) -> CancellationToken {
        self.generation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run `job` once a slot is free, in submission order.
    ///
    /// The job receives a token that fires when the queue is aborted or
    /// `scope` is cancelled; in either case the job future is dropped and
    /// the call resolves to [`Outcome::Aborted`].
    pub async fn run<T, E, F, Fut>(&self, scope: &CancellationToken, job: F) -> Result<Outcome<T>, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = self.current_generation();
        if generation.is_cancelled() || scope.is_cancelled() {
            return Ok(Outcome::Aborted);
        }

        let waiting = CountGuard::enter(&self.pending);
        let permit = tokio::select! {
            biased;
            _ = generation.cancelled() => None,
            _ = scope.cancelled() => None,
            permit = self.slots.acquire() => permit.ok(),
        };
        drop(waiting);

        let Some(_permit) = permit else {
            return Ok(Outcome::Aborted);
        };
        if generation.is_cancelled() || scope.is_cancelled() {
            return Ok(Outcome::Aborted);
        }

        let _active = CountGuard::enter(&self.active);

        let job_token = generation.child_token();
        let work = job(job_token.clone());
        tokio::select! {
            biased;
            _ = job_token.cancelled() => Ok(Outcome::Aborted),
            _ = scope.cancelled() => {
                job_token.cancel();
                Ok(Outcome::Aborted)
            }
            result = work => result.map(Outcome::Done),
        }
    }

    /// Cancel every queued and running task and start a fresh generation.
    ///
    /// Returns the number of tasks that were still waiting for a slot.
    pub fn abort(&self) -> usize {
        let previous = {
            let mut generation = self.generation.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *generation, CancellationToken::new())
        };
        previous.cancel();
        let dropped = self.pending();
        if dropped > 0 || self.active() > 0 {
            rlog!(
                "queue[{}]: aborted ({} queued, {} running)",
                self.name,
                dropped,
                self.active()
            );
        }
        dropped
    }
}
