//! Heartbeats over the direct channel while transfers with a peer are in
//! flight.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::channel::{ChannelError, DirectChannel};
use crate::protocol::{ChannelMessage, MESSAGE_PING, MESSAGE_PONG};
use crate::transfer::TransferRegistry;
use crate::{logging, rlog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive unanswered pings before the peer is given up on.
    pub max_missed: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(4),
            timeout: Duration::from_secs(3),
            max_missed: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreachableReason {
    SendFailed,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUnreachable {
    pub peer_id: String,
    pub reason: UnreachableReason,
}

/// Feeds pongs from message dispatch into a running monitor.
#[derive(Clone)]
pub struct PongRecorder(Arc<watch::Sender<u64>>);

impl PongRecorder {
    pub fn record(&self) {
        self.0.send_modify(|n| *n = n.wrapping_add(1));
    }
}

pub struct LivenessMonitor {
    remote_peer: String,
    pongs: PongRecorder,
    handle: JoinHandle<Option<PeerUnreachable>>,
    guard: DropGuard,
}

impl LivenessMonitor {
    /// Start pinging `channel`'s remote peer.
    ///
    /// Pings only go out while `activity` holds unfinished transfers with
    /// that peer. Once the peer is declared unreachable its relay transfers
    /// are stopped and `on_unreachable` runs to completion inside the
    /// monitor task.
    pub fn spawn<F, Fut>(
        channel: Arc<dyn DirectChannel>,
        local_peer: &str,
        config: LivenessConfig,
        activity: Arc<TransferRegistry>,
        on_unreachable: F,
    ) -> Self
    where
        F: FnOnce(PeerUnreachable) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = watch::channel(0u64);
        let cancel = CancellationToken::new();
        let remote_peer = channel.remote_peer().to_string();
        let local_peer = local_peer.to_string();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let event = watch_peer(channel, &local_peer, config, &activity, rx, &token).await?;
            activity.stop_peer_relays(&event.peer_id);
            on_unreachable(event.clone()).await;
            Some(event)
        });
        Self {
            remote_peer,
            pongs: PongRecorder(Arc::new(tx)),
            handle,
            guard: cancel.drop_guard(),
        }
    }

    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    pub fn record_pong(&self) {
        self.pongs.record();
    }

    pub fn pong_recorder(&self) -> PongRecorder {
        self.pongs.clone()
    }

    /// Wait for the monitor to give up on the peer. Resolves `None` if it
    /// was stopped first.
    pub async fn join(self) -> Option<PeerUnreachable> {
        let LivenessMonitor { handle, guard, .. } = self;
        let result = handle.await.ok().flatten();
        drop(guard);
        result
    }

    pub fn stop(self) {
        drop(self.guard);
    }
}

async fn watch_peer(
    channel: Arc<dyn DirectChannel>,
    local_peer: &str,
    config: LivenessConfig,
    activity: &TransferRegistry,
    mut pongs: watch::Receiver<u64>,
    cancel: &CancellationToken,
) -> Option<PeerUnreachable> {
    let remote = channel.remote_peer().to_string();
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut missed = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = ticker.tick() => {}
        }
        if !activity.has_outstanding(&remote) {
            missed = 0;
            continue;
        }

        let _ = pongs.borrow_and_update();
        if let Err(error) = channel.send_message(&ChannelMessage::ping(local_peer)) {
            rlog!(
                "liveness: ping to {} failed: {}",
                logging::peer_id(&remote),
                error
            );
            return Some(PeerUnreachable {
                peer_id: remote,
                reason: UnreachableReason::SendFailed,
            });
        }

        let answered = tokio::select! {
            _ = cancel.cancelled() => return None,
            answered = tokio::time::timeout(config.timeout, pongs.changed()) => answered,
        };
        match answered {
            Ok(Ok(())) => missed = 0,
            Ok(Err(_)) => return None,
            Err(_) => {
                missed += 1;
                rlog!(
                    "liveness: no pong from {} ({}/{})",
                    logging::peer_id(&remote),
                    missed,
                    config.max_missed
                );
                if missed >= config.max_missed.max(1) {
                    return Some(PeerUnreachable {
                        peer_id: remote,
                        reason: UnreachableReason::Timeout,
                    });
                }
            }
        }
    }
}

/// Reply to a `ping`. Returns whether `message` was one.
pub fn answer_ping(
    channel: &dyn DirectChannel,
    local_peer: &str,
    message: &ChannelMessage,
) -> Result<bool, ChannelError> {
    match message {
        ChannelMessage::Ping { message, .. } if message == MESSAGE_PING => {
            channel.send_message(&ChannelMessage::pong(local_peer))?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

pub fn is_pong(message: &ChannelMessage) -> bool {
    matches!(message, ChannelMessage::Ping { message, .. } if message == MESSAGE_PONG)
}
