//! Point-to-point peer channel abstraction.
//!
//! A channel is reliable, ordered and message based. Establishing one
//! (signaling, NAT traversal) happens elsewhere; this crate only sends
//! frames on an open channel and consumes received frames from an mpsc
//! receiver handed out alongside it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::protocol::ChannelMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    Closed,
    Send(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "connection lost"),
            ChannelError::Send(detail) => write!(f, "send failed: {detail}"),
        }
    }
}

impl std::error::Error for ChannelError {}

pub trait DirectChannel: Send + Sync {
    /// Id of the peer at the other end.
    fn remote_peer(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Queue one frame for delivery. Returns once the frame is buffered.
    fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError>;

    fn send_message(&self, message: &ChannelMessage) -> Result<(), ChannelError> {
        let frame = message
            .encode()
            .map_err(|e| ChannelError::Send(e.to_string()))?;
        self.send(frame)
    }
}

/// In-process channel end backed by an unbounded mpsc queue.
pub struct MemoryChannel {
    remote: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    open: Arc<AtomicBool>,
}

pub type FrameReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

impl MemoryChannel {
    /// Connected pair: frames sent on `a` arrive on `b`'s receiver and vice
    /// versa. Closing either end closes both.
    pub fn pair(a: &str, b: &str) -> ((MemoryChannel, FrameReceiver), (MemoryChannel, FrameReceiver)) {
        let open = Arc::new(AtomicBool::new(true));
        let (to_b, b_rx) = mpsc::unbounded_channel();
        let (to_a, a_rx) = mpsc::unbounded_channel();
        let a_end = MemoryChannel {
            remote: b.to_string(),
            tx: to_b,
            open: open.clone(),
        };
        let b_end = MemoryChannel {
            remote: a.to_string(),
            tx: to_a,
            open,
        };
        ((a_end, a_rx), (b_end, b_rx))
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl DirectChannel for MemoryChannel {
    fn remote_peer(&self) -> &str {
        &self.remote
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        self.tx.send(frame).map_err(|_| ChannelError::Closed)
    }
}
