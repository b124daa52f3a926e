//! Per-participant bounded outbound queue.
//!
//! The hub holds the [`ClientChannel`] (producer side); the transport
//! holds the matching [`ChannelReceiver`] and drains it to the socket.
//!
//! ```text
//!   Hub ── push() ──► [ frame | frame | ... | Close ] ──► ChannelReceiver ──► socket
//!          (never blocks)      capacity N                  (awaits)
//! ```
//!
//! When the queue is full the newest frame is dropped: `push` returns
//! [`DeliveryFailure::QueueFull`] and the per-channel drop counter grows.
//! A slow consumer never stalls the producer or other recipients.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use uuid::Uuid;

use crate::protocol::{Frame, ParticipantId, SessionId};

/// Default queue depth per connected participant.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Identity of one channel generation; a reconnect gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Why a frame did not reach a recipient's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFailure {
    #[error("queue full")]
    QueueFull,
    #[error("channel closed")]
    Closed,
    #[error("participant not connected")]
    NotConnected,
    #[error("event could not be encoded")]
    Unencodable,
}

enum Slot {
    Frame(Arc<Frame>),
    Close,
}

struct ChannelShared {
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Producer side of a participant's queue.
#[derive(Clone)]
pub struct ClientChannel {
    id: ChannelId,
    session_id: SessionId,
    participant_id: ParticipantId,
    sender: mpsc::Sender<Slot>,
    shared: Arc<ChannelShared>,
}

impl ClientChannel {
    /// Create a channel bound to one (session, participant) pair.
    pub fn new(
        session_id: SessionId,
        participant_id: ParticipantId,
        capacity: usize,
    ) -> (Self, ChannelReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = ChannelId::new();
        let channel = Self {
            id,
            session_id,
            participant_id,
            sender,
            shared: Arc::new(ChannelShared {
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        };
        let receiver = ChannelReceiver {
            id,
            receiver,
            finished: false,
        };
        (channel, receiver)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    /// Non-blocking enqueue.
    pub fn push(&self, frame: Arc<Frame>) -> Result<(), DeliveryFailure> {
        if self.is_closed() {
            return Err(DeliveryFailure::Closed);
        }
        match self.sender.try_send(Slot::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(Slot::Frame(frame))) => {
                let drops = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "Queue full for participant {} in session {}: dropped {} (total drops {drops})",
                    self.participant_id,
                    self.session_id,
                    frame.kind()
                );
                Err(DeliveryFailure::QueueFull)
            }
            Err(TrySendError::Full(Slot::Close)) => Err(DeliveryFailure::QueueFull),
            Err(TrySendError::Closed(_)) => Err(DeliveryFailure::Closed),
        }
    }

    /// Mark the channel closed and enqueue the terminal sentinel.
    ///
    /// Returns `false` if the channel was already closed. If the queue is
    /// full the sentinel is skipped; the receiver still terminates once the
    /// hub drops its sender.
    pub fn close(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.sender.try_send(Slot::Close).is_err() {
            log::debug!(
                "Close sentinel not queued for participant {} in session {}",
                self.participant_id,
                self.session_id
            );
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }

    /// Frames dropped on this channel because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChannel")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("participant_id", &self.participant_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Everything currently buffered in a receiver.
#[derive(Debug, Default)]
pub struct Drained {
    pub frames: Vec<Arc<Frame>>,
    /// The terminal sentinel was reached.
    pub closed: bool,
}

impl Drained {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.frames.iter().map(|f| f.kind()).collect()
    }
}

/// Consumer side of a participant's queue, owned by the transport.
pub struct ChannelReceiver {
    id: ChannelId,
    receiver: mpsc::Receiver<Slot>,
    finished: bool,
}

impl fmt::Debug for ChannelReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelReceiver")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl ChannelReceiver {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Wait for the next frame. `None` means the channel was closed.
    pub async fn recv(&mut self) -> Option<Arc<Frame>> {
        if self.finished {
            return None;
        }
        match self.receiver.recv().await {
            Some(Slot::Frame(frame)) => Some(frame),
            Some(Slot::Close) | None => {
                self.finished = true;
                self.receiver.close();
                None
            }
        }
    }

    /// Collect every frame buffered right now, without waiting.
    pub fn drain(&mut self) -> Drained {
        let mut drained = Drained {
            frames: Vec::new(),
            closed: self.finished,
        };
        while !self.finished {
            match self.receiver.try_recv() {
                Ok(Slot::Frame(frame)) => drained.frames.push(frame),
                Ok(Slot::Close) | Err(TryRecvError::Disconnected) => {
                    self.finished = true;
                    self.receiver.close();
                    drained.closed = true;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        drained
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}
