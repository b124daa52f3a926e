//! # lectern-hub: Session runtime hub for live audio classrooms
//!
//! Keeps every live session in memory (roster, playback, connections) and
//! fans events out to connected participants through bounded per-client
//! queues.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  join / actions   ┌─────────────────────────────┐
//! │  Transport  │ ────────────────► │            Hub              │
//! │ (per conn)  │                   │  SessionRegistry            │
//! └──────▲──────┘                   │   └─ SessionSlot (per id)   │
//!        │ ChannelReceiver          │       ├─ roster + playback  │
//!        │                          │       └─ ClientChannels     │
//! ┌──────┴──────┐   try_send        └──────────────┬──────────────┘
//! │ClientChannel│ ◄────────────────────────────────┘
//! │ (bounded)   │                                  │ record_event
//! └─────────────┘                          ┌───────▼───────┐
//!                                          │ EventRecorder │ ──► AuditStore
//!                                          └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Typed wire events (outbound) and client actions (inbound)
//! - [`session`]: Per-session data model: participants, playback, channels
//! - [`channel`]: Bounded drop-newest outbound queue per connection
//! - [`registry`]: Session id → runtime state, one lock per session
//! - [`playback`]: Playback state machine
//! - [`hub`]: Lifecycle, delivery, participant and playback operations
//! - [`audit`]: Fire-and-forget audit recording and the RocksDB store
//! - [`error`]: Hub error taxonomy

pub mod protocol;
pub mod session;
pub mod channel;
pub mod registry;
pub mod playback;
pub mod hub;
pub mod audit;
pub mod error;

// Re-exports for convenience
pub use protocol::{
    AudioId, ClientAction, ErrorCode, Frame, HubEvent, ParticipantId, ProtocolError, Role,
    SessionId, SessionSnapshot, UserId,
};
pub use session::{Participant, PlaybackState, PlaybackStatus, SessionState};
pub use channel::{
    ChannelId, ChannelReceiver, ClientChannel, DeliveryFailure, Drained, DEFAULT_CHANNEL_CAPACITY,
};
pub use registry::{SessionGuard, SessionRegistry, SessionSlot};
pub use playback::{PlayRequest, SpeedLimits};
pub use hub::{Actor, BroadcastReport, Hub, HubConfig, HubStats, MAX_CHAT_CHARS};
pub use audit::{
    AuditEvent, AuditRecord, AuditSink, AuditStore, AuditSummary, EventRecorder, MemoryRecorder,
    NoopRecorder, QueuedRecorder, SessionMetadata, StoreConfig, StoreError, DEFAULT_AUDIT_QUEUE,
};
pub use error::HubError;
