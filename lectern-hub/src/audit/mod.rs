//! Audit recording: the hub's outbound seam to durable storage.
//!
//! ```text
//! ┌─────────────┐ record_event ┌───────────────┐  queue  ┌──────────────┐
//! │     Hub     │ ───────────► │ QueuedRecorder│ ──────► │  AuditStore  │
//! │ (in-memory) │ (never waits)│ (bounded)     │  task   │  (RocksDB)   │
//! └─────────────┘              └───────────────┘         └──────────────┘
//! ```
//!
//! Recording is fire-and-forget. A full queue or a failing sink is logged
//! and never reaches the broadcaster.

pub mod queue;
pub mod store;

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{SessionId, UserId};
use crate::session::now_secs;

pub use queue::{AuditSink, QueuedRecorder, DEFAULT_AUDIT_QUEUE};
pub use store::{AuditStore, AuditSummary, SessionMetadata, StoreConfig, StoreError};

/// Kinds of audited session activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    SessionCreated,
    SessionEnded,
    ParticipantJoined,
    ParticipantLeft,
    ParticipantKicked,
    ParticipantAdded,
    HandRaised,
    HandLowered,
    ParticipantMuted,
    ParticipantUnmuted,
    AudioSelected,
    AudioPlay,
    AudioPause,
    AudioSeek,
    ChatMessage,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEvent::SessionCreated => "session_created",
            AuditEvent::SessionEnded => "session_ended",
            AuditEvent::ParticipantJoined => "participant_joined",
            AuditEvent::ParticipantLeft => "participant_left",
            AuditEvent::ParticipantKicked => "participant_kicked",
            AuditEvent::ParticipantAdded => "participant_added",
            AuditEvent::HandRaised => "hand_raised",
            AuditEvent::HandLowered => "hand_lowered",
            AuditEvent::ParticipantMuted => "participant_muted",
            AuditEvent::ParticipantUnmuted => "participant_unmuted",
            AuditEvent::AudioSelected => "audio_selected",
            AuditEvent::AudioPlay => "audio_play",
            AuditEvent::AudioPause => "audio_pause",
            AuditEvent::AudioSeek => "audio_seek",
            AuditEvent::ChatMessage => "chat_message",
        }
    }
}

/// One audited event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub session_id: SessionId,
    pub event_type: AuditEvent,
    pub user_id: Option<UserId>,
    pub details: Value,
    /// Seconds since the Unix epoch.
    pub recorded_at: u64,
}

impl AuditRecord {
    pub fn new(
        session_id: SessionId,
        event_type: AuditEvent,
        user_id: Option<UserId>,
        details: Value,
    ) -> Self {
        Self {
            session_id,
            event_type,
            user_id,
            details,
            recorded_at: now_secs(),
        }
    }
}

/// Receives audit records from the hub. Must not block.
pub trait EventRecorder: Send + Sync {
    fn record_event(&self, record: AuditRecord);
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl EventRecorder for NoopRecorder {
    fn record_event(&self, _record: AuditRecord) {}
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Event types recorded for one session, in order.
    pub fn event_types(&self, session_id: SessionId) -> Vec<AuditEvent> {
        self.records()
            .into_iter()
            .filter(|r| r.session_id == session_id)
            .map(|r| r.event_type)
            .collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record_event(&self, record: AuditRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}
