//! JSON wire protocol between the hub and connected clients.
//!
//! Every outbound event is a flat JSON object tagged by `type`:
//! ```text
//! {"type":"participant_muted","participant_id":7,"is_muted":true}
//! {"type":"audio_play","audio_id":3,"speed":1.0,"position":12.5,"title":"Unit 4","duration":null}
//! {"type":"session_ended"}
//! ```
//!
//! Outbound events are encoded once per broadcast into a [`Frame`] and the
//! same `Arc<Frame>` is pushed to every recipient, so fan-out never
//! re-serializes.
//!
//! Inbound client actions use the same tagging ([`ClientAction`]).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{Participant, PlaybackState};

/// Session identifier (primary key of the persisted session record).
pub type SessionId = u64;
/// Participant identifier, unique within a session.
pub type ParticipantId = u64;
/// User account identifier.
pub type UserId = u64;
/// Audio file identifier.
pub type AudioId = u64;

/// Role resolved by the auth layer before the hub is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    #[default]
    Student,
}

impl Role {
    /// Parse a stored role name. Anything other than "teacher" is a student.
    pub fn parse(role: &str) -> Self {
        if role.trim().eq_ignore_ascii_case("teacher") {
            Role::Teacher
        } else {
            Role::Student
        }
    }

    pub fn is_teacher(self) -> bool {
        self == Role::Teacher
    }
}

/// Machine-readable class of a personal `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    PermissionDenied,
    InvalidState,
    InvalidArgument,
    BadRequest,
}

/// Full state snapshot sent personally to a participant on join.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub participants: BTreeMap<ParticipantId, Participant>,
    pub playback: PlaybackState,
}

/// Outbound event pushed to client channels.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// Written by the transport right after the connection is accepted.
    Connected {
        session_id: SessionId,
        participant_id: ParticipantId,
        user_id: UserId,
    },
    SessionState(SessionSnapshot),
    ParticipantJoined {
        participant_id: ParticipantId,
        user_id: UserId,
        name: String,
        is_teacher: bool,
    },
    ParticipantAdded {
        participant_id: ParticipantId,
        user_id: UserId,
        name: String,
        is_teacher: bool,
    },
    ParticipantAlreadyPresent {
        participant_id: ParticipantId,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
    },
    ParticipantMuted {
        participant_id: ParticipantId,
        is_muted: bool,
    },
    HandRaised {
        participant_id: ParticipantId,
    },
    HandLowered {
        participant_id: ParticipantId,
    },
    ParticipantKicked {
        participant_id: ParticipantId,
    },
    /// Terminal notice for a kicked participant.
    Kicked {
        reason: String,
    },
    /// Terminal notice for a soft-disconnected or replaced connection.
    Disconnected {
        reason: String,
    },
    SessionEnded,
    AudioSelected {
        audio_id: AudioId,
        title: Option<String>,
    },
    AudioPlay {
        audio_id: AudioId,
        speed: f64,
        position: f64,
        title: Option<String>,
        duration: Option<f64>,
    },
    AudioPause {
        audio_id: AudioId,
        position: f64,
    },
    AudioSeek {
        audio_id: AudioId,
        position: f64,
    },
    Chat {
        from: ParticipantId,
        sender_name: String,
        text: String,
    },
    WebrtcSignal {
        from: ParticipantId,
        to: ParticipantId,
        payload: Value,
    },
    Error {
        code: ErrorCode,
        detail: String,
    },
}

impl HubEvent {
    /// The `type` discriminator as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            HubEvent::Connected { .. } => "connected",
            HubEvent::SessionState(_) => "session_state",
            HubEvent::ParticipantJoined { .. } => "participant_joined",
            HubEvent::ParticipantAdded { .. } => "participant_added",
            HubEvent::ParticipantAlreadyPresent { .. } => "participant_already_present",
            HubEvent::ParticipantLeft { .. } => "participant_left",
            HubEvent::ParticipantMuted { .. } => "participant_muted",
            HubEvent::HandRaised { .. } => "hand_raised",
            HubEvent::HandLowered { .. } => "hand_lowered",
            HubEvent::ParticipantKicked { .. } => "participant_kicked",
            HubEvent::Kicked { .. } => "kicked",
            HubEvent::Disconnected { .. } => "disconnected",
            HubEvent::SessionEnded => "session_ended",
            HubEvent::AudioSelected { .. } => "audio_selected",
            HubEvent::AudioPlay { .. } => "audio_play",
            HubEvent::AudioPause { .. } => "audio_pause",
            HubEvent::AudioSeek { .. } => "audio_seek",
            HubEvent::Chat { .. } => "chat",
            HubEvent::WebrtcSignal { .. } => "webrtc_signal",
            HubEvent::Error { .. } => "error",
        }
    }

    pub fn error(code: ErrorCode, detail: impl Into<String>) -> Self {
        HubEvent::Error {
            code,
            detail: detail.into(),
        }
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// An event encoded once and shared by every recipient of a delivery.
#[derive(Debug)]
pub struct Frame {
    event: HubEvent,
    json: String,
}

impl Frame {
    pub fn encode(event: HubEvent) -> Result<Arc<Self>, ProtocolError> {
        let json = event.to_json()?;
        Ok(Arc::new(Self { event, json }))
    }

    pub fn event(&self) -> &HubEvent {
        &self.event
    }

    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }

    /// Pre-encoded JSON text, ready to be written to a socket.
    pub fn json(&self) -> &str {
        &self.json
    }
}

fn default_true() -> bool {
    true
}

fn default_speed() -> f64 {
    1.0
}

/// Inbound action sent by a connected client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientAction {
    MuteSelf {
        #[serde(default = "default_true")]
        mute: bool,
    },
    RaiseHand,
    LowerHand,
    MuteParticipant {
        target_participant_id: ParticipantId,
    },
    UnmuteParticipant {
        target_participant_id: ParticipantId,
    },
    KickParticipant {
        target_participant_id: ParticipantId,
        #[serde(default)]
        reason: Option<String>,
    },
    EndSession,
    WebrtcSignal {
        target_participant_id: ParticipantId,
        #[serde(default)]
        payload: Value,
    },
    Chat {
        text: String,
    },
    SelectAudio {
        audio_id: AudioId,
        #[serde(default)]
        title: Option<String>,
    },
    PlayAudio {
        #[serde(default)]
        audio_id: Option<AudioId>,
        #[serde(default = "default_speed")]
        speed: f64,
        #[serde(default)]
        position: f64,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        duration: Option<f64>,
    },
    PauseAudio {
        #[serde(default)]
        position: f64,
    },
    SeekAudio {
        position: f64,
    },
}

const CLIENT_ACTION_TYPES: &[&str] = &[
    "mute_self",
    "raise_hand",
    "lower_hand",
    "mute_participant",
    "unmute_participant",
    "kick_participant",
    "end_session",
    "webrtc_signal",
    "chat",
    "select_audio",
    "play_audio",
    "pause_audio",
    "seek_audio",
];

impl ClientAction {
    /// Parse an inbound text frame.
    ///
    /// Unknown `type` values are reported separately from malformed
    /// payloads so the caller can echo the offending type back.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None => return Err(ProtocolError::MissingType),
        };
        if !CLIENT_ACTION_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Message has no type")]
    MissingType,
    #[error("unknown message type {0}")]
    UnknownType(String),
}
