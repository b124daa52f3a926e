//! Per-session runtime state: roster, playback and live channels.
//!
//! A participant entry with an attached channel is online; an entry
//! without one is known but offline. Both are valid, and the roster entry
//! only goes away on kick.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::channel::ClientChannel;
use crate::protocol::{AudioId, HubEvent, ParticipantId, SessionId, SessionSnapshot, UserId};

/// Roster entry for one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub name: String,
    pub is_muted: bool,
    pub raised_hand: bool,
    pub is_teacher: bool,
}

impl Participant {
    pub fn new(user_id: UserId, name: impl Into<String>, is_teacher: bool) -> Self {
        Self {
            user_id,
            name: name.into(),
            is_muted: false,
            raised_hand: false,
            is_teacher,
        }
    }
}

/// Playback transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// The single shared audio playback state of a session.
///
/// Invariant: `status != Stopped` implies `audio_id.is_some()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    pub audio_id: Option<AudioId>,
    pub title: Option<String>,
    pub status: PlaybackStatus,
    pub speed: f64,
    pub position: f64,
    pub duration: Option<f64>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            audio_id: None,
            title: None,
            status: PlaybackStatus::Stopped,
            speed: 1.0,
            position: 0.0,
            duration: None,
        }
    }
}

/// Seconds since the Unix epoch.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Runtime record of one live session.
#[derive(Debug)]
pub struct SessionState {
    pub id: SessionId,
    /// Cleared by `close_session`; a handle that outlived the registry
    /// entry sees an inactive session and treats it as not found.
    pub active: bool,
    pub created_at: u64,
    pub ended_at: Option<u64>,
    pub participants: BTreeMap<ParticipantId, Participant>,
    pub(crate) channels: HashMap<ParticipantId, ClientChannel>,
    pub playback: PlaybackState,
}

impl SessionState {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            active: true,
            created_at: now_secs(),
            ended_at: None,
            participants: BTreeMap::new(),
            channels: HashMap::new(),
            playback: PlaybackState::default(),
        }
    }

    pub fn is_online(&self, participant_id: ParticipantId) -> bool {
        self.channels.contains_key(&participant_id)
    }

    pub fn online_count(&self) -> usize {
        self.channels.len()
    }

    pub fn online(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn channel(&self, participant_id: ParticipantId) -> Option<ClientChannel> {
        self.channels.get(&participant_id).cloned()
    }

    /// Point-in-time list of channels, minus `exclude`.
    pub(crate) fn recipients(
        &self,
        exclude: &HashSet<ParticipantId>,
    ) -> Vec<(ParticipantId, ClientChannel)> {
        self.channels
            .iter()
            .filter(|(pid, _)| !exclude.contains(*pid))
            .map(|(pid, ch)| (*pid, ch.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            participants: self.participants.clone(),
            playback: self.playback.clone(),
        }
    }

    pub fn snapshot_event(&self) -> HubEvent {
        HubEvent::SessionState(self.snapshot())
    }
}
