//! Playback state machine.
//!
//! ```text
//!            select                 play
//!   (any) ──────────► Stopped ─────────────► Playing ◄──┐
//!                                             │  ▲      │ seek (re-issues play)
//!                                       pause │  │ play └─┘
//!                                             ▼  │
//!                                            Paused ── seek: position only
//! ```
//!
//! Each transition mutates [`PlaybackState`] and returns the event to
//! broadcast. Callers run it inside the session's exclusive region so the
//! stored state and the broadcast order never disagree.

use crate::error::HubError;
use crate::protocol::{AudioId, HubEvent};
use crate::session::{PlaybackState, PlaybackStatus};

/// Accepted playback speed range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedLimits {
    pub min: f64,
    pub max: f64,
}

impl Default for SpeedLimits {
    fn default() -> Self {
        Self { min: 0.5, max: 2.0 }
    }
}

impl SpeedLimits {
    pub fn check(&self, speed: f64) -> Result<f64, HubError> {
        if !speed.is_finite() || speed < self.min || speed > self.max {
            return Err(HubError::invalid(
                "speed",
                format!("{speed} outside [{}, {}]", self.min, self.max),
            ));
        }
        Ok(speed)
    }
}

pub(crate) fn check_position(position: f64) -> Result<f64, HubError> {
    if !position.is_finite() || position < 0.0 {
        return Err(HubError::invalid(
            "position",
            format!("{position} is not a non-negative number of seconds"),
        ));
    }
    Ok(position)
}

/// Arguments of a `play` transition.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayRequest {
    /// `None` resumes the currently selected audio.
    pub audio_id: Option<AudioId>,
    pub speed: f64,
    pub position: f64,
    pub title: Option<String>,
    pub duration: Option<f64>,
}

impl Default for PlayRequest {
    fn default() -> Self {
        Self {
            audio_id: None,
            speed: 1.0,
            position: 0.0,
            title: None,
            duration: None,
        }
    }
}

impl PlayRequest {
    /// Play the selected audio from `position`.
    pub fn from_position(position: f64) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }
}

impl PlaybackState {
    /// Load a new track: stopped at position 0.
    pub fn select(&mut self, audio_id: AudioId, title: Option<String>) -> HubEvent {
        if self.audio_id != Some(audio_id) {
            self.duration = None;
        }
        self.audio_id = Some(audio_id);
        self.title = title.clone();
        self.status = PlaybackStatus::Stopped;
        self.position = 0.0;
        HubEvent::AudioSelected { audio_id, title }
    }

    pub fn play(&mut self, request: PlayRequest, limits: &SpeedLimits) -> Result<HubEvent, HubError> {
        let speed = limits.check(request.speed)?;
        let position = check_position(request.position)?;
        let audio_id = request
            .audio_id
            .or(self.audio_id)
            .ok_or(HubError::NoAudioSelected)?;

        if self.audio_id == Some(audio_id) {
            if request.title.is_some() {
                self.title = request.title;
            }
            if request.duration.is_some() {
                self.duration = request.duration;
            }
        } else {
            self.title = request.title;
            self.duration = request.duration;
        }

        self.audio_id = Some(audio_id);
        self.status = PlaybackStatus::Playing;
        self.speed = speed;
        self.position = position;
        Ok(self.play_event(audio_id))
    }

    pub fn pause(&mut self, position: f64) -> Result<HubEvent, HubError> {
        let position = check_position(position)?;
        let audio_id = self.audio_id.ok_or(HubError::NoAudioSelected)?;
        self.status = PlaybackStatus::Paused;
        self.position = position;
        Ok(HubEvent::AudioPause { audio_id, position })
    }

    /// Move the playhead. While playing this is a play from the new
    /// position; otherwise only the position changes.
    pub fn seek(&mut self, position: f64) -> Result<HubEvent, HubError> {
        let position = check_position(position)?;
        let audio_id = self.audio_id.ok_or(HubError::NoAudioSelected)?;
        self.position = position;
        if self.status == PlaybackStatus::Playing {
            Ok(self.play_event(audio_id))
        } else {
            Ok(HubEvent::AudioSeek { audio_id, position })
        }
    }

    fn play_event(&self, audio_id: AudioId) -> HubEvent {
        HubEvent::AudioPlay {
            audio_id,
            speed: self.speed,
            position: self.position,
            title: self.title.clone(),
            duration: self.duration,
        }
    }

    /// `status != Stopped` implies an audio id is set.
    pub fn is_consistent(&self) -> bool {
        self.status == PlaybackStatus::Stopped || self.audio_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> SpeedLimits {
        SpeedLimits::default()
    }

    #[test]
    fn test_select_resets_to_stopped() {
        let mut pb = PlaybackState {
            audio_id: Some(1),
            status: PlaybackStatus::Playing,
            position: 40.0,
            ..PlaybackState::default()
        };
        let event = pb.select(2, Some("Dictation".into()));
        assert_eq!(
            event,
            HubEvent::AudioSelected {
                audio_id: 2,
                title: Some("Dictation".into())
            }
        );
        assert_eq!(pb.status, PlaybackStatus::Stopped);
        assert_eq!(pb.position, 0.0);
        assert_eq!(pb.audio_id, Some(2));
    }

    #[test]
    fn test_play_without_selection_is_rejected() {
        let mut pb = PlaybackState::default();
        let err = pb.play(PlayRequest::default(), &limits()).unwrap_err();
        assert_eq!(err, HubError::NoAudioSelected);
        assert_eq!(pb, PlaybackState::default());
    }

    #[test]
    fn test_play_reuses_selected_audio() {
        let mut pb = PlaybackState::default();
        pb.select(7, Some("T".into()));
        let event = pb.play(PlayRequest::from_position(3.0), &limits()).unwrap();
        assert_eq!(
            event,
            HubEvent::AudioPlay {
                audio_id: 7,
                speed: 1.0,
                position: 3.0,
                title: Some("T".into()),
                duration: None
            }
        );
        assert_eq!(pb.status, PlaybackStatus::Playing);
    }

    #[test]
    fn test_play_new_audio_replaces_metadata() {
        let mut pb = PlaybackState::default();
        pb.select(7, Some("Old".into()));
        pb.play(
            PlayRequest {
                audio_id: Some(8),
                speed: 1.25,
                position: 0.0,
                title: Some("New".into()),
                duration: Some(90.0),
            },
            &limits(),
        )
        .unwrap();
        assert_eq!(pb.audio_id, Some(8));
        assert_eq!(pb.title.as_deref(), Some("New"));
        assert_eq!(pb.duration, Some(90.0));
        assert_eq!(pb.speed, 1.25);
    }

    #[test]
    fn test_speed_and_position_bounds() {
        let mut pb = PlaybackState::default();
        pb.select(1, None);
        for speed in [0.25, 2.5, f64::NAN] {
            let request = PlayRequest {
                speed,
                ..PlayRequest::default()
            };
            assert!(matches!(
                pb.play(request, &limits()),
                Err(HubError::InvalidArgument { field: "speed", .. })
            ));
        }
        assert!(pb.play(PlayRequest::from_position(-1.0), &limits()).is_err());
        assert!(pb.seek(f64::INFINITY).is_err());
        assert_eq!(pb.status, PlaybackStatus::Stopped);
    }

    #[test]
    fn test_seek_while_playing_reissues_play() {
        let mut pb = PlaybackState::default();
        pb.select(7, Some("T".into()));
        pb.play(PlayRequest::from_position(3.0), &limits()).unwrap();
        let event = pb.seek(5.0).unwrap();
        assert_eq!(event.kind(), "audio_play");
        assert_eq!(pb.status, PlaybackStatus::Playing);
        assert_eq!(pb.position, 5.0);
        assert_eq!(pb.audio_id, Some(7));
    }

    #[test]
    fn test_seek_while_paused_records_position() {
        let mut pb = PlaybackState::default();
        pb.select(7, None);
        pb.play(PlayRequest::default(), &limits()).unwrap();
        pb.pause(10.0).unwrap();
        let event = pb.seek(20.0).unwrap();
        assert_eq!(event, HubEvent::AudioSeek { audio_id: 7, position: 20.0 });
        assert_eq!(pb.status, PlaybackStatus::Paused);
        assert_eq!(pb.position, 20.0);
    }

    #[test]
    fn test_pause_requires_audio() {
        let mut pb = PlaybackState::default();
        assert_eq!(pb.pause(1.0).unwrap_err(), HubError::NoAudioSelected);
        assert_eq!(pb.seek(1.0).unwrap_err(), HubError::NoAudioSelected);
        assert!(pb.is_consistent());
    }

    #[test]
    fn test_invariant_holds_across_transitions() {
        let mut pb = PlaybackState::default();
        let _ = pb.pause(1.0);
        assert!(pb.is_consistent());
        pb.select(3, None);
        pb.play(PlayRequest::default(), &limits()).unwrap();
        assert!(pb.is_consistent());
        pb.pause(2.0).unwrap();
        assert!(pb.is_consistent());
        pb.seek(4.0).unwrap();
        assert!(pb.is_consistent());
        pb.select(4, None);
        assert!(pb.is_consistent());
    }
}
