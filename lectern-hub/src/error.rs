//! Hub error taxonomy.

use crate::protocol::{ErrorCode, ParticipantId, ProtocolError, SessionId};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HubError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("participant {participant_id} not found in session {session_id}")]
    ParticipantNotFound {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    #[error("teacher permission required")]
    PermissionDenied,
    #[error("No audio selected for this session")]
    NoAudioSelected,
    #[error("invalid {field}: {reason}")]
    InvalidArgument { field: &'static str, reason: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl HubError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        HubError::InvalidArgument {
            field,
            reason: reason.into(),
        }
    }

    /// Class reported to the actor in a personal `error` event.
    pub fn code(&self) -> ErrorCode {
        match self {
            HubError::SessionNotFound(_) | HubError::ParticipantNotFound { .. } => {
                ErrorCode::NotFound
            }
            HubError::PermissionDenied => ErrorCode::PermissionDenied,
            HubError::NoAudioSelected => ErrorCode::InvalidState,
            HubError::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            HubError::Protocol(_) => ErrorCode::BadRequest,
        }
    }
}
