//! Maps inbound client actions onto hub operations.
//!
//! Hub refusals (permission, invalid state, bad arguments) are already
//! reported to the sender by the hub. Only problems the hub never sees,
//! like unparseable frames, are answered here.

use lectern_hub::error::HubError;
use lectern_hub::hub::{Actor, Hub};
use lectern_hub::playback::PlayRequest;
use lectern_hub::protocol::{ClientAction, HubEvent, SessionId};

use crate::identity::Identity;

/// One accepted connection, as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub session_id: SessionId,
    pub identity: Identity,
}

impl ConnectionContext {
    pub fn new(session_id: SessionId, identity: Identity) -> Self {
        Self {
            session_id,
            identity,
        }
    }

    pub fn actor(&self) -> Actor {
        Actor::participant(
            self.identity.participant_id,
            self.identity.user_id,
            self.identity.role,
        )
    }
}

/// Parse and run one inbound text frame.
pub async fn handle_text(hub: &Hub, ctx: &ConnectionContext, text: &str) {
    match ClientAction::parse(text) {
        Ok(action) => {
            if let Err(e) = dispatch(hub, ctx, action).await {
                log::debug!(
                    "Session {}: action from participant {} failed: {e}",
                    ctx.session_id,
                    ctx.identity.participant_id
                );
            }
        }
        Err(e) => {
            log::warn!(
                "Session {}: bad frame from participant {}: {e}",
                ctx.session_id,
                ctx.identity.participant_id
            );
            reply_error(hub, ctx, &HubError::from(e)).await;
        }
    }
}

/// Run one parsed action on behalf of the connection.
pub async fn dispatch(hub: &Hub, ctx: &ConnectionContext, action: ClientAction) -> Result<(), HubError> {
    let session_id = ctx.session_id;
    let me = ctx.identity.participant_id;
    let actor = ctx.actor();

    match action {
        ClientAction::MuteSelf { mute } => hub.mute(&actor, session_id, me, mute).await,
        ClientAction::RaiseHand => {
            hub.raise_hand(session_id, me).await;
            Ok(())
        }
        ClientAction::LowerHand => {
            hub.lower_hand(session_id, me).await;
            Ok(())
        }
        ClientAction::MuteParticipant {
            target_participant_id,
        } => hub.mute(&actor, session_id, target_participant_id, true).await,
        ClientAction::UnmuteParticipant {
            target_participant_id,
        } => hub.mute(&actor, session_id, target_participant_id, false).await,
        ClientAction::KickParticipant {
            target_participant_id,
            reason,
        } => hub.kick(&actor, session_id, target_participant_id, reason).await,
        ClientAction::EndSession => hub.end_session(&actor, session_id).await.map(|_| ()),
        ClientAction::WebrtcSignal {
            target_participant_id,
            payload,
        } => {
            if hub
                .relay_signal(session_id, me, target_participant_id, payload)
                .await
            {
                return Ok(());
            }
            let error = HubError::ParticipantNotFound {
                session_id,
                participant_id: target_participant_id,
            };
            reply_error(hub, ctx, &error).await;
            Err(error)
        }
        ClientAction::Chat { text } => hub.chat(session_id, me, &text).await,
        ClientAction::SelectAudio { audio_id, title } => {
            hub.select_audio(&actor, session_id, audio_id, title).await
        }
        ClientAction::PlayAudio {
            audio_id,
            speed,
            position,
            title,
            duration,
        } => {
            let request = PlayRequest {
                audio_id,
                speed,
                position,
                title,
                duration,
            };
            hub.play_audio(&actor, session_id, request).await
        }
        ClientAction::PauseAudio { position } => hub.pause_audio(&actor, session_id, position).await,
        ClientAction::SeekAudio { position } => hub.seek_audio(&actor, session_id, position).await,
    }
}

async fn reply_error(hub: &Hub, ctx: &ConnectionContext, error: &HubError) {
    let event = HubEvent::error(error.code(), error.to_string());
    if let Err(failure) = hub
        .send_to(ctx.session_id, ctx.identity.participant_id, event)
        .await
    {
        log::debug!(
            "Session {}: could not report error to participant {}: {failure}",
            ctx.session_id,
            ctx.identity.participant_id
        );
    }
}
