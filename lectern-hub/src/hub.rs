//! Session hub: connection lifecycle, fan-out, participant actions and
//! playback transitions for every live session.
//!
//! ```text
//!  transport ──► Hub::join / mute / play_audio / ...
//!                  │
//!                  ├─ lock session state ─── mutate roster / playback
//!                  ├─ plan an Outbox ─────── frames + point-in-time recipients
//!                  ├─ take delivery turn, release state
//!                  └─ push (try_send) ─────► ClientChannel queues ──► transport
//! ```
//!
//! Mutations on one session and the deliveries they cause happen in call
//! order. A full or closed queue costs one failed `try_send` and shows up in
//! the [`BroadcastReport`]; it never holds up the other recipients.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::audit::{AuditEvent, AuditRecord, EventRecorder, NoopRecorder};
use crate::channel::{
    ChannelId, ChannelReceiver, ClientChannel, DeliveryFailure, DEFAULT_CHANNEL_CAPACITY,
};
use crate::error::HubError;
use crate::playback::{PlayRequest, SpeedLimits};
use crate::protocol::{
    AudioId, Frame, HubEvent, ParticipantId, Role, SessionId, SessionSnapshot, UserId,
};
use crate::registry::{SessionGuard, SessionRegistry, SessionSlot};
use crate::session::{now_secs, Participant, PlaybackState, SessionState};

/// Longest accepted chat message, in characters.
pub const MAX_CHAT_CHARS: usize = 2000;

const REPLACED_REASON: &str = "Replaced by a newer connection";

/// Hub tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// Frames buffered per connection before new ones are dropped.
    pub channel_capacity: usize,
    pub speed_limits: SpeedLimits,
    /// Sent with `kicked` when the teacher gives no reason.
    pub default_kick_reason: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            speed_limits: SpeedLimits::default(),
            default_kick_reason: "Removed by teacher".to_string(),
        }
    }
}

/// Who is asking for an operation. Identity is resolved before the hub is
/// called and trusted as given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    /// Connected participant issuing the request, if any. Refusals are
    /// reported to this participant's channel.
    pub participant_id: Option<ParticipantId>,
    pub user_id: Option<UserId>,
    pub role: Role,
}

impl Actor {
    pub fn participant(participant_id: ParticipantId, user_id: UserId, role: Role) -> Self {
        Self {
            participant_id: Some(participant_id),
            user_id: Some(user_id),
            role,
        }
    }

    /// A caller outside any session connection, e.g. a request handler.
    pub fn detached(user_id: UserId, role: Role) -> Self {
        Self {
            participant_id: None,
            user_id: Some(user_id),
            role,
        }
    }

    pub fn teacher(participant_id: ParticipantId) -> Self {
        Self {
            participant_id: Some(participant_id),
            user_id: None,
            role: Role::Teacher,
        }
    }

    pub fn student(participant_id: ParticipantId) -> Self {
        Self {
            participant_id: Some(participant_id),
            user_id: None,
            role: Role::Student,
        }
    }

    pub fn is_teacher(&self) -> bool {
        self.role.is_teacher()
    }

    fn acts_for(&self, participant_id: ParticipantId) -> bool {
        self.participant_id == Some(participant_id)
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub event_type: &'static str,
    /// Channels in the point-in-time recipient list.
    pub recipients: usize,
    pub delivered: usize,
    pub failures: Vec<(ParticipantId, DeliveryFailure)>,
}

impl BroadcastReport {
    fn empty(event_type: &'static str) -> Self {
        Self {
            event_type,
            ..Self::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Point-in-time hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub sessions: usize,
    pub online_channels: usize,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

enum Step {
    Deliver {
        frame: Arc<Frame>,
        recipients: Vec<(ParticipantId, ClientChannel)>,
        excluded: usize,
    },
    Close(ClientChannel),
}

/// Deliveries planned under the session lock and executed after it.
#[derive(Default)]
struct Outbox {
    steps: Vec<Step>,
}

impl Outbox {
    fn deliver(&mut self, event: HubEvent, recipients: Vec<(ParticipantId, ClientChannel)>) {
        self.deliver_excluding(event, recipients, 0);
    }

    fn deliver_excluding(
        &mut self,
        event: HubEvent,
        recipients: Vec<(ParticipantId, ClientChannel)>,
        excluded: usize,
    ) {
        match Frame::encode(event) {
            Ok(frame) => self.steps.push(Step::Deliver {
                frame,
                recipients,
                excluded,
            }),
            Err(e) => log::error!("Dropping unencodable event: {e}"),
        }
    }

    fn close(&mut self, channel: ClientChannel) {
        self.steps.push(Step::Close(channel));
    }
}

/// The session runtime hub. Construct once and share behind an `Arc`.
pub struct Hub {
    registry: SessionRegistry,
    config: HubConfig,
    recorder: Arc<dyn EventRecorder>,
    counters: Counters,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self::with_recorder(config, Arc::new(NoopRecorder))
    }

    pub fn with_recorder(config: HubConfig, recorder: Arc<dyn EventRecorder>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            config,
            recorder,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    // --- internals ---

    async fn enter(&self, session_id: SessionId) -> Result<(Arc<SessionSlot>, SessionGuard), HubError> {
        let slot = self
            .registry
            .get(session_id)
            .await
            .ok_or(HubError::SessionNotFound(session_id))?;
        let state = slot.lock().await;
        if !state.active {
            return Err(HubError::SessionNotFound(session_id));
        }
        Ok((slot, state))
    }

    /// Release `state` and run the outbox in this session's delivery order.
    async fn commit(
        &self,
        slot: &SessionSlot,
        state: SessionGuard,
        outbox: Outbox,
    ) -> Vec<BroadcastReport> {
        if outbox.steps.is_empty() {
            return Vec::new();
        }
        let session_id = state.id;
        let turn = slot.delivery_turn().await;
        drop(state);
        let reports = self.flush(session_id, outbox);
        drop(turn);
        reports
    }

    fn flush(&self, session_id: SessionId, outbox: Outbox) -> Vec<BroadcastReport> {
        let mut reports = Vec::new();
        for step in outbox.steps {
            match step {
                Step::Deliver {
                    frame,
                    recipients,
                    excluded,
                } => {
                    let mut report = BroadcastReport::empty(frame.kind());
                    report.recipients = recipients.len();
                    for (participant_id, channel) in recipients {
                        match channel.push(frame.clone()) {
                            Ok(()) => report.delivered += 1,
                            Err(failure) => report.failures.push((participant_id, failure)),
                        }
                    }
                    self.counters
                        .delivered
                        .fetch_add(report.delivered as u64, Ordering::Relaxed);
                    self.counters
                        .dropped
                        .fetch_add(report.failures.len() as u64, Ordering::Relaxed);

                    if report.is_complete() {
                        log::debug!(
                            "Session {session_id}: {} to {} recipients ({excluded} excluded)",
                            report.event_type,
                            report.recipients
                        );
                    } else {
                        log::warn!(
                            "Session {session_id}: {} reached {}/{} recipients, failures {:?}",
                            report.event_type,
                            report.delivered,
                            report.recipients,
                            report.failures
                        );
                    }
                    reports.push(report);
                }
                Step::Close(channel) => {
                    channel.close();
                }
            }
        }
        reports
    }

    /// Report `error` to `reply_to` (if connected) and hand it back.
    async fn refuse(
        &self,
        slot: &SessionSlot,
        state: SessionGuard,
        reply_to: Option<ParticipantId>,
        error: HubError,
    ) -> HubError {
        log::warn!(
            "Session {}: refused request from {reply_to:?}: {error}",
            state.id
        );
        let mut outbox = Outbox::default();
        if let Some(channel) = reply_to.and_then(|pid| state.channel(pid)) {
            outbox.deliver(
                HubEvent::error(error.code(), error.to_string()),
                vec![(channel.participant_id(), channel)],
            );
        }
        self.commit(slot, state, outbox).await;
        error
    }

    fn audit(&self, session_id: SessionId, event: AuditEvent, user_id: Option<UserId>, details: Value) {
        self.recorder
            .record_event(AuditRecord::new(session_id, event, user_id, details));
    }

    /// Install a fresh channel for `participant_id`, replacing any live one.
    fn attach(
        &self,
        state: &mut SessionState,
        outbox: &mut Outbox,
        participant_id: ParticipantId,
        user_id: UserId,
        name: String,
        is_teacher: bool,
    ) -> ChannelReceiver {
        let (channel, receiver) =
            ClientChannel::new(state.id, participant_id, self.config.channel_capacity);
        if let Some(previous) = state.channels.insert(participant_id, channel) {
            log::info!(
                "Session {}: participant {participant_id} reconnected, retiring channel {}",
                state.id,
                previous.id()
            );
            outbox.deliver(
                HubEvent::Disconnected {
                    reason: REPLACED_REASON.to_string(),
                },
                vec![(participant_id, previous.clone())],
            );
            outbox.close(previous);
        }
        upsert_participant(state, participant_id, user_id, name, is_teacher);
        receiver
    }

    // --- connection lifecycle ---

    /// Start a session. Returns `true` if it did not exist yet.
    pub async fn open_session(&self, session_id: SessionId) -> bool {
        let (_, created) = self.registry.get_or_create(session_id).await;
        if created {
            log::info!("Session {session_id} opened");
            self.audit(session_id, AuditEvent::SessionCreated, None, Value::Null);
        }
        created
    }

    /// Register a channel for `participant_id` and return its receiving end.
    ///
    /// An existing roster entry keeps its mute and hand flags. A live
    /// channel for the same participant is closed with a `disconnected`
    /// notice. Callers that want the join broadcast and snapshot should
    /// use [`Hub::join`].
    pub async fn connect(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        user_id: UserId,
        name: impl Into<String>,
        is_teacher: bool,
    ) -> Result<ChannelReceiver, HubError> {
        let (slot, mut state) = self.enter(session_id).await?;
        let mut outbox = Outbox::default();
        let receiver = self.attach(
            &mut state,
            &mut outbox,
            participant_id,
            user_id,
            name.into(),
            is_teacher,
        );
        self.commit(&slot, state, outbox).await;
        log::info!(
            "Session {session_id}: participant {participant_id} connected on channel {}",
            receiver.id()
        );
        Ok(receiver)
    }

    /// Connect, announce the participant to everyone else, then send the
    /// joiner a full snapshot. The three steps are one ordered operation.
    pub async fn join(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        user_id: UserId,
        name: impl Into<String>,
        is_teacher: bool,
    ) -> Result<ChannelReceiver, HubError> {
        let name = name.into();
        let (slot, mut state) = self.enter(session_id).await?;
        let mut outbox = Outbox::default();
        let receiver = self.attach(
            &mut state,
            &mut outbox,
            participant_id,
            user_id,
            name.clone(),
            is_teacher,
        );

        let others = state.recipients(&HashSet::from([participant_id]));
        outbox.deliver_excluding(
            HubEvent::ParticipantJoined {
                participant_id,
                user_id,
                name: name.clone(),
                is_teacher,
            },
            others,
            1,
        );
        if let Some(channel) = state.channel(participant_id) {
            outbox.deliver(state.snapshot_event(), vec![(participant_id, channel)]);
        }
        let online = state.online_count();
        self.commit(&slot, state, outbox).await;

        log::info!("Session {session_id}: participant {participant_id} joined ({online} online)");
        self.audit(
            session_id,
            AuditEvent::ParticipantJoined,
            Some(user_id),
            json!({ "participant_id": participant_id, "name": name, "is_teacher": is_teacher }),
        );
        Ok(receiver)
    }

    /// Detach the participant's channel, keeping the roster entry.
    /// Returns `false` if nothing was connected.
    pub async fn disconnect(&self, session_id: SessionId, participant_id: ParticipantId) -> bool {
        let Ok((slot, mut state)) = self.enter(session_id).await else {
            log::debug!("Disconnect for unknown session {session_id}");
            return false;
        };
        let Some(channel) = state.channels.remove(&participant_id) else {
            return false;
        };
        let mut outbox = Outbox::default();
        outbox.close(channel);
        self.commit(&slot, state, outbox).await;
        log::info!("Session {session_id}: participant {participant_id} disconnected");
        true
    }

    /// Transport-side teardown of one connection.
    ///
    /// Only acts if `channel_id` is still the participant's current channel,
    /// so a replaced connection cannot tear down its successor. Announces
    /// `participant_left` to the rest of the session.
    pub async fn leave(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        channel_id: ChannelId,
    ) -> bool {
        let Ok((slot, mut state)) = self.enter(session_id).await else {
            return false;
        };
        if state.channels.get(&participant_id).map(ClientChannel::id) != Some(channel_id) {
            log::debug!(
                "Session {session_id}: stale leave from participant {participant_id} channel {channel_id}"
            );
            return false;
        }

        let mut outbox = Outbox::default();
        if let Some(channel) = state.channels.remove(&participant_id) {
            outbox.close(channel);
        }
        let user_id = state.participants.get(&participant_id).map(|p| p.user_id);
        let remaining = state.recipients(&HashSet::new());
        outbox.deliver(HubEvent::ParticipantLeft { participant_id }, remaining);
        self.commit(&slot, state, outbox).await;

        log::info!("Session {session_id}: participant {participant_id} left");
        self.audit(
            session_id,
            AuditEvent::ParticipantLeft,
            user_id,
            json!({ "participant_id": participant_id }),
        );
        true
    }

    /// Forced soft disconnect: notify, close, keep the roster entry.
    pub async fn disconnect_participant(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        reason: impl Into<String>,
    ) -> bool {
        let Ok((slot, mut state)) = self.enter(session_id).await else {
            return false;
        };
        let Some(channel) = state.channels.remove(&participant_id) else {
            log::warn!("Session {session_id}: participant {participant_id} is not connected");
            return false;
        };
        let reason = reason.into();
        let mut outbox = Outbox::default();
        outbox.deliver(
            HubEvent::Disconnected {
                reason: reason.clone(),
            },
            vec![(participant_id, channel.clone())],
        );
        outbox.close(channel);
        self.commit(&slot, state, outbox).await;
        log::info!("Session {session_id}: participant {participant_id} disconnected ({reason})");
        true
    }

    /// Permanently remove a participant. Teacher only.
    ///
    /// The target gets `kicked` and its channel is closed before the rest
    /// of the session sees `participant_kicked`.
    pub async fn kick(
        &self,
        actor: &Actor,
        session_id: SessionId,
        participant_id: ParticipantId,
        reason: Option<String>,
    ) -> Result<(), HubError> {
        let (slot, mut state) = match self.enter(session_id).await {
            Ok(entered) => entered,
            Err(e) => {
                log::warn!("Kick of participant {participant_id} ignored: {e}");
                return Ok(());
            }
        };
        if !actor.is_teacher() {
            return Err(self
                .refuse(&slot, state, actor.participant_id, HubError::PermissionDenied)
                .await);
        }

        let removed = state.participants.remove(&participant_id);
        let channel = state.channels.remove(&participant_id);
        if removed.is_none() && channel.is_none() {
            log::warn!("Session {session_id}: kick of unknown participant {participant_id}");
            return Ok(());
        }

        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| self.config.default_kick_reason.clone());
        let mut outbox = Outbox::default();
        if let Some(channel) = channel {
            outbox.deliver(
                HubEvent::Kicked {
                    reason: reason.clone(),
                },
                vec![(participant_id, channel.clone())],
            );
            outbox.close(channel);
        }
        let remaining = state.recipients(&HashSet::new());
        outbox.deliver(HubEvent::ParticipantKicked { participant_id }, remaining);
        self.commit(&slot, state, outbox).await;

        log::info!("Session {session_id}: participant {participant_id} kicked ({reason})");
        self.audit(
            session_id,
            AuditEvent::ParticipantKicked,
            actor.user_id,
            json!({
                "participant_id": participant_id,
                "kicked_user_id": removed.map(|p| p.user_id),
                "reason": reason,
            }),
        );
        Ok(())
    }

    /// End a session: `session_ended` to everyone, close every channel,
    /// drop the session from the registry. Returns `false` if it was not
    /// live.
    pub async fn close_session(&self, session_id: SessionId) -> bool {
        let Ok((slot, mut state)) = self.enter(session_id).await else {
            return false;
        };
        state.active = false;
        state.ended_at = Some(now_secs());
        let channels: Vec<(ParticipantId, ClientChannel)> = state.channels.drain().collect();
        // Still under the state lock: a racing connect either ran before
        // this point or will see the slot inactive.
        self.registry.remove_slot(session_id, &slot).await;

        let mut outbox = Outbox::default();
        outbox.deliver(HubEvent::SessionEnded, channels.clone());
        for (_, channel) in channels {
            outbox.close(channel);
        }
        let participants = state.participants.len();
        self.commit(&slot, state, outbox).await;

        log::info!("Session {session_id} closed ({participants} participants)");
        self.audit(
            session_id,
            AuditEvent::SessionEnded,
            None,
            json!({ "participants": participants }),
        );
        true
    }

    /// Teacher-initiated [`Hub::close_session`].
    pub async fn end_session(&self, actor: &Actor, session_id: SessionId) -> Result<bool, HubError> {
        if actor.is_teacher() {
            return Ok(self.close_session(session_id).await);
        }
        match self.enter(session_id).await {
            Ok((slot, state)) => Err(self
                .refuse(&slot, state, actor.participant_id, HubError::PermissionDenied)
                .await),
            Err(_) => Err(HubError::PermissionDenied),
        }
    }

    /// Add a roster entry without a connection. An already connected
    /// participant is left untouched and announced as already present.
    pub async fn add_participant(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        user_id: UserId,
        name: impl Into<String>,
        is_teacher: bool,
    ) -> Result<(), HubError> {
        let name = name.into();
        let (slot, mut state) = self.enter(session_id).await?;
        let mut outbox = Outbox::default();
        let everyone = state.recipients(&HashSet::new());

        if state.is_online(participant_id) {
            outbox.deliver(HubEvent::ParticipantAlreadyPresent { participant_id }, everyone);
            self.commit(&slot, state, outbox).await;
            return Ok(());
        }

        upsert_participant(&mut state, participant_id, user_id, name.clone(), is_teacher);
        outbox.deliver(
            HubEvent::ParticipantAdded {
                participant_id,
                user_id,
                name: name.clone(),
                is_teacher,
            },
            everyone,
        );
        self.commit(&slot, state, outbox).await;

        log::info!("Session {session_id}: participant {participant_id} added");
        self.audit(
            session_id,
            AuditEvent::ParticipantAdded,
            Some(user_id),
            json!({ "participant_id": participant_id, "name": name }),
        );
        Ok(())
    }

    // --- delivery ---

    /// Push `event` to every channel of the session except `exclude`.
    /// Unknown sessions yield an empty report.
    pub async fn broadcast(
        &self,
        session_id: SessionId,
        event: HubEvent,
        exclude: &HashSet<ParticipantId>,
    ) -> BroadcastReport {
        let event_type = event.kind();
        let Ok((slot, state)) = self.enter(session_id).await else {
            log::debug!("Broadcast of {event_type} to unknown session {session_id}");
            return BroadcastReport::empty(event_type);
        };
        let recipients = state.recipients(exclude);
        let excluded = state.online_count() - recipients.len();
        let mut outbox = Outbox::default();
        outbox.deliver_excluding(event, recipients, excluded);
        self.commit(&slot, state, outbox)
            .await
            .pop()
            .unwrap_or_else(|| BroadcastReport::empty(event_type))
    }

    /// Single non-blocking push to one channel.
    pub fn send_personal(&self, channel: &ClientChannel, event: HubEvent) -> Result<(), DeliveryFailure> {
        let frame = Frame::encode(event).map_err(|e| {
            log::error!("Dropping unencodable personal event: {e}");
            DeliveryFailure::Unencodable
        })?;
        let result = channel.push(frame);
        let counter = match result {
            Ok(()) => &self.counters.delivered,
            Err(_) => &self.counters.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Personal message addressed by participant, ordered with the
    /// session's other deliveries.
    pub async fn send_to(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        event: HubEvent,
    ) -> Result<(), DeliveryFailure> {
        let Ok((slot, state)) = self.enter(session_id).await else {
            return Err(DeliveryFailure::NotConnected);
        };
        let Some(channel) = state.channel(participant_id) else {
            return Err(DeliveryFailure::NotConnected);
        };
        let mut outbox = Outbox::default();
        outbox.deliver(event, vec![(participant_id, channel)]);
        let report = self.commit(&slot, state, outbox).await.pop();
        match report {
            Some(report) => report.failures.first().map_or(Ok(()), |(_, f)| Err(*f)),
            None => Err(DeliveryFailure::Unencodable),
        }
    }

    // --- participant actions ---

    /// Set a participant's mute flag. Allowed for the participant
    /// themself or for a teacher.
    pub async fn mute(
        &self,
        actor: &Actor,
        session_id: SessionId,
        participant_id: ParticipantId,
        muted: bool,
    ) -> Result<(), HubError> {
        let (slot, mut state) = match self.enter(session_id).await {
            Ok(entered) => entered,
            Err(e) => {
                log::warn!("Mute of participant {participant_id} ignored: {e}");
                return Ok(());
            }
        };
        if !actor.is_teacher() && !actor.acts_for(participant_id) {
            return Err(self
                .refuse(&slot, state, actor.participant_id, HubError::PermissionDenied)
                .await);
        }
        let Some(entry) = state.participants.get_mut(&participant_id) else {
            log::warn!("Session {session_id}: mute of unknown participant {participant_id}");
            return Ok(());
        };
        entry.is_muted = muted;

        let mut outbox = Outbox::default();
        outbox.deliver(
            HubEvent::ParticipantMuted {
                participant_id,
                is_muted: muted,
            },
            state.recipients(&HashSet::new()),
        );
        self.commit(&slot, state, outbox).await;

        let event = if muted {
            AuditEvent::ParticipantMuted
        } else {
            AuditEvent::ParticipantUnmuted
        };
        self.audit(
            session_id,
            event,
            actor.user_id,
            json!({ "participant_id": participant_id, "by": actor.participant_id }),
        );
        Ok(())
    }

    pub async fn raise_hand(&self, session_id: SessionId, participant_id: ParticipantId) -> bool {
        self.set_hand(session_id, participant_id, true).await
    }

    pub async fn lower_hand(&self, session_id: SessionId, participant_id: ParticipantId) -> bool {
        self.set_hand(session_id, participant_id, false).await
    }

    async fn set_hand(&self, session_id: SessionId, participant_id: ParticipantId, raised: bool) -> bool {
        let Ok((slot, mut state)) = self.enter(session_id).await else {
            log::warn!("Hand change for unknown session {session_id}");
            return false;
        };
        let Some(entry) = state.participants.get_mut(&participant_id) else {
            log::warn!("Session {session_id}: hand change for unknown participant {participant_id}");
            return false;
        };
        entry.raised_hand = raised;
        let user_id = entry.user_id;

        let (event, audit) = if raised {
            (HubEvent::HandRaised { participant_id }, AuditEvent::HandRaised)
        } else {
            (HubEvent::HandLowered { participant_id }, AuditEvent::HandLowered)
        };
        let mut outbox = Outbox::default();
        outbox.deliver(event, state.recipients(&HashSet::new()));
        self.commit(&slot, state, outbox).await;

        self.audit(
            session_id,
            audit,
            Some(user_id),
            json!({ "participant_id": participant_id }),
        );
        true
    }

    /// Broadcast a chat line to the whole session, sender included.
    pub async fn chat(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        text: &str,
    ) -> Result<(), HubError> {
        let (slot, state) = match self.enter(session_id).await {
            Ok(entered) => entered,
            Err(e) => {
                log::warn!("Chat from participant {participant_id} ignored: {e}");
                return Ok(());
            }
        };
        let text = text.trim();
        if text.is_empty() || text.chars().count() > MAX_CHAT_CHARS {
            let error = HubError::invalid(
                "text",
                format!("chat text must be 1 to {MAX_CHAT_CHARS} characters"),
            );
            return Err(self.refuse(&slot, state, Some(participant_id), error).await);
        }
        let Some(sender) = state.participants.get(&participant_id) else {
            log::warn!("Session {session_id}: chat from unknown participant {participant_id}");
            return Ok(());
        };
        let user_id = sender.user_id;
        let event = HubEvent::Chat {
            from: participant_id,
            sender_name: sender.name.clone(),
            text: text.to_string(),
        };

        let mut outbox = Outbox::default();
        outbox.deliver(event, state.recipients(&HashSet::new()));
        self.commit(&slot, state, outbox).await;

        self.audit(
            session_id,
            AuditEvent::ChatMessage,
            Some(user_id),
            json!({ "participant_id": participant_id, "text": text }),
        );
        Ok(())
    }

    /// Relay a WebRTC signaling payload to `to` only.
    pub async fn relay_signal(
        &self,
        session_id: SessionId,
        from: ParticipantId,
        to: ParticipantId,
        payload: Value,
    ) -> bool {
        let Ok((slot, state)) = self.enter(session_id).await else {
            return false;
        };
        let Some(channel) = state.channel(to) else {
            log::debug!("Session {session_id}: signal from {from} to offline participant {to}");
            return false;
        };
        let mut outbox = Outbox::default();
        outbox.deliver(HubEvent::WebrtcSignal { from, to, payload }, vec![(to, channel)]);
        self.commit(&slot, state, outbox)
            .await
            .first()
            .is_some_and(BroadcastReport::is_complete)
    }

    // --- playback ---

    pub async fn select_audio(
        &self,
        actor: &Actor,
        session_id: SessionId,
        audio_id: AudioId,
        title: Option<String>,
    ) -> Result<(), HubError> {
        self.transition(actor, session_id, AuditEvent::AudioSelected, |playback, _| {
            Ok(playback.select(audio_id, title))
        })
        .await
    }

    pub async fn play_audio(
        &self,
        actor: &Actor,
        session_id: SessionId,
        request: PlayRequest,
    ) -> Result<(), HubError> {
        self.transition(actor, session_id, AuditEvent::AudioPlay, |playback, limits| {
            playback.play(request, limits)
        })
        .await
    }

    pub async fn pause_audio(
        &self,
        actor: &Actor,
        session_id: SessionId,
        position: f64,
    ) -> Result<(), HubError> {
        self.transition(actor, session_id, AuditEvent::AudioPause, |playback, _| {
            playback.pause(position)
        })
        .await
    }

    pub async fn seek_audio(
        &self,
        actor: &Actor,
        session_id: SessionId,
        position: f64,
    ) -> Result<(), HubError> {
        self.transition(actor, session_id, AuditEvent::AudioSeek, |playback, _| {
            playback.seek(position)
        })
        .await
    }

    /// Teacher-only read-modify-broadcast of the playback state.
    async fn transition<F>(
        &self,
        actor: &Actor,
        session_id: SessionId,
        audit: AuditEvent,
        apply: F,
    ) -> Result<(), HubError>
    where
        F: FnOnce(&mut PlaybackState, &SpeedLimits) -> Result<HubEvent, HubError>,
    {
        let (slot, mut state) = self.enter(session_id).await.map_err(|e| {
            log::warn!("{} rejected: {e}", audit.as_str());
            e
        })?;
        if !actor.is_teacher() {
            return Err(self
                .refuse(&slot, state, actor.participant_id, HubError::PermissionDenied)
                .await);
        }
        let event = match apply(&mut state.playback, &self.config.speed_limits) {
            Ok(event) => event,
            Err(e) => return Err(self.refuse(&slot, state, actor.participant_id, e).await),
        };
        let details = serde_json::to_value(&event).unwrap_or(Value::Null);

        let mut outbox = Outbox::default();
        outbox.deliver(event, state.recipients(&HashSet::new()));
        self.commit(&slot, state, outbox).await;

        self.audit(session_id, audit, actor.user_id, details);
        Ok(())
    }

    // --- reads ---

    pub async fn snapshot(&self, session_id: SessionId) -> Option<SessionSnapshot> {
        let (_, state) = self.enter(session_id).await.ok()?;
        Some(state.snapshot())
    }

    pub async fn playback(&self, session_id: SessionId) -> Option<PlaybackState> {
        let (_, state) = self.enter(session_id).await.ok()?;
        Some(state.playback.clone())
    }

    pub async fn participant(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
    ) -> Option<Participant> {
        let (_, state) = self.enter(session_id).await.ok()?;
        state.participants.get(&participant_id).cloned()
    }

    pub async fn is_online(&self, session_id: SessionId, participant_id: ParticipantId) -> bool {
        match self.enter(session_id).await {
            Ok((_, state)) => state.is_online(participant_id),
            Err(_) => false,
        }
    }

    /// Online participants, sorted.
    pub async fn online(&self, session_id: SessionId) -> Vec<ParticipantId> {
        match self.enter(session_id).await {
            Ok((_, state)) => state.online(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn is_live(&self, session_id: SessionId) -> bool {
        self.enter(session_id).await.is_ok()
    }

    pub async fn stats(&self) -> HubStats {
        let slots = self.registry.slots().await;
        let mut online_channels = 0;
        for slot in &slots {
            online_channels += slot.lock().await.online_count();
        }
        HubStats {
            sessions: slots.len(),
            online_channels,
            frames_delivered: self.counters.delivered.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

fn upsert_participant(
    state: &mut SessionState,
    participant_id: ParticipantId,
    user_id: UserId,
    name: String,
    is_teacher: bool,
) {
    match state.participants.get_mut(&participant_id) {
        Some(existing) => {
            existing.user_id = user_id;
            existing.name = name;
            existing.is_teacher = is_teacher;
        }
        None => {
            state
                .participants
                .insert(participant_id, Participant::new(user_id, name, is_teacher));
        }
    }
}
