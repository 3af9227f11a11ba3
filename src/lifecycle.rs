//! Session lifecycle: start/stop ordering and the single event loop that
//! owns the relay session, its legs, the roster and the poll timer.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::gateway::{GatewayError, Role, RoomAuthority, RoomCredential, SessionGateway};
use crate::media::{MediaEngine, MediaStreamHandle, SessionDescription};
use crate::negotiation::{NegotiationEngine, NegotiationState};
use crate::roster::{Participant, RosterManager, RosterSource, RosterUpdate};
use crate::signaling::{
    Direction, FeedId, HandleId, JoinAs, LeaveTarget, PeerRecord, PluginRequest, RelayConnector,
    RelayEvent, RequestKind, RoomId, SignalingError, SignalingSession,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
}

/// Errors `start()` reports to the caller. Everything after start is
/// logged, not returned.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] GatewayError),

    #[error("relay unreachable: {0}")]
    RelayUnreachable(#[source] SignalingError),

    #[error("could not join the room: {0}")]
    JoinFailed(#[source] SignalingError),

    #[error("session is {0:?}, stop it first")]
    InvalidState(SessionState),
}

/// The local participant, rendered apart from the roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalIdentity {
    pub id: Option<FeedId>,
    pub display: String,
    pub role: Role,
    pub room: RoomId,
}

/// Read-only view handed to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub local: Option<LocalIdentity>,
    pub roster: Vec<Participant>,
    pub local_stream: Option<MediaStreamHandle>,
    pub remote_stream: Option<MediaStreamHandle>,
    /// Why the last session ended on its own, if it did. Cleared by `start()`.
    pub failure: Option<String>,
}

impl SessionSnapshot {
    fn empty(state: SessionState, failure: Option<String>) -> Self {
        Self {
            state,
            local: None,
            roster: Vec::new(),
            local_stream: None,
            remote_stream: None,
            failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subscription {
    Opening,
    Open(HandleId),
}

/// Resources that exist only between a successful connect and `stop()`.
/// Dropping it releases all of them.
struct ActiveSession {
    credential: RoomCredential,
    signaling: SignalingSession,
    local_handle: Option<HandleId>,
    local_id: Option<FeedId>,
    subscriptions: HashMap<FeedId, Subscription>,
    roster: RosterManager,
    poll: Option<Interval>,
    local_stream: Option<MediaStreamHandle>,
    remote_stream: Option<MediaStreamHandle>,
}

impl ActiveSession {
    fn new(credential: RoomCredential, signaling: SignalingSession) -> Self {
        let roster = RosterManager::new(credential.display());
        Self {
            credential,
            signaling,
            local_handle: None,
            local_id: None,
            subscriptions: HashMap::new(),
            roster,
            poll: None,
            local_stream: None,
            remote_stream: None,
        }
    }

    fn identity(&self) -> LocalIdentity {
        LocalIdentity {
            id: self.local_id,
            display: self.credential.display().to_string(),
            role: self.credential.role(),
            room: self.credential.room(),
        }
    }

    fn start_polling(&mut self, period: Duration) {
        if self.poll.is_some() {
            return;
        }
        let mut poll = tokio::time::interval_at(Instant::now() + period, period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.poll = Some(poll);
        info!("Participant polling every {:?}", period);
    }

    fn subscription_for(&self, handle: HandleId) -> Option<FeedId> {
        self.subscriptions.iter().find_map(|(feed, sub)| match sub {
            Subscription::Open(h) if *h == handle => Some(*feed),
            _ => None,
        })
    }
}

enum Wake {
    Relay(Option<RelayEvent>),
    Poll,
}

/// One room session from credential request to teardown.
///
/// Everything runs on the caller's task: `start()`, then `drive()` in a
/// loop until it returns `false`, with `stop()` at any point.
pub struct SessionLifecycle<A, C, M> {
    config: SessionConfig,
    gateway: SessionGateway<A>,
    connector: C,
    negotiation: NegotiationEngine<M>,
    state: SessionState,
    active: Option<ActiveSession>,
    failure: Option<String>,
    updates: watch::Sender<SessionSnapshot>,
}

impl<A, C, M> SessionLifecycle<A, C, M>
where
    A: RoomAuthority,
    C: RelayConnector,
    M: MediaEngine,
{
    pub fn new(config: SessionConfig, authority: A, connector: C, media: M) -> Self {
        let (updates, _) = watch::channel(SessionSnapshot::empty(SessionState::Idle, None));
        Self {
            config,
            gateway: SessionGateway::new(authority),
            connector,
            negotiation: NegotiationEngine::new(media),
            state: SessionState::Idle,
            active: None,
            failure: None,
            updates,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Receiver that sees a fresh snapshot after every change
    pub fn updates(&self) -> watch::Receiver<SessionSnapshot> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        match &self.active {
            Some(active) => SessionSnapshot {
                state: self.state,
                local: Some(active.identity()),
                roster: active.roster.participants().to_vec(),
                local_stream: active.local_stream,
                remote_stream: active.remote_stream,
                failure: self.failure.clone(),
            },
            None => SessionSnapshot::empty(self.state, self.failure.clone()),
        }
    }

    pub fn roster(&self) -> &[Participant] {
        self.active
            .as_ref()
            .map(|active| active.roster.participants())
            .unwrap_or(&[])
    }

    pub fn open_handles(&self) -> usize {
        self.active
            .as_ref()
            .map(|active| active.signaling.open_handles())
            .unwrap_or(0)
    }

    pub fn negotiation(&self) -> &NegotiationEngine<M> {
        &self.negotiation
    }

    /// Request a room, connect to the relay and join. A host joins as
    /// publisher; a guest joins for presence and subscribes once the host's
    /// feed shows up.
    pub async fn start(&mut self, role: Role) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState(self.state));
        }
        self.failure = None;
        self.set_state(SessionState::Starting);

        let credential = match self.gateway.request_room(role).await {
            Ok(credential) => credential,
            Err(e) => {
                warn!("Room request failed: {}", e);
                self.set_state(SessionState::Idle);
                return Err(e.into());
            }
        };

        let signaling = match SignalingSession::connect(&self.connector, &self.config).await {
            Ok(signaling) => signaling,
            Err(e) => {
                warn!("Relay connect failed: {}", e);
                self.set_state(SessionState::Idle);
                return Err(SessionError::RelayUnreachable(e));
            }
        };

        let direction = match role {
            Role::Host => Direction::Publish,
            Role::Guest => Direction::Presence,
        };
        let join = JoinAs::Publisher {
            room: credential.room(),
            display: credential.display().to_string(),
        };
        let active = self.active.insert(ActiveSession::new(credential, signaling));

        match active.signaling.open_handle(direction, join).await {
            Ok(handle) => {
                active.local_handle = Some(handle);
                self.set_state(SessionState::Active);
                Ok(())
            }
            Err(e) => {
                warn!("Join failed: {}", e);
                self.stop();
                Err(SessionError::JoinFailed(e))
            }
        }
    }

    /// Tear everything down and return to IDLE. Safe from any state and
    /// safe to repeat.
    pub fn stop(&mut self) {
        if self.state == SessionState::Idle && self.active.is_none() {
            return;
        }
        self.set_state(SessionState::Stopping);

        if let Some(mut active) = self.active.take() {
            active.poll = None;
            let handles: Vec<HandleId> = active.signaling.handles().map(|h| h.id).collect();
            for handle in handles {
                self.negotiation.release(handle);
            }
            active.signaling.destroy();
            active.roster.clear();
        }

        self.set_state(SessionState::Idle);
    }

    /// Wait for the next relay event or poll tick and apply it. Returns
    /// `false` once the session is idle.
    pub async fn drive(&mut self) -> bool {
        let wake = {
            let Some(active) = self.active.as_mut() else {
                return false;
            };
            let ActiveSession { signaling, poll, .. } = active;
            tokio::select! {
                event = signaling.next_event() => Wake::Relay(event),
                _ = next_tick(poll) => Wake::Poll,
            }
        };

        match wake {
            Wake::Relay(Some(event)) => self.dispatch(event).await,
            Wake::Relay(None) => {
                warn!("Relay channel lost, stopping session");
                self.failure = Some("relay connection lost".to_string());
                self.stop();
            }
            Wake::Poll => self.poll_participants(),
        }

        self.publish();
        self.state != SessionState::Idle
    }

    /// Open a subscribe leg for `feed` unless one is already open or
    /// opening. Returns whether a new leg was opened.
    pub async fn subscribe(&mut self, feed: FeedId) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if active.subscriptions.contains_key(&feed) {
            debug!("Already subscribed to feed {}", feed);
            return false;
        }

        active.subscriptions.insert(feed, Subscription::Opening);
        let join = JoinAs::Subscriber {
            room: active.credential.room(),
            feed,
        };
        match active.signaling.open_handle(Direction::Subscribe, join).await {
            Ok(handle) => {
                active.subscriptions.insert(feed, Subscription::Open(handle));
                info!("Subscribed to feed {} on handle {}", feed, handle);
                true
            }
            Err(e) => {
                active.subscriptions.remove(&feed);
                warn!("Subscribing to feed {} failed: {}", feed, e);
                false
            }
        }
    }

    async fn dispatch(&mut self, event: RelayEvent) {
        if !matches!(self.state, SessionState::Starting | SessionState::Active) {
            debug!("Dropping relay event in {:?}", self.state);
            return;
        }

        match event {
            RelayEvent::Joined {
                handle,
                id,
                publishers,
                ..
            } => self.on_joined(handle, id, publishers).await,
            RelayEvent::Publishers { publishers, .. } => {
                self.ingest(RosterSource::Push, publishers.clone());
                self.discover_host(&publishers).await;
            }
            RelayEvent::Participants { participants, .. } => {
                self.ingest(RosterSource::Poll, participants)
            }
            RelayEvent::Leaving { target, .. } | RelayEvent::Unpublished { target, .. } => {
                self.on_departure(target)
            }
            RelayEvent::Offer { handle, offer, .. } => self.on_offer(handle, &offer),
            RelayEvent::Answer { handle, answer } => self.on_answer(handle, &answer),
            RelayEvent::Started { handle } => debug!("Handle {} started", handle),
            RelayEvent::RequestFailed {
                handle,
                request,
                code,
                reason,
            } => self.on_request_failed(handle, request, code, &reason),
            RelayEvent::HandleClosed { handle, reason } => {
                info!("Handle {} closed by relay: {}", handle, reason);
                self.drop_leg(handle, format!("relay closed the room handle: {}", reason));
            }
            RelayEvent::SessionLost { reason } => {
                warn!("Relay session lost: {}", reason);
                self.failure = Some(reason);
                self.stop();
            }
        }
    }

    async fn on_joined(&mut self, handle: HandleId, id: FeedId, publishers: Vec<PeerRecord>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.local_handle != Some(handle) {
            debug!("Join confirmation for handle {} ignored", handle);
            return;
        }

        active.local_id = Some(id);
        active.roster.set_local_id(id);
        info!("Joined room {} as feed {}", active.credential.room(), id);
        self.ingest(RosterSource::Push, publishers.clone());

        let Some(active) = self.active.as_mut() else {
            return;
        };
        match active.credential.role() {
            Role::Host => {
                if let Ok(NegotiationState::Established) =
                    self.negotiation.publish(&mut active.signaling, handle)
                {
                    active.local_stream = Some(MediaStreamHandle {
                        handle,
                        feed: Some(id),
                        direction: Direction::Publish,
                    });
                    active.start_polling(self.config.poll_interval);
                }
            }
            Role::Guest => self.discover_host(&publishers).await,
        }
    }

    /// Guests look for the host marker among announced publishers.
    async fn discover_host(&mut self, peers: &[PeerRecord]) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if active.credential.role() != Role::Guest {
            return;
        }
        let marker = self.config.host_marker.as_str();
        let host = peers
            .iter()
            .find(|peer| peer.display.as_deref() == Some(marker));
        if let Some(host) = host {
            self.subscribe(host.id).await;
        }
    }

    fn ingest(&mut self, source: RosterSource, peers: Vec<PeerRecord>) {
        if let Some(active) = self.active.as_mut() {
            active.roster.merge(RosterUpdate::Upsert { source, peers });
        }
    }

    fn on_departure(&mut self, target: LeaveTarget) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.roster.merge(RosterUpdate::Remove(target.clone()));

        if let LeaveTarget::Feed(feed) = target {
            if let Some(Subscription::Open(handle)) = active.subscriptions.get(&feed).copied() {
                info!("Feed {} went away, closing handle {}", feed, handle);
                self.negotiation.close(&mut active.signaling, handle);
                active.signaling.close_handle(handle);
                active.subscriptions.remove(&feed);
                if active.remote_stream.is_some_and(|s| s.handle == handle) {
                    active.remote_stream = None;
                }
            }
        }
    }

    fn on_offer(&mut self, handle: HandleId, offer: &SessionDescription) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let room = active.credential.room();
        if let Ok(NegotiationState::Established) =
            self.negotiation
                .answer_offer(&mut active.signaling, handle, offer, room)
        {
            active.remote_stream = Some(MediaStreamHandle {
                handle,
                feed: active.subscription_for(handle),
                direction: Direction::Subscribe,
            });
        }
    }

    fn on_answer(&mut self, handle: HandleId, answer: &SessionDescription) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if self
            .negotiation
            .accept_answer(&mut active.signaling, handle, answer)
            .is_err()
        {
            self.drop_leg(handle, "publish negotiation failed".to_string());
        }
    }

    fn on_request_failed(&mut self, handle: Option<HandleId>, request: RequestKind, code: u16, reason: &str) {
        if request == RequestKind::ListParticipants {
            warn!("Participant poll failed ({}): {}; keeping last roster", code, reason);
            return;
        }
        warn!("Relay rejected {} ({}): {}", request, code, reason);
        if let Some(handle) = handle {
            if let Some(active) = self.active.as_mut() {
                self.negotiation.close(&mut active.signaling, handle);
            }
            self.drop_leg(handle, format!("{} rejected by relay ({}): {}", request, code, reason));
        }
    }

    /// Detach a leg that can no longer carry media. Other legs stay up, but
    /// losing the local handle means losing the room, so the session stops
    /// and `why` is kept in the snapshot.
    fn drop_leg(&mut self, handle: HandleId, why: String) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        self.negotiation.release(handle);
        active.signaling.close_handle(handle);

        if active.local_handle == Some(handle) {
            warn!("Local handle {} lost ({}), stopping session", handle, why);
            self.failure = Some(why);
            self.stop();
            return;
        }

        if let Some(feed) = active.subscription_for(handle) {
            active.subscriptions.remove(&feed);
        }
        if active.local_stream.is_some_and(|s| s.handle == handle) {
            active.local_stream = None;
        }
        if active.remote_stream.is_some_and(|s| s.handle == handle) {
            active.remote_stream = None;
        }
    }

    fn poll_participants(&mut self) {
        if self.state != SessionState::Active {
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let Some(handle) = active.local_handle else {
            return;
        };
        let room = active.credential.room();
        if let Err(e) = active
            .signaling
            .send_request(handle, PluginRequest::ListParticipants { room }, None)
        {
            warn!("Participant poll not sent: {}", e);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!("Session {:?} -> {:?}", self.state, state);
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        self.updates.send_replace(self.snapshot());
    }
}

async fn next_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(poll) => {
            poll.tick().await;
        }
        None => std::future::pending().await,
    }
}
