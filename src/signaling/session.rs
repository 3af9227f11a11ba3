use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::messages::{
    ClientFrame, JoinAs, PluginRequest, RelayEvent, RelayFrame, RequestKind, VIDEOROOM_PLUGIN,
    classify,
};
use super::transport::{RelayChannel, RelayConnector};
use super::types::{
    Direction, HandleId, MediaHandle, SessionId, SignalingError, TransactionId,
};
use crate::config::SessionConfig;
use crate::media::SessionDescription;
use crate::negotiation::NegotiationState;

/// A connected relay session and the media handles opened on it.
///
/// Dropping the session destroys it on the relay.
#[derive(Debug)]
pub struct SignalingSession {
    id: SessionId,
    channel: Option<RelayChannel>,
    handles: HashMap<HandleId, MediaHandle>,
    pending: HashMap<TransactionId, PendingRequest>,
    backlog: VecDeque<RelayFrame>,
    keepalive: Interval,
    reply_timeout: Duration,
}

/// A plugin request still waiting for its reply
#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    handle: HandleId,
    kind: RequestKind,
    sent_at: Instant,
}

enum Wake {
    Frame(Option<String>),
    Keepalive,
}

impl SignalingSession {
    /// Dial the relay and create a session on it.
    pub async fn connect<C: RelayConnector>(
        connector: &C,
        config: &SessionConfig,
    ) -> Result<Self, SignalingError> {
        let mut channel = connector.connect(&config.relay_url).await?;

        let transaction = TransactionId::generate();
        channel.send(&ClientFrame::Create { transaction })?;

        let reply = tokio::time::timeout(
            config.connect_timeout,
            await_transaction(&mut channel, &transaction, None),
        )
        .await
        .map_err(|_| SignalingError::Timeout(RequestKind::Create))??;

        let id = match (reply.janus.as_str(), reply.data) {
            ("success", Some(data)) => SessionId(data.id),
            _ => return Err(rejection(RequestKind::Create, reply.error)),
        };
        info!("Relay session {} created", id);

        Ok(Self::from_channel(id, channel, config))
    }

    pub(crate) fn from_channel(id: SessionId, channel: RelayChannel, config: &SessionConfig) -> Self {
        let period = config.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            id,
            channel: Some(channel),
            handles: HashMap::new(),
            pending: HashMap::new(),
            backlog: VecDeque::new(),
            keepalive,
            reply_timeout: config.connect_timeout,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Attach a new leg and send its join request. The join confirmation
    /// (or the relay's offer, for a subscribe leg) arrives through
    /// [`next_event`](Self::next_event).
    pub async fn open_handle(
        &mut self,
        direction: Direction,
        join: JoinAs,
    ) -> Result<HandleId, SignalingError> {
        let transaction = TransactionId::generate();
        self.send(&ClientFrame::Attach {
            transaction,
            session_id: self.id,
            plugin: VIDEOROOM_PLUGIN,
        })?;

        let reply = self.await_reply(&transaction, RequestKind::Attach).await?;
        let id = match (reply.janus.as_str(), reply.data) {
            ("success", Some(data)) => HandleId(data.id),
            _ => return Err(rejection(RequestKind::Attach, reply.error)),
        };

        let feed = match &join {
            JoinAs::Subscriber { feed, .. } => Some(*feed),
            JoinAs::Publisher { .. } => None,
        };
        self.register_handle(MediaHandle::new(id, direction, feed));
        debug!("Handle {} attached ({:?})", id, direction);

        self.send_request(id, PluginRequest::Join(join), None)?;
        Ok(id)
    }

    pub(crate) fn register_handle(&mut self, handle: MediaHandle) {
        self.handles.insert(handle.id, handle);
    }

    /// Fire a plugin request on `handle`; its reply is correlated by
    /// transaction and surfaces as a [`RelayEvent`].
    pub fn send_request(
        &mut self,
        handle: HandleId,
        body: PluginRequest,
        jsep: Option<SessionDescription>,
    ) -> Result<TransactionId, SignalingError> {
        if !self.handles.contains_key(&handle) {
            return Err(SignalingError::UnknownHandle(handle));
        }

        let transaction = TransactionId::generate();
        let kind = body.kind();
        self.send(&ClientFrame::Message {
            transaction,
            session_id: self.id,
            handle_id: handle,
            body,
            jsep,
        })?;
        self.expire_pending();
        self.pending.insert(
            transaction,
            PendingRequest {
                handle,
                kind,
                sent_at: Instant::now(),
            },
        );
        Ok(transaction)
    }

    pub fn handle(&self, id: HandleId) -> Option<&MediaHandle> {
        self.handles.get(&id)
    }

    pub fn handle_mut(&mut self, id: HandleId) -> Option<&mut MediaHandle> {
        self.handles.get_mut(&id)
    }

    /// Requests sent but not yet answered
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Forget requests the relay left unanswered past the reply timeout. A
    /// reply that still shows up later is classified without its kind.
    fn expire_pending(&mut self) {
        let timeout = self.reply_timeout;
        let before = self.pending.len();
        self.pending.retain(|_, p| p.sent_at.elapsed() < timeout);
        let expired = before - self.pending.len();
        if expired > 0 {
            debug!("{} unanswered request(s) expired", expired);
        }
    }

    pub fn handles(&self) -> impl Iterator<Item = &MediaHandle> {
        self.handles.values()
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Next event from the relay, in arrival order. Sends keepalives while
    /// waiting. `None` means the channel is gone for good.
    pub async fn next_event(&mut self) -> Option<RelayEvent> {
        loop {
            let frame = match self.backlog.pop_front() {
                Some(frame) => frame,
                None => {
                    let wake = {
                        let channel = self.channel.as_mut()?;
                        tokio::select! {
                            text = channel.recv() => Wake::Frame(text),
                            _ = self.keepalive.tick() => Wake::Keepalive,
                        }
                    };

                    match wake {
                        Wake::Frame(Some(text)) => match serde_json::from_str::<RelayFrame>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("Dropping malformed relay frame: {}", e);
                                continue;
                            }
                        },
                        Wake::Frame(None) => {
                            warn!("Relay channel closed");
                            return None;
                        }
                        Wake::Keepalive => {
                            self.send_keepalive();
                            continue;
                        }
                    }
                }
            };

            if let Some(event) = self.absorb(frame) {
                return Some(event);
            }
        }
    }

    fn absorb(&mut self, frame: RelayFrame) -> Option<RelayEvent> {
        let request = match (&frame.transaction, frame.janus.as_str()) {
            (_, "ack") => return None,
            (Some(transaction), _) => self.pending.remove(transaction).map(|p| p.kind),
            (None, _) => None,
        };
        debug!("<- {} ({:?})", frame.janus, request);

        let event = classify(frame, request)?;
        if let RelayEvent::HandleClosed { handle, .. } = &event {
            if let Some(media) = self.handles.get_mut(handle) {
                media.state = NegotiationState::Closed;
            }
        }
        Some(event)
    }

    /// Detach one leg.
    pub fn close_handle(&mut self, id: HandleId) {
        if self.handles.remove(&id).is_none() {
            return;
        }
        self.pending.retain(|_, p| p.handle != id);
        let detach = ClientFrame::Detach {
            transaction: TransactionId::generate(),
            session_id: self.id,
            handle_id: id,
        };
        if let Err(e) = self.send(&detach) {
            debug!("Detach of handle {} not sent: {}", id, e);
        }
    }

    /// Detach every leg, destroy the relay session and close the channel.
    /// Safe to call repeatedly.
    pub fn destroy(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };

        for id in self.handles.keys() {
            let _ = channel.send(&ClientFrame::Detach {
                transaction: TransactionId::generate(),
                session_id: self.id,
                handle_id: *id,
            });
        }
        let _ = channel.send(&ClientFrame::Destroy {
            transaction: TransactionId::generate(),
            session_id: self.id,
        });
        channel.close();

        self.handles.clear();
        self.pending.clear();
        self.backlog.clear();
        info!("Relay session {} destroyed", self.id);
    }

    fn send(&self, frame: &ClientFrame) -> Result<(), SignalingError> {
        self.channel
            .as_ref()
            .ok_or(SignalingError::ChannelClosed)?
            .send(frame)
    }

    fn send_keepalive(&self) {
        let frame = ClientFrame::Keepalive {
            transaction: TransactionId::generate(),
            session_id: self.id,
        };
        if let Err(e) = self.send(&frame) {
            warn!("Keepalive not sent: {}", e);
        }
    }

    async fn await_reply(
        &mut self,
        transaction: &TransactionId,
        kind: RequestKind,
    ) -> Result<RelayFrame, SignalingError> {
        let timeout = self.reply_timeout;
        let channel = self.channel.as_mut().ok_or(SignalingError::ChannelClosed)?;
        tokio::time::timeout(
            timeout,
            await_transaction(channel, transaction, Some(&mut self.backlog)),
        )
        .await
        .map_err(|_| SignalingError::Timeout(kind))?
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Read frames until the final reply for `transaction`. Anything else is
/// parked in `backlog` (in order) or dropped when there is no backlog yet.
async fn await_transaction(
    channel: &mut RelayChannel,
    transaction: &TransactionId,
    mut backlog: Option<&mut VecDeque<RelayFrame>>,
) -> Result<RelayFrame, SignalingError> {
    loop {
        let text = channel.recv().await.ok_or(SignalingError::ChannelClosed)?;
        let frame: RelayFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed relay frame: {}", e);
                continue;
            }
        };

        if frame.transaction.as_ref() == Some(transaction) && frame.janus != "ack" {
            return Ok(frame);
        }
        match backlog.as_deref_mut() {
            Some(backlog) => backlog.push_back(frame),
            None => debug!("Ignoring {} before session setup", frame.janus),
        }
    }
}

fn rejection(
    request: RequestKind,
    fault: Option<super::messages::RelayFault>,
) -> SignalingError {
    let (code, reason) = fault
        .map(|f| (f.code, f.reason))
        .unwrap_or((0, "unexpected reply".to_string()));
    SignalingError::Rejected {
        request,
        code,
        reason,
    }
}
