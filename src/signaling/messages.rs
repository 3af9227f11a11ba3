use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::{FeedId, HandleId, RoomId, SessionId, TransactionId};
use crate::media::{SdpKind, SessionDescription};

pub const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";

/// Frames sent from client to relay
#[derive(Debug, Serialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Open a relay session
    Create { transaction: TransactionId },

    /// Attach a plugin handle (one media leg)
    Attach {
        transaction: TransactionId,
        session_id: SessionId,
        plugin: &'static str,
    },

    /// Plugin request on a handle, optionally carrying a session description
    Message {
        transaction: TransactionId,
        session_id: SessionId,
        handle_id: HandleId,
        body: PluginRequest,
        #[serde(skip_serializing_if = "Option::is_none")]
        jsep: Option<SessionDescription>,
    },

    Keepalive {
        transaction: TransactionId,
        session_id: SessionId,
    },

    Detach {
        transaction: TransactionId,
        session_id: SessionId,
        handle_id: HandleId,
    },

    Destroy {
        transaction: TransactionId,
        session_id: SessionId,
    },
}

/// Video-room requests carried in a `message` body
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum PluginRequest {
    Join(JoinAs),
    Configure { audio: bool, video: bool },
    ListParticipants { room: RoomId },
    Start { room: RoomId },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "ptype", rename_all = "lowercase")]
pub enum JoinAs {
    Publisher { room: RoomId, display: String },
    Subscriber { room: RoomId, feed: FeedId },
}

impl PluginRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            PluginRequest::Join(_) => RequestKind::Join,
            PluginRequest::Configure { .. } => RequestKind::Configure,
            PluginRequest::ListParticipants { .. } => RequestKind::ListParticipants,
            PluginRequest::Start { .. } => RequestKind::Start,
        }
    }
}

/// Which request a reply answers, recovered from its transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Create,
    Attach,
    Join,
    Configure,
    ListParticipants,
    Start,
    Unknown,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::Create => "create",
            RequestKind::Attach => "attach",
            RequestKind::Join => "join",
            RequestKind::Configure => "configure",
            RequestKind::ListParticipants => "listparticipants",
            RequestKind::Start => "start",
            RequestKind::Unknown => "request",
        };
        f.write_str(name)
    }
}

/// Loosely-typed relay frame; only [`classify`] looks inside it.
#[derive(Debug, Deserialize)]
pub struct RelayFrame {
    pub janus: String,
    pub transaction: Option<TransactionId>,
    pub sender: Option<HandleId>,
    pub data: Option<CreatedData>,
    pub plugindata: Option<PluginData>,
    pub jsep: Option<SessionDescription>,
    pub error: Option<RelayFault>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreatedData {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub struct RelayFault {
    pub code: u16,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct PluginData {
    #[serde(default)]
    pub plugin: String,
    pub data: RoomData,
}

#[derive(Debug, Default, Deserialize)]
pub struct RoomData {
    pub videoroom: Option<String>,
    pub room: Option<RoomId>,
    pub id: Option<FeedId>,
    pub publishers: Option<Vec<PeerRecord>>,
    pub participants: Option<Vec<PeerRecord>>,
    pub leaving: Option<LeaveTarget>,
    pub unpublished: Option<LeaveTarget>,
    pub started: Option<String>,
    pub error_code: Option<u16>,
    pub error: Option<String>,
}

/// One id/display pair as listed by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: FeedId,
    #[serde(default)]
    pub display: Option<String>,
}

impl PeerRecord {
    pub fn new(id: u64, display: &str) -> Self {
        Self {
            id: FeedId(id),
            display: Some(display.to_string()),
        }
    }
}

/// Value of a `leaving`/`unpublished` notice: a feed id, or the bare
/// acknowledgement the relay sends back to whoever left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LeaveTarget {
    Feed(FeedId),
    Ack(String),
}

/// Everything the session core reacts to, one variant per signal.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Our join on `handle` was confirmed; `id` is our own feed id
    Joined {
        handle: HandleId,
        room: Option<RoomId>,
        id: FeedId,
        publishers: Vec<PeerRecord>,
    },
    /// Publishers announced after our join
    Publishers {
        handle: HandleId,
        publishers: Vec<PeerRecord>,
    },
    /// Reply to a participant listing
    Participants {
        handle: HandleId,
        participants: Vec<PeerRecord>,
    },
    Leaving {
        handle: HandleId,
        target: LeaveTarget,
    },
    Unpublished {
        handle: HandleId,
        target: LeaveTarget,
    },
    /// Relay offer for a subscribe leg (initial or renegotiation)
    Offer {
        handle: HandleId,
        feed: Option<FeedId>,
        offer: SessionDescription,
    },
    /// Relay answer to our publish offer
    Answer {
        handle: HandleId,
        answer: SessionDescription,
    },
    Started {
        handle: HandleId,
    },
    RequestFailed {
        handle: Option<HandleId>,
        request: RequestKind,
        code: u16,
        reason: String,
    },
    HandleClosed {
        handle: HandleId,
        reason: String,
    },
    SessionLost {
        reason: String,
    },
}

/// Turn one relay frame into a typed event. `request` is the kind of the
/// request the frame's transaction answers, when known. Returns `None` for
/// frames with nothing to act on (acks, media notifications).
pub fn classify(frame: RelayFrame, request: Option<RequestKind>) -> Option<RelayEvent> {
    let request = request.unwrap_or(RequestKind::Unknown);

    match frame.janus.as_str() {
        "error" => {
            let fault = frame.error.unwrap_or(RelayFault {
                code: 0,
                reason: String::new(),
            });
            Some(RelayEvent::RequestFailed {
                handle: frame.sender,
                request,
                code: fault.code,
                reason: fault.reason,
            })
        }
        "hangup" | "detached" => Some(RelayEvent::HandleClosed {
            handle: frame.sender?,
            reason: frame.reason.unwrap_or_else(|| frame.janus.clone()),
        }),
        "timeout" => Some(RelayEvent::SessionLost {
            reason: "relay session timed out".to_string(),
        }),
        "success" | "event" => {
            let plugindata = frame.plugindata?;
            classify_room(frame.sender?, plugindata.data, frame.jsep, request)
        }
        _ => None,
    }
}

fn classify_room(
    handle: HandleId,
    data: RoomData,
    jsep: Option<SessionDescription>,
    request: RequestKind,
) -> Option<RelayEvent> {
    if let Some(code) = data.error_code {
        return Some(RelayEvent::RequestFailed {
            handle: Some(handle),
            request,
            code,
            reason: data.error.unwrap_or_default(),
        });
    }

    match data.videoroom.as_deref()? {
        "joined" => Some(RelayEvent::Joined {
            handle,
            room: data.room,
            id: data.id?,
            publishers: data.publishers.unwrap_or_default(),
        }),
        "participants" => Some(RelayEvent::Participants {
            handle,
            participants: data.participants.unwrap_or_default(),
        }),
        "attached" => match jsep {
            Some(offer) if offer.kind == SdpKind::Offer => Some(RelayEvent::Offer {
                handle,
                feed: data.id,
                offer,
            }),
            _ => None,
        },
        "destroyed" => Some(RelayEvent::SessionLost {
            reason: "room destroyed".to_string(),
        }),
        "event" => {
            if let Some(description) = jsep {
                return Some(match description.kind {
                    SdpKind::Answer => RelayEvent::Answer {
                        handle,
                        answer: description,
                    },
                    SdpKind::Offer => RelayEvent::Offer {
                        handle,
                        feed: data.id,
                        offer: description,
                    },
                });
            }
            if let Some(publishers) = data.publishers {
                Some(RelayEvent::Publishers { handle, publishers })
            } else if let Some(target) = data.leaving {
                Some(RelayEvent::Leaving { handle, target })
            } else if let Some(target) = data.unpublished {
                Some(RelayEvent::Unpublished { handle, target })
            } else if data.started.is_some() {
                Some(RelayEvent::Started { handle })
            } else {
                None
            }
        }
        _ => None,
    }
}
