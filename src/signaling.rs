//! Client side of the relay's JSON signaling protocol

mod messages;
mod session;
mod transport;
mod types;

pub use messages::{
    ClientFrame, JoinAs, LeaveTarget, PeerRecord, PluginRequest, RelayEvent, RelayFrame, RequestKind,
    VIDEOROOM_PLUGIN, classify,
};
pub use session::SignalingSession;
pub use transport::{RELAY_SUBPROTOCOL, RelayChannel, RelayConnector, RelayRemote, WsConnector};
pub use types::{
    Direction, FeedId, HandleId, MediaHandle, OutboundMessage, RoomId, SessionId, SignalingError,
    TransactionId,
};
