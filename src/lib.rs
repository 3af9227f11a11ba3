//! Real-time room session core: room credentials, relay signaling,
//! offer/answer per media leg, and a deduplicated participant roster.

pub mod config;
pub mod gateway;
pub mod lifecycle;
pub mod media;
pub mod negotiation;
pub mod roster;
pub mod signaling;

pub use config::SessionConfig;
pub use gateway::{GatewayError, HttpAuthority, Role, RoomAuthority, RoomCredential, SessionGateway};
pub use lifecycle::{LocalIdentity, SessionError, SessionLifecycle, SessionSnapshot, SessionState};
pub use media::{DescriptionOnlyEngine, MediaEngine, MediaStreamHandle, SessionDescription};
pub use negotiation::{NegotiationEngine, NegotiationError, NegotiationState};
pub use roster::{Participant, RosterManager, RosterUpdate};
pub use signaling::{SignalingSession, WsConnector};
