use std::fmt;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Utf8Bytes;

use super::messages::RequestKind;
use crate::negotiation::NegotiationState;

/// Signaling errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("relay unreachable: {0}")]
    Unreachable(String),

    #[error("relay rejected {request}: {reason} ({code})")]
    Rejected {
        request: RequestKind,
        code: u16,
        reason: String,
    },

    #[error("no reply to {0} in time")]
    Timeout(RequestKind),

    #[error("signaling channel closed")]
    ChannelClosed,

    #[error("unknown handle: {0}")]
    UnknownHandle(HandleId),

    #[error("frame encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

macro_rules! relay_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

relay_id!(
    /// Relay session id, assigned by `create`
    SessionId
);
relay_id!(
    /// One attached plugin handle (a media leg)
    HandleId
);
relay_id!(
    /// Relay-assigned participant/feed id, the only roster identity
    FeedId
);
relay_id!(
    /// Numeric room issued by the backend authority
    RoomId
);

const TRANSACTION_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const TRANSACTION_LEN: usize = 12;

/// Transaction id: 12-byte fixed array correlating a request with its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId {
    bytes: [u8; TRANSACTION_LEN],
    len: u8,
}

impl TransactionId {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; TRANSACTION_LEN];
        for byte in &mut bytes {
            *byte = TRANSACTION_CHARS[rng.random_range(0..TRANSACTION_CHARS.len())];
        }
        Self {
            bytes,
            len: TRANSACTION_LEN as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        let mut bytes = [0u8; TRANSACTION_LEN];
        let src = s.as_bytes();
        let len = src.len().min(TRANSACTION_LEN);
        bytes[..len].copy_from_slice(&src[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }
}

impl Serialize for TransactionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TransactionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(TransactionId::from(s.as_str()))
    }
}

/// What a media leg carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Outbound audio+video of the host
    Publish,
    /// Inbound copy of one remote feed
    Subscribe,
    /// Room membership without media; how a guest hears about publishers
    Presence,
}

/// One logical media leg on the relay, owned by the signaling session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub id: HandleId,
    pub direction: Direction,
    pub feed: Option<FeedId>,
    pub state: NegotiationState,
}

impl MediaHandle {
    pub fn new(id: HandleId, direction: Direction, feed: Option<FeedId>) -> Self {
        Self {
            id,
            direction,
            feed,
            state: NegotiationState::Idle,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }
}

/// Wrapper for outbound WebSocket frames using tungstenite's Utf8Bytes.
#[derive(Debug, Clone)]
pub struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    /// Get the inner Utf8Bytes for tungstenite Message::Text
    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_generate_has_correct_length() {
        let transaction = TransactionId::generate();
        assert_eq!(transaction.as_str().len(), 12);
        assert!(transaction.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn transactions_are_distinct() {
        assert_ne!(TransactionId::generate(), TransactionId::generate());
    }

    #[test]
    fn transaction_round_trips_through_json() {
        let transaction = TransactionId::from("abcDEF123456");
        let json = serde_json::to_string(&transaction).unwrap();
        assert_eq!(json, "\"abcDEF123456\"");
        let back: TransactionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, transaction);
    }

    #[test]
    fn ids_serialize_as_plain_numbers() {
        assert_eq!(serde_json::to_string(&FeedId(7)).unwrap(), "7");
        let room: RoomId = serde_json::from_str("1234").unwrap();
        assert_eq!(room, RoomId(1234));
        assert_eq!(format!("{}", HandleId(99)), "99");
    }

    #[test]
    fn new_handle_starts_idle() {
        let handle = MediaHandle::new(HandleId(3), Direction::Subscribe, Some(FeedId(5)));
        assert_eq!(handle.state, NegotiationState::Idle);
        assert!(!handle.is_closed());
    }
}
