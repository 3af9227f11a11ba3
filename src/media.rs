//! The media capability behind each leg. The session core only drives
//! offer/answer through it; actual capture and transport live elsewhere.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signaling::{Direction, FeedId, HandleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as carried in `jsep`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendOnly,
    RecvOnly,
}

impl MediaDirection {
    fn attribute(self) -> &'static str {
        match self {
            MediaDirection::SendOnly => "a=sendonly",
            MediaDirection::RecvOnly => "a=recvonly",
        }
    }
}

/// What a leg asks the media capability for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaIntent {
    pub audio: bool,
    pub video: bool,
    pub direction: MediaDirection,
}

impl MediaIntent {
    /// Outbound audio+video, nothing inbound
    pub const PUBLISH: Self = Self {
        audio: true,
        video: true,
        direction: MediaDirection::SendOnly,
    };

    /// Receive whatever the relay offers, send nothing
    pub const SUBSCRIBE: Self = Self {
        audio: true,
        video: true,
        direction: MediaDirection::RecvOnly,
    };
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("expected {expected:?} description, got {actual:?}")]
    UnexpectedKind { expected: SdpKind, actual: SdpKind },

    #[error("description has no media sections")]
    NoMedia,

    #[error("no local offer on handle {0}")]
    NoLocalOffer(HandleId),
}

/// Opaque media capability: creates and applies descriptions per handle.
pub trait MediaEngine {
    fn create_offer(
        &mut self,
        handle: HandleId,
        intent: MediaIntent,
    ) -> Result<SessionDescription, MediaError>;

    fn create_answer(
        &mut self,
        handle: HandleId,
        offer: &SessionDescription,
        intent: MediaIntent,
    ) -> Result<SessionDescription, MediaError>;

    fn apply_local(&mut self, handle: HandleId, description: &SessionDescription) -> Result<(), MediaError>;

    fn apply_remote(&mut self, handle: HandleId, description: &SessionDescription)
    -> Result<(), MediaError>;

    /// Forget everything about `handle`
    fn release(&mut self, handle: HandleId);
}

/// Media stream handed to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MediaStreamHandle {
    pub handle: HandleId,
    pub feed: Option<FeedId>,
    pub direction: Direction,
}

#[derive(Debug, Default)]
struct Leg {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
}

/// Signaling-only engine: writes well-formed descriptions with the right
/// directions but never opens a socket. Good for headless monitors.
#[derive(Debug, Default)]
pub struct DescriptionOnlyEngine {
    legs: HashMap<HandleId, Leg>,
}

impl DescriptionOnlyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_description(&self, handle: HandleId) -> Option<&SessionDescription> {
        self.legs.get(&handle).and_then(|leg| leg.local.as_ref())
    }

    pub fn remote_description(&self, handle: HandleId) -> Option<&SessionDescription> {
        self.legs.get(&handle).and_then(|leg| leg.remote.as_ref())
    }

    pub fn active_legs(&self) -> usize {
        self.legs.len()
    }
}

fn session_header() -> String {
    let origin: u64 = rand::rng().random_range(1..u64::from(u32::MAX));
    format!("v=0\r\no=- {origin} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n")
}

fn media_section(kind: &str, mid: usize, direction: MediaDirection) -> String {
    let codec = match kind {
        "audio" => "111\r\na=rtpmap:111 opus/48000/2",
        _ => "96\r\na=rtpmap:96 VP8/90000",
    };
    format!(
        "m={kind} 9 UDP/TLS/RTP/SAVPF {codec}\r\nc=IN IP4 0.0.0.0\r\na=mid:{mid}\r\n{}\r\n",
        direction.attribute()
    )
}

impl MediaEngine for DescriptionOnlyEngine {
    fn create_offer(
        &mut self,
        _handle: HandleId,
        intent: MediaIntent,
    ) -> Result<SessionDescription, MediaError> {
        let mut sdp = session_header();
        let kinds = [("audio", intent.audio), ("video", intent.video)];
        let mut mid = 0;
        for (kind, wanted) in kinds {
            if wanted {
                sdp.push_str(&media_section(kind, mid, intent.direction));
                mid += 1;
            }
        }
        if mid == 0 {
            return Err(MediaError::NoMedia);
        }
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp,
        })
    }

    fn create_answer(
        &mut self,
        _handle: HandleId,
        offer: &SessionDescription,
        intent: MediaIntent,
    ) -> Result<SessionDescription, MediaError> {
        if offer.kind != SdpKind::Offer {
            return Err(MediaError::UnexpectedKind {
                expected: SdpKind::Offer,
                actual: offer.kind,
            });
        }

        let mut sdp = session_header();
        let offered = offer
            .sdp
            .lines()
            .filter_map(|line| line.strip_prefix("m="))
            .filter_map(|media| media.split_whitespace().next());
        let mut mid = 0;
        for kind in offered {
            sdp.push_str(&media_section(kind, mid, intent.direction));
            mid += 1;
        }
        if mid == 0 {
            return Err(MediaError::NoMedia);
        }
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp,
        })
    }

    fn apply_local(&mut self, handle: HandleId, description: &SessionDescription) -> Result<(), MediaError> {
        self.legs.entry(handle).or_default().local = Some(description.clone());
        Ok(())
    }

    fn apply_remote(
        &mut self,
        handle: HandleId,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        let leg = self.legs.entry(handle).or_default();
        if description.kind == SdpKind::Answer {
            match &leg.local {
                Some(local) if local.kind == SdpKind::Offer => {}
                _ => return Err(MediaError::NoLocalOffer(handle)),
            }
        }
        if !description.sdp.contains("m=") {
            return Err(MediaError::NoMedia);
        }
        leg.remote = Some(description.clone());
        Ok(())
    }

    fn release(&mut self, handle: HandleId) {
        self.legs.remove(&handle);
    }
}
