//! Offer/answer state machine, one instance of state per media handle.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::media::{MediaEngine, MediaError, MediaIntent, SessionDescription};
use crate::signaling::{Direction, HandleId, PluginRequest, RoomId, SignalingError, SignalingSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferPending,
    AnswerPending,
    Established,
    Closed,
}

impl NegotiationState {
    pub fn can_transition(self, to: NegotiationState) -> bool {
        use NegotiationState::*;
        matches!(
            (self, to),
            (_, Closed)
                | (Idle, OfferPending)
                | (OfferPending, AnswerPending)
                | (OfferPending, Established)
                | (AnswerPending, Established)
                | (Established, OfferPending)
        )
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("handle {handle}: {from:?} -> {to:?} not allowed")]
    InvalidTransition {
        handle: HandleId,
        from: NegotiationState,
        to: NegotiationState,
    },

    #[error("handle {handle} is a {actual:?} leg, expected {expected:?}")]
    WrongDirection {
        handle: HandleId,
        expected: Direction,
        actual: Direction,
    },

    #[error("media failure on handle {handle}: {source}")]
    Media {
        handle: HandleId,
        #[source]
        source: MediaError,
    },

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// Drives offer/answer for publish and subscribe legs through a
/// [`MediaEngine`]. Legs never share state; a failure closes only the
/// leg it happened on.
#[derive(Debug)]
pub struct NegotiationEngine<M> {
    media: M,
}

impl<M: MediaEngine> NegotiationEngine<M> {
    pub fn new(media: M) -> Self {
        Self { media }
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    /// Publish leg after join confirmation: send-only offer, applied
    /// locally, attached to `configure`. The relay's answer comes later
    /// through [`accept_answer`](Self::accept_answer).
    pub fn publish(
        &mut self,
        signaling: &mut SignalingSession,
        handle: HandleId,
    ) -> Result<NegotiationState, NegotiationError> {
        let result = self.try_publish(signaling, handle);
        self.settle(signaling, handle, result)
    }

    fn try_publish(
        &mut self,
        signaling: &mut SignalingSession,
        handle: HandleId,
    ) -> Result<NegotiationState, NegotiationError> {
        expect_direction(signaling, handle, Direction::Publish)?;
        advance(signaling, handle, NegotiationState::OfferPending)?;

        let offer = self
            .media
            .create_offer(handle, MediaIntent::PUBLISH)
            .map_err(|source| NegotiationError::Media { handle, source })?;
        self.media
            .apply_local(handle, &offer)
            .map_err(|source| NegotiationError::Media { handle, source })?;

        signaling.send_request(
            handle,
            PluginRequest::Configure {
                audio: true,
                video: true,
            },
            Some(offer),
        )?;
        advance(signaling, handle, NegotiationState::Established)
    }

    /// Relay's answer to our publish offer.
    pub fn accept_answer(
        &mut self,
        signaling: &mut SignalingSession,
        handle: HandleId,
        answer: &SessionDescription,
    ) -> Result<NegotiationState, NegotiationError> {
        let result = self.try_accept_answer(signaling, handle, answer);
        self.settle(signaling, handle, result)
    }

    fn try_accept_answer(
        &mut self,
        signaling: &mut SignalingSession,
        handle: HandleId,
        answer: &SessionDescription,
    ) -> Result<NegotiationState, NegotiationError> {
        expect_direction(signaling, handle, Direction::Publish)?;
        let state = current_state(signaling, handle)?;
        if state != NegotiationState::Established {
            return Err(NegotiationError::InvalidTransition {
                handle,
                from: state,
                to: NegotiationState::Established,
            });
        }

        self.media
            .apply_remote(handle, answer)
            .map_err(|source| NegotiationError::Media { handle, source })?;
        debug!("Remote answer applied on handle {}", handle);
        Ok(state)
    }

    /// Subscribe leg: take the relay's offer, answer receive-only, apply
    /// it and `start` the leg in `room`. Also handles renegotiation offers
    /// on an established leg.
    pub fn answer_offer(
        &mut self,
        signaling: &mut SignalingSession,
        handle: HandleId,
        offer: &SessionDescription,
        room: RoomId,
    ) -> Result<NegotiationState, NegotiationError> {
        let result = self.try_answer_offer(signaling, handle, offer, room);
        self.settle(signaling, handle, result)
    }

    fn try_answer_offer(
        &mut self,
        signaling: &mut SignalingSession,
        handle: HandleId,
        offer: &SessionDescription,
        room: RoomId,
    ) -> Result<NegotiationState, NegotiationError> {
        expect_direction(signaling, handle, Direction::Subscribe)?;
        advance(signaling, handle, NegotiationState::OfferPending)?;

        self.media
            .apply_remote(handle, offer)
            .map_err(|source| NegotiationError::Media { handle, source })?;
        let answer = self
            .media
            .create_answer(handle, offer, MediaIntent::SUBSCRIBE)
            .map_err(|source| NegotiationError::Media { handle, source })?;
        advance(signaling, handle, NegotiationState::AnswerPending)?;

        self.media
            .apply_local(handle, &answer)
            .map_err(|source| NegotiationError::Media { handle, source })?;
        signaling.send_request(handle, PluginRequest::Start { room }, Some(answer))?;
        advance(signaling, handle, NegotiationState::Established)
    }

    /// Move `handle` to CLOSED and release its media. The relay handle
    /// itself stays attached until the caller detaches it.
    pub fn close(&mut self, signaling: &mut SignalingSession, handle: HandleId) {
        if let Some(media) = signaling.handle_mut(handle) {
            media.state = NegotiationState::Closed;
        }
        self.media.release(handle);
    }

    /// Forget the media of a handle that no longer exists on the relay.
    pub fn release(&mut self, handle: HandleId) {
        self.media.release(handle);
    }

    fn settle(
        &mut self,
        signaling: &mut SignalingSession,
        handle: HandleId,
        result: Result<NegotiationState, NegotiationError>,
    ) -> Result<NegotiationState, NegotiationError> {
        match result {
            Ok(state) => {
                if state == NegotiationState::Established {
                    info!("Handle {} established", handle);
                }
                Ok(state)
            }
            Err(e) => {
                warn!("Negotiation failed, closing handle {}: {}", handle, e);
                self.close(signaling, handle);
                Err(e)
            }
        }
    }
}

fn current_state(signaling: &SignalingSession, handle: HandleId) -> Result<NegotiationState, NegotiationError> {
    signaling
        .handle(handle)
        .map(|h| h.state)
        .ok_or(NegotiationError::Signaling(SignalingError::UnknownHandle(handle)))
}

fn expect_direction(
    signaling: &SignalingSession,
    handle: HandleId,
    expected: Direction,
) -> Result<(), NegotiationError> {
    let actual = signaling
        .handle(handle)
        .map(|h| h.direction)
        .ok_or(NegotiationError::Signaling(SignalingError::UnknownHandle(handle)))?;
    if actual != expected {
        return Err(NegotiationError::WrongDirection {
            handle,
            expected,
            actual,
        });
    }
    Ok(())
}

fn advance(
    signaling: &mut SignalingSession,
    handle: HandleId,
    to: NegotiationState,
) -> Result<NegotiationState, NegotiationError> {
    let media = signaling
        .handle_mut(handle)
        .ok_or(NegotiationError::Signaling(SignalingError::UnknownHandle(handle)))?;
    if !media.state.can_transition(to) {
        return Err(NegotiationError::InvalidTransition {
            handle,
            from: media.state,
            to,
        });
    }
    debug!("Handle {}: {:?} -> {:?}", handle, media.state, to);
    media.state = to;
    Ok(to)
}
