//! Call-related error types.

use std::time::Duration;
use thiserror::Error;

use crate::types::{CodecError, EndReason};

/// Errors surfaced to the UI layer.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("media access denied: {0}")]
    MediaAccessDenied(String),

    #[error("no usable media device: {0}")]
    MediaUnavailable(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("another call is already in progress")]
    CallBusy,

    #[error("no answer within {0:?}")]
    SignalingTimeout(Duration),

    #[error("malformed signal: {0}")]
    MalformedSignal(#[from] CodecError),

    #[error("signaling channel error: {0}")]
    Signaling(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),
}

impl CallError {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// The end reason reported when this error terminates a call.
    pub fn end_reason(&self) -> EndReason {
        match self {
            Self::MediaAccessDenied(_) => EndReason::MediaAccessDenied,
            Self::MediaUnavailable(_) => EndReason::MediaUnavailable,
            Self::SignalingTimeout(_) => EndReason::RingTimeout,
            _ => EndReason::NegotiationFailed,
        }
    }

    /// Contract violations that point at a bug rather than at the network or
    /// the user's devices.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidState(_) | Self::InvalidTransition(_) | Self::Negotiation(_)
        )
    }
}

/// Failures from the capture device layer.
#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    AccessDenied(String),

    #[error("device unavailable: {0}")]
    Unavailable(String),

    #[error("device error: {0}")]
    Device(String),
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::AccessDenied(msg) => Self::MediaAccessDenied(msg),
            MediaError::Unavailable(msg) | MediaError::Device(msg) => Self::MediaUnavailable(msg),
        }
    }
}

/// Failures from the peer connection backend.
#[derive(Debug, Clone, Error)]
pub enum PeerError {
    #[error("{op} not allowed in signaling state {state}")]
    WrongState { op: &'static str, state: String },

    #[error("peer connection is closed")]
    Closed,

    #[error("no remote description set")]
    NoRemoteDescription,

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<PeerError> for CallError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::Closed | PeerError::NoRemoteDescription => {
                Self::InvalidState(err.to_string())
            }
            other => Self::Negotiation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_errors_keep_their_category() {
        let denied: CallError = MediaError::AccessDenied("user said no".into()).into();
        assert!(matches!(denied, CallError::MediaAccessDenied(_)));
        assert_eq!(denied.end_reason(), EndReason::MediaAccessDenied);

        let missing: CallError = MediaError::Unavailable("no camera".into()).into();
        assert_eq!(missing.end_reason(), EndReason::MediaUnavailable);
        assert!(!missing.is_contract_violation());
    }

    #[test]
    fn test_peer_errors_map_to_negotiation_or_state() {
        let closed: CallError = PeerError::Closed.into();
        assert!(matches!(closed, CallError::InvalidState(_)));

        let wrong: CallError = PeerError::WrongState {
            op: "create_answer",
            state: "stable".into(),
        }
        .into();
        assert!(matches!(wrong, CallError::Negotiation(_)));
        assert_eq!(wrong.end_reason(), EndReason::NegotiationFailed);
        assert!(wrong.is_contract_violation());
    }
}
