//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::types::{CallDirection, CallId, EndReason, UserId};

/// Lifecycle state reported to the UI.
///
/// `Ended` is transient: it is reported together with a reason and followed
/// immediately by `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum CallState {
    #[default]
    Idle,
    /// Outgoing call: offer sent or being prepared, waiting for the callee.
    RingingOut,
    /// Incoming call: ringing locally, possibly already accepted and
    /// connecting.
    RingingIn,
    /// Media path connected.
    Active,
    Ended,
}

impl CallState {
    /// A session exists and can be hung up.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::RingingOut | Self::RingingIn | Self::Active)
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::RingingOut | Self::RingingIn)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::RingingOut => "ringing-out",
            Self::RingingIn => "ringing-in",
            Self::Active => "active",
            Self::Ended => "ended",
        })
    }
}

/// Offer/answer progress inside the ringing states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum Negotiation {
    /// Nothing beyond the offer has happened.
    #[default]
    Pending,
    /// Callee: the user accepted. Caller: `call-accepted` arrived.
    Accepted,
    /// Callee: answer sent. Caller: answer applied.
    Answered,
}

/// State transitions for calls.
#[derive(Debug, Clone, Copy)]
pub enum CallTransition {
    LocalAccepted,
    RemoteAccepted,
    AnswerApplied,
    AnswerSent,
    MediaConnected,
    Terminated { reason: EndReason },
}

/// One call attempt, from offer to end.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub call_id: CallId,
    pub peer_id: UserId,
    pub direction: CallDirection,
    pub state: CallState,
    pub negotiation: Negotiation,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl CallSession {
    pub fn new_outgoing(call_id: CallId, peer_id: UserId) -> Self {
        Self::new(call_id, peer_id, CallDirection::Outgoing, CallState::RingingOut)
    }

    pub fn new_incoming(call_id: CallId, peer_id: UserId) -> Self {
        Self::new(call_id, peer_id, CallDirection::Incoming, CallState::RingingIn)
    }

    fn new(call_id: CallId, peer_id: UserId, direction: CallDirection, state: CallState) -> Self {
        Self {
            call_id,
            peer_id,
            direction,
            state,
            negotiation: Negotiation::Pending,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            end_reason: None,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.direction == CallDirection::Outgoing
    }

    /// Whether a message from `from` about `call_id` belongs to this attempt.
    /// A message that names no attempt belongs to none.
    pub fn matches(&self, from: &UserId, call_id: Option<&CallId>) -> bool {
        &self.peer_id == from && call_id.is_some_and(|id| id == &self.call_id)
    }

    /// Seconds between media connecting and the end of the call.
    pub fn duration_secs(&self) -> Option<i64> {
        let connected = self.connected_at?;
        let ended = self.ended_at.unwrap_or_else(Utc::now);
        Some(ended.signed_duration_since(connected).num_seconds())
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        use CallState::*;
        use Negotiation::*;

        match (self.state, self.negotiation, transition) {
            (RingingIn, Pending, CallTransition::LocalAccepted) => {
                self.negotiation = Accepted;
            }
            (RingingOut, Pending, CallTransition::RemoteAccepted) => {
                self.negotiation = Accepted;
            }
            (RingingOut, Pending | Accepted, CallTransition::AnswerApplied) => {
                self.negotiation = Answered;
            }
            (RingingIn, Accepted, CallTransition::AnswerSent) => {
                self.negotiation = Answered;
            }
            (RingingOut, Answered, CallTransition::MediaConnected)
            | (RingingIn, Accepted | Answered, CallTransition::MediaConnected) => {
                self.state = Active;
                self.connected_at = Some(Utc::now());
            }
            (RingingOut | RingingIn | Active, _, CallTransition::Terminated { reason }) => {
                self.state = Ended;
                self.ended_at = Some(Utc::now());
                self.end_reason = Some(reason);
            }
            (state, negotiation, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{state} ({negotiation:?})"),
                    attempted: format!("{transition:?}"),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> CallSession {
        CallSession::new_outgoing(
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            UserId::from("callee"),
        )
    }

    fn incoming() -> CallSession {
        CallSession::new_incoming(
            CallId::new("BC5BD1EDE9BBE601F408EF3795479E93"),
            UserId::from("caller"),
        )
    }

    /// Flow: RingingOut → (accepted) → (answered) → Active → Ended
    #[test]
    fn test_outgoing_call_flow() {
        let mut call = outgoing();
        assert!(call.is_initiator());
        assert_eq!(call.state, CallState::RingingOut);

        call.apply_transition(CallTransition::RemoteAccepted).unwrap();
        call.apply_transition(CallTransition::AnswerApplied).unwrap();
        assert_eq!(call.negotiation, Negotiation::Answered);

        call.apply_transition(CallTransition::MediaConnected).unwrap();
        assert_eq!(call.state, CallState::Active);
        assert!(call.connected_at.is_some());

        call.apply_transition(CallTransition::Terminated {
            reason: EndReason::LocalHangup,
        })
        .unwrap();
        assert_eq!(call.state, CallState::Ended);
        assert_eq!(call.end_reason, Some(EndReason::LocalHangup));
        assert!(call.duration_secs().is_some());
    }

    /// The answer may overtake `call-accepted` on the relay.
    #[test]
    fn test_answer_before_accepted_notice() {
        let mut call = outgoing();
        call.apply_transition(CallTransition::AnswerApplied).unwrap();
        assert!(call.apply_transition(CallTransition::RemoteAccepted).is_err());
        call.apply_transition(CallTransition::MediaConnected).unwrap();
        assert_eq!(call.state, CallState::Active);
    }

    #[test]
    fn test_incoming_call_flow() {
        let mut call = incoming();
        assert_eq!(call.state, CallState::RingingIn);

        // Media cannot connect before the user accepts.
        assert!(call.apply_transition(CallTransition::MediaConnected).is_err());

        call.apply_transition(CallTransition::LocalAccepted).unwrap();
        // The connection may come up before the answer is marked sent.
        call.apply_transition(CallTransition::MediaConnected).unwrap();
        assert_eq!(call.state, CallState::Active);
        assert!(call.apply_transition(CallTransition::AnswerSent).is_err());
    }

    #[test]
    fn test_double_accept_rejected() {
        let mut call = incoming();
        call.apply_transition(CallTransition::LocalAccepted).unwrap();
        let err = call
            .apply_transition(CallTransition::LocalAccepted)
            .unwrap_err();
        assert!(err.to_string().contains("LocalAccepted"));
    }

    #[test]
    fn test_ended_is_terminal() {
        let mut call = incoming();
        call.apply_transition(CallTransition::Terminated {
            reason: EndReason::Declined,
        })
        .unwrap();
        assert!(call.duration_secs().is_none());
        assert!(
            call.apply_transition(CallTransition::Terminated {
                reason: EndReason::RemoteHangup
            })
            .is_err()
        );
        assert_eq!(call.end_reason, Some(EndReason::Declined));
    }

    #[test]
    fn test_matches_checks_peer_and_attempt() {
        let call = outgoing();
        let callee = UserId::from("callee");
        assert!(call.matches(&callee, Some(&call.call_id)));
        assert!(!call.matches(&callee, None));
        assert!(!call.matches(&callee, Some(&CallId::new("OTHER"))));
        assert!(!call.matches(&UserId::from("mallory"), Some(&call.call_id)));
    }
}
