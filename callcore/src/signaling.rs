//! Call signaling vocabulary.
//!
//! Each message is a named event on the signaling channel carrying a JSON
//! object. Every payload starts with the same envelope: who sent it, who the
//! relay should deliver it to, and which call attempt it belongs to.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::codec::{CodecError, decode_description_as, encode_description};
use crate::types::call::{CallId, IceCandidate, SdpType, SessionDescription, UserId};

/// Signaling event types used for call control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Caller → callee. Starts a call attempt.
    Offer,
    /// Callee → caller. Completes negotiation.
    Answer,
    /// Callee → caller. Sent on UI accept, before local media is ready.
    Accepted,
    /// Either direction, any time after the offer.
    IceCandidate,
    /// Callee → caller. Declines before negotiation.
    Reject,
    /// Either direction. Terminates a pending or active call.
    End,
    /// Either direction. Local mute / camera-off state changed.
    MediaState,
}

impl SignalKind {
    pub const ALL: [SignalKind; 7] = [
        Self::Offer,
        Self::Answer,
        Self::Accepted,
        Self::IceCandidate,
        Self::Reject,
        Self::End,
        Self::MediaState,
    ];

    /// Event name used on the signaling channel.
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Offer => "call-offer",
            Self::Answer => "call-answer",
            Self::Accepted => "call-accepted",
            Self::IceCandidate => "ice-candidate",
            Self::Reject => "reject-call",
            Self::End => "end-call",
            Self::MediaState => "media-state",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.event_name() == name)
    }

    /// Whether receiving this event ends the call.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Reject | Self::End)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// Routing and attempt identity common to every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub from_id: UserId,
    pub to_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
}

impl Envelope {
    pub fn new(from_id: UserId, to_id: UserId, call_id: CallId) -> Self {
        Self {
            from_id,
            to_id,
            call_id: Some(call_id),
        }
    }

    fn require_call_id(&self) -> Result<(), CodecError> {
        if self.call_id.is_none() {
            return Err(CodecError::MissingField("callId"));
        }
        Ok(())
    }
}

/// A decoded signaling message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    Offer {
        envelope: Envelope,
        offer: SessionDescription,
    },
    Answer {
        envelope: Envelope,
        answer: SessionDescription,
    },
    Accepted {
        envelope: Envelope,
    },
    IceCandidate {
        envelope: Envelope,
        candidate: IceCandidate,
    },
    Reject {
        envelope: Envelope,
    },
    End {
        envelope: Envelope,
    },
    MediaState {
        envelope: Envelope,
        audio_muted: bool,
        video_hidden: bool,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferBody {
    #[serde(flatten)]
    envelope: Envelope,
    offer: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerBody {
    #[serde(flatten)]
    envelope: Envelope,
    answer: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidateBody {
    #[serde(flatten)]
    envelope: Envelope,
    candidate: IceCandidate,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaStateBody {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default)]
    audio_muted: bool,
    #[serde(default)]
    video_hidden: bool,
}

impl SignalMessage {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Offer { .. } => SignalKind::Offer,
            Self::Answer { .. } => SignalKind::Answer,
            Self::Accepted { .. } => SignalKind::Accepted,
            Self::IceCandidate { .. } => SignalKind::IceCandidate,
            Self::Reject { .. } => SignalKind::Reject,
            Self::End { .. } => SignalKind::End,
            Self::MediaState { .. } => SignalKind::MediaState,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        match self {
            Self::Offer { envelope, .. }
            | Self::Answer { envelope, .. }
            | Self::Accepted { envelope }
            | Self::IceCandidate { envelope, .. }
            | Self::Reject { envelope }
            | Self::End { envelope }
            | Self::MediaState { envelope, .. } => envelope,
        }
    }

    pub fn from_id(&self) -> &UserId {
        &self.envelope().from_id
    }

    pub fn call_id(&self) -> Option<&CallId> {
        self.envelope().call_id.as_ref()
    }

    /// Serialize into the JSON payload sent under [`SignalKind::event_name`].
    pub fn to_payload(&self) -> Result<Value, CodecError> {
        let value = match self {
            Self::Offer { envelope, offer } => serde_json::to_value(OfferBody {
                envelope: envelope.clone(),
                offer: encode_description(offer)?,
            })?,
            Self::Answer { envelope, answer } => serde_json::to_value(AnswerBody {
                envelope: envelope.clone(),
                answer: encode_description(answer)?,
            })?,
            Self::IceCandidate {
                envelope,
                candidate,
            } => serde_json::to_value(CandidateBody {
                envelope: envelope.clone(),
                candidate: candidate.clone(),
            })?,
            Self::MediaState {
                envelope,
                audio_muted,
                video_hidden,
            } => serde_json::to_value(MediaStateBody {
                envelope: envelope.clone(),
                audio_muted: *audio_muted,
                video_hidden: *video_hidden,
            })?,
            Self::Accepted { envelope } | Self::Reject { envelope } | Self::End { envelope } => {
                serde_json::to_value(envelope)?
            }
        };
        Ok(value)
    }

    /// Parse a payload received under the given event name.
    pub fn from_event(event: &str, payload: &Value) -> Result<Self, CodecError> {
        let kind = SignalKind::from_event_name(event)
            .ok_or_else(|| CodecError::UnknownEvent(event.to_string()))?;

        let msg = match kind {
            SignalKind::Offer => {
                let body: OfferBody = serde_json::from_value(payload.clone())?;
                body.envelope.require_call_id()?;
                Self::Offer {
                    offer: decode_description_as(&body.offer, SdpType::Offer)?,
                    envelope: body.envelope,
                }
            }
            SignalKind::Answer => {
                let body: AnswerBody = serde_json::from_value(payload.clone())?;
                body.envelope.require_call_id()?;
                Self::Answer {
                    answer: decode_description_as(&body.answer, SdpType::Answer)?,
                    envelope: body.envelope,
                }
            }
            SignalKind::IceCandidate => {
                let body: CandidateBody = serde_json::from_value(payload.clone())?;
                body.envelope.require_call_id()?;
                Self::IceCandidate {
                    envelope: body.envelope,
                    candidate: body.candidate,
                }
            }
            SignalKind::MediaState => {
                let body: MediaStateBody = serde_json::from_value(payload.clone())?;
                body.envelope.require_call_id()?;
                Self::MediaState {
                    envelope: body.envelope,
                    audio_muted: body.audio_muted,
                    video_hidden: body.video_hidden,
                }
            }
            SignalKind::Accepted => {
                let envelope: Envelope = serde_json::from_value(payload.clone())?;
                envelope.require_call_id()?;
                Self::Accepted { envelope }
            }
            SignalKind::Reject => {
                let envelope: Envelope = serde_json::from_value(payload.clone())?;
                envelope.require_call_id()?;
                Self::Reject { envelope }
            }
            SignalKind::End => {
                let envelope: Envelope = serde_json::from_value(payload.clone())?;
                envelope.require_call_id()?;
                Self::End { envelope }
            }
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> Envelope {
        Envelope::new(
            UserId::from("u1"),
            UserId::from("u2"),
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
        )
    }

    #[test]
    fn test_event_names_match_wire_vocabulary() {
        let names: Vec<_> = SignalKind::ALL.iter().map(|k| k.event_name()).collect();
        assert_eq!(
            names,
            [
                "call-offer",
                "call-answer",
                "call-accepted",
                "ice-candidate",
                "reject-call",
                "end-call",
                "media-state"
            ]
        );
        for kind in SignalKind::ALL {
            assert_eq!(SignalKind::from_event_name(kind.event_name()), Some(kind));
        }
        assert_eq!(SignalKind::from_event_name("call-ring"), None);
    }

    #[test]
    fn test_offer_payload_carries_encoded_description() {
        let msg = SignalMessage::Offer {
            envelope: envelope(),
            offer: SessionDescription::offer("v=0\r\n"),
        };
        let payload = msg.to_payload().unwrap();
        assert_eq!(payload["fromId"], "u1");
        assert_eq!(payload["toId"], "u2");
        assert_eq!(payload["callId"], "AC90CFD09DF712D981142B172706F9F2");
        assert!(payload["offer"].is_string());

        let parsed = SignalMessage::from_event("call-offer", &payload).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_offer_without_call_id_is_rejected() {
        let payload = json!({"fromId": "u1", "toId": "u2", "offer": ""});
        assert!(matches!(
            SignalMessage::from_event("call-offer", &payload),
            Err(CodecError::MissingField("callId"))
        ));
    }

    #[test]
    fn test_answer_payload_must_hold_an_answer() {
        let mut payload = SignalMessage::Offer {
            envelope: envelope(),
            offer: SessionDescription::offer("v=0"),
        }
        .to_payload()
        .unwrap();
        let encoded_offer = payload["offer"].take();
        let payload = json!({
            "fromId": "u2", "toId": "u1",
            "callId": "AC90CFD09DF712D981142B172706F9F2",
            "answer": encoded_offer,
        });
        assert!(matches!(
            SignalMessage::from_event("call-answer", &payload),
            Err(CodecError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn test_terminal_events_require_call_id() {
        let payload = json!({"fromId": "u2", "toId": "u1"});
        for event in ["end-call", "reject-call"] {
            assert!(matches!(
                SignalMessage::from_event(event, &payload),
                Err(CodecError::MissingField("callId"))
            ));
        }

        let payload = json!({"fromId": "u2", "toId": "u1", "callId": "C1"});
        let msg = SignalMessage::from_event("end-call", &payload).unwrap();
        assert_eq!(msg.kind(), SignalKind::End);
        assert!(msg.kind().is_terminal());
    }

    #[test]
    fn test_ice_candidate_payload_shape() {
        let msg = SignalMessage::IceCandidate {
            envelope: envelope(),
            candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 5000 typ host", Some("0"), Some(0)),
        };
        let payload = msg.to_payload().unwrap();
        assert_eq!(payload["candidate"]["sdpMid"], "0");
        assert_eq!(
            SignalMessage::from_event("ice-candidate", &payload).unwrap(),
            msg
        );
    }

    #[test]
    fn test_unknown_event_is_an_error() {
        assert!(matches!(
            SignalMessage::from_event("typing", &json!({})),
            Err(CodecError::UnknownEvent(_))
        ));
    }
}
