use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a user on the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity of one call attempt.
///
/// A redial produces a new id, so late messages belonging to an earlier
/// attempt can be told apart from the current one without comparing payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random 128-bit id rendered as 32 uppercase hex characters.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => f.write_str("offer"),
            Self::Answer => f.write_str("answer"),
        }
    }
}

/// An SDP payload tagged with its role in the offer/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A network path proposed by one side's ICE agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<&str>, index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_m_line_index: index,
            sdp_mid: sdp_mid.map(str::to_string),
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Why a call left the live states.
///
/// Every reason has a stable string code so UIs can tell a declined call from
/// a timed-out one or a permission failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EndReason {
    /// We hung up.
    LocalHangup,
    /// The peer sent `end-call`.
    RemoteHangup,
    /// We declined an incoming call.
    Declined,
    /// The peer declined our call.
    Rejected,
    /// No answer within the ring timeout.
    RingTimeout,
    /// Negotiated but media never connected, or the connection failed.
    ConnectFailed,
    MediaAccessDenied,
    MediaUnavailable,
    /// Offer/answer negotiation or endpoint contract failure.
    NegotiationFailed,
    /// The controller was torn down (logout).
    Shutdown,
}

impl EndReason {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::LocalHangup => "local-hangup",
            Self::RemoteHangup => "remote-hangup",
            Self::Declined => "declined",
            Self::Rejected => "rejected",
            Self::RingTimeout => "ring-timeout",
            Self::ConnectFailed => "connect-failed",
            Self::MediaAccessDenied => "media-access-denied",
            Self::MediaUnavailable => "media-unavailable",
            Self::NegotiationFailed => "negotiation-failed",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether the UI should present this end as a failure rather than a
    /// normal hangup.
    pub const fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed
                | Self::MediaAccessDenied
                | Self::MediaUnavailable
                | Self::NegotiationFailed
        )
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
