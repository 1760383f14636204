//! Platform-agnostic building blocks for peer-to-peer call signaling.
//!
//! Nothing in this crate touches a runtime, a socket or a media device: it
//! holds the identities, session descriptions and ICE candidates exchanged
//! between two call endpoints, and the JSON vocabulary used to carry them over
//! a relay-only signaling channel.

pub mod codec;
pub mod signaling;
pub mod types;

pub use codec::CodecError;
pub use signaling::{SignalKind, SignalMessage};
pub use types::call::{
    CallDirection, CallId, EndReason, IceCandidate, SdpType, SessionDescription, UserId,
};
