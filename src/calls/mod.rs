//! Peer-to-peer video calls.
//!
//! # Architecture
//!
//! - [`MediaEndpoint`]: local capture plus one peer connection per attempt
//! - [`CallSignalingProtocol`]: call events encoded onto the relay channel
//! - [`CallSessionController`]: single-session lifecycle and the UI surface
//! - [`CallState`] & [`CallSession`]: the state machine behind it
//!
//! # Call flow
//!
//! The caller acquires media and sends `call-offer`. The callee rings, and on
//! accept sends `call-accepted`, acquires media and replies with
//! `call-answer`. Both sides trickle `ice-candidate`s as they are gathered;
//! the call is `Active` once the media path connects. Either side ends it
//! with `end-call`, or the callee declines with `reject-call`.

mod config;
mod controller;
mod error;
pub mod media;
mod protocol;
mod state;

pub use config::{CallConfig, DEFAULT_STUN_SERVER};
pub use controller::CallSessionController;
pub use error::{CallError, MediaError, PeerError};
pub use media::{
    IceServer, MediaBackend, MediaConstraints, MediaEndpoint, MediaStream, MediaTrack,
    PeerConnectionState, RemoteTrack, TrackKind, VideoConstraints,
};
pub use protocol::CallSignalingProtocol;
pub use state::{CallSession, CallState, CallTransition, InvalidTransition, Negotiation};
