//! Media for peer-to-peer calls.
//!
//! - [`MediaTrack`], [`MediaStream`]: local capture and remote playback
//! - [`MediaDevices`], [`PeerConnectionFactory`]: backend seams
//! - [`MediaEndpoint`]: one call's media, owning a single peer connection
//! - [`loopback`]: in-process backend for demos and tests
//! - `webrtc` (feature `webrtc-backend`): webrtc-rs peer connections

use std::sync::Arc;

mod endpoint;
pub mod loopback;
mod peer;
mod stream;
#[cfg(feature = "webrtc-backend")]
pub mod webrtc;

pub use endpoint::{MediaEndpoint, RemoteTrack};
pub use peer::{
    IceServer, MediaDevices, OfferOptions, PeerConfig, PeerConnection, PeerConnectionFactory,
    PeerConnectionState, PeerEvent, SignalingState, next_peer_id,
};
pub use stream::{MediaConstraints, MediaStream, MediaTrack, TrackKind, VideoConstraints};

/// The pair of backends a [`MediaEndpoint`] draws on.
#[derive(Clone)]
pub struct MediaBackend {
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
}

impl MediaBackend {
    pub fn new(devices: Arc<dyn MediaDevices>, peers: Arc<dyn PeerConnectionFactory>) -> Self {
        Self { devices, peers }
    }

    /// Synthetic devices and loopback peer connections.
    pub fn loopback() -> Self {
        Self::new(
            Arc::new(loopback::LoopbackDevices::new()),
            Arc::new(loopback::LoopbackPeerFactory::new()),
        )
    }
}
