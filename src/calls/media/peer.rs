//! Backend seams for capture devices and peer connections.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::stream::{MediaConstraints, MediaStream, MediaTrack};
use crate::calls::error::{MediaError, PeerError};
use crate::types::{IceCandidate, SessionDescription};

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique id for a newly created peer connection.
pub fn next_peer_id() -> u64 {
    NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Closed => "closed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A STUN/TURN server entry.
#[derive(Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

impl fmt::Debug for IceServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceServer")
            .field("urls", &self.urls)
            .field("username", &self.username)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
}

/// Receive directions requested when creating an offer. A kind with no
/// local track still gets a receive-only section so the peer's media of
/// that kind is negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub receive_audio: bool,
    pub receive_video: bool,
}

impl Default for OfferOptions {
    fn default() -> Self {
        Self {
            receive_audio: true,
            receive_video: true,
        }
    }
}

/// Asynchronous notifications from a peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    Track(Arc<MediaTrack>),
    ConnectionState(PeerConnectionState),
}

/// One negotiated peer connection.
///
/// Implementations deliver [`PeerEvent`]s on the channel returned alongside
/// the connection, never by calling back into the caller.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Unique for the life of the process.
    fn id(&self) -> u64;

    fn signaling_state(&self) -> SignalingState;

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError>;

    async fn remove_all_senders(&self) -> Result<(), PeerError>;

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), PeerError>;
}

/// Capture device access. May prompt the user.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<MediaStream>, MediaError>;
}
