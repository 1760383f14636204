//! In-process media backend.
//!
//! [`LoopbackDevices`] hands out synthetic capture tracks and
//! [`LoopbackPeerFactory`] builds peer connections that run the offer/answer
//! state machine and "connect" once both descriptions are in place and a
//! remote candidate has been applied. Media never flows; everything else a
//! call controller observes (candidates, remote tracks, connection state)
//! does.

use async_trait::async_trait;
use log::{debug, trace};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use super::peer::{
    MediaDevices, OfferOptions, PeerConfig, PeerConnection, PeerConnectionFactory,
    PeerConnectionState, PeerEvent, SignalingState, next_peer_id,
};
use super::stream::{MediaConstraints, MediaStream, MediaTrack, TrackKind};
use crate::calls::error::{MediaError, PeerError};
use crate::types::{IceCandidate, SdpType, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceBehavior {
    Grant,
    Deny,
    Unavailable,
}

/// Synthetic capture devices.
pub struct LoopbackDevices {
    behavior: Mutex<DeviceBehavior>,
    delay: Option<Duration>,
    prompts: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl LoopbackDevices {
    pub fn new() -> Self {
        Self::with_behavior(DeviceBehavior::Grant)
    }

    pub fn with_behavior(behavior: DeviceBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            delay: None,
            prompts: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Simulate a permission prompt that takes `delay` to resolve.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_behavior(&self, behavior: DeviceBehavior) {
        *self.behavior.lock().unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    /// Number of `get_user_media` calls so far.
    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    /// Number of capture tracks released so far.
    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn capture_track(&self, kind: TrackKind, prompt: usize) -> Arc<MediaTrack> {
        let released = self.released.clone();
        MediaTrack::with_release(kind, format!("{kind}-{prompt}"), move || {
            released.fetch_add(1, Ordering::SeqCst);
        })
    }
}

impl Default for LoopbackDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<MediaStream>, MediaError> {
        let prompt = self.prompts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let behavior = *self.behavior.lock().unwrap_or_else(PoisonError::into_inner);
        match behavior {
            DeviceBehavior::Deny => {
                return Err(MediaError::AccessDenied(
                    "user dismissed the permission prompt".into(),
                ));
            }
            DeviceBehavior::Unavailable => {
                return Err(MediaError::Unavailable("no capture device found".into()));
            }
            DeviceBehavior::Grant => {}
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(self.capture_track(TrackKind::Audio, prompt));
        }
        if constraints.video.is_some() {
            tracks.push(self.capture_track(TrackKind::Video, prompt));
        }
        if tracks.is_empty() {
            return Err(MediaError::Unavailable(
                "constraints request neither audio nor video".into(),
            ));
        }
        Ok(MediaStream::with_tracks(format!("local-{prompt}"), tracks))
    }
}

/// Where a loopback peer's connection ends up once it is ready to connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectOutcome {
    #[default]
    Connect,
    Fail,
    /// Stays in `Connecting` forever.
    Stall,
}

/// Builds [`LoopbackPeer`]s and remembers them for inspection.
#[derive(Default)]
pub struct LoopbackPeerFactory {
    outcome: ConnectOutcome,
    created: Mutex<Vec<Arc<LoopbackPeer>>>,
}

impl LoopbackPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers from this factory report `Failed` instead of `Connected`.
    pub fn failing() -> Self {
        Self::with_outcome(ConnectOutcome::Fail)
    }

    /// Peers from this factory never get past `Connecting`.
    pub fn stalled() -> Self {
        Self::with_outcome(ConnectOutcome::Stall)
    }

    pub fn with_outcome(outcome: ConnectOutcome) -> Self {
        Self {
            outcome,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> Vec<Arc<LoopbackPeer>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<Arc<LoopbackPeer>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackPeerFactory {
    async fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(LoopbackPeer {
            id: next_peer_id(),
            outcome: self.outcome,
            events: tx,
            state: Mutex::new(PeerState::default()),
        });
        debug!(
            "Created loopback peer {} ({} ICE servers)",
            peer.id,
            config.ice_servers.len()
        );
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(peer.clone());
        Ok((peer, rx))
    }
}

struct PeerState {
    signaling: SignalingState,
    connection: PeerConnectionState,
    senders: Vec<Arc<MediaTrack>>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: PeerConnectionState::New,
            senders: Vec::new(),
            local: None,
            remote: None,
            applied: Vec::new(),
        }
    }
}

pub struct LoopbackPeer {
    id: u64,
    outcome: ConnectOutcome,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<PeerState>,
}

impl LoopbackPeer {
    fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PeerEvent) {
        trace!("Loopback peer {} event: {event:?}", self.id);
        // The receiver is gone once the owning endpoint resets or closes.
        let _ = self.events.send(event);
    }

    fn open(&self) -> Result<MutexGuard<'_, PeerState>, PeerError> {
        let state = self.lock();
        if state.signaling == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        Ok(state)
    }

    /// Remote candidates applied so far, in application order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.lock().applied.clone()
    }

    pub fn sender_count(&self) -> usize {
        self.lock().senders.len()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.lock().remote.clone()
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.lock().connection
    }

    pub fn is_closed(&self) -> bool {
        self.lock().signaling == SignalingState::Closed
    }

    fn host_candidate(&self) -> IceCandidate {
        let port = 40000 + (self.id % 20000);
        IceCandidate::new(
            format!("candidate:{} 1 udp 2122260223 127.0.0.1 {port} typ host", self.id),
            Some("0"),
            Some(0),
        )
    }

    fn maybe_connect(&self, state: &mut PeerState) {
        let ready = state.connection == PeerConnectionState::New
            && state.signaling == SignalingState::Stable
            && state.local.is_some()
            && state.remote.is_some()
            && !state.applied.is_empty();
        if !ready {
            return;
        }
        state.connection = PeerConnectionState::Connecting;
        self.emit(PeerEvent::ConnectionState(state.connection));
        let settled = match self.outcome {
            ConnectOutcome::Connect => PeerConnectionState::Connected,
            ConnectOutcome::Fail => PeerConnectionState::Failed,
            ConnectOutcome::Stall => return,
        };
        state.connection = settled;
        self.emit(PeerEvent::ConnectionState(settled));
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    fn id(&self) -> u64 {
        self.id
    }

    fn signaling_state(&self) -> SignalingState {
        self.lock().signaling
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError> {
        let mut state = self.open()?;
        if state.senders.iter().any(|t| t.id() == track.id()) {
            return Err(PeerError::Backend(format!(
                "track {} already has a sender",
                track.id()
            )));
        }
        state.senders.push(track);
        Ok(())
    }

    async fn remove_all_senders(&self) -> Result<(), PeerError> {
        self.open()?.senders.clear();
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, PeerError> {
        let state = self.open()?;
        if state.signaling == SignalingState::HaveRemoteOffer {
            return Err(PeerError::WrongState {
                op: "create_offer",
                state: state.signaling.to_string(),
            });
        }
        let audio = options.receive_audio || has_kind(&state.senders, TrackKind::Audio);
        let video = options.receive_video || has_kind(&state.senders, TrackKind::Video);
        Ok(SessionDescription::offer(render_sdp(
            self.id,
            &state.senders,
            audio,
            video,
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let state = self.open()?;
        let remote = match (&state.signaling, &state.remote) {
            (SignalingState::HaveRemoteOffer, Some(remote)) => remote,
            _ => {
                return Err(PeerError::WrongState {
                    op: "create_answer",
                    state: state.signaling.to_string(),
                });
            }
        };
        let offered = parse_sections(&remote.sdp);
        let audio = offered.iter().any(|s| s.kind == TrackKind::Audio);
        let video = offered.iter().any(|s| s.kind == TrackKind::Video);
        Ok(SessionDescription::answer(render_sdp(
            self.id,
            &state.senders,
            audio,
            video,
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        {
            let mut state = self.open()?;
            state.signaling = match (state.signaling, desc.sdp_type) {
                (SignalingState::Stable | SignalingState::HaveLocalOffer, SdpType::Offer) => {
                    SignalingState::HaveLocalOffer
                }
                (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
                (current, _) => {
                    return Err(PeerError::WrongState {
                        op: "set_local_description",
                        state: current.to_string(),
                    });
                }
            };
            state.local = Some(desc);
        }
        self.emit(PeerEvent::IceCandidate(self.host_candidate()));
        let mut state = self.lock();
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        if !desc.sdp.starts_with("v=0") {
            return Err(PeerError::InvalidDescription(
                "SDP must start with a version line".into(),
            ));
        }
        let mut state = self.open()?;
        state.signaling = match (state.signaling, desc.sdp_type) {
            (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveRemoteOffer,
            (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
            (current, _) => {
                return Err(PeerError::WrongState {
                    op: "set_remote_description",
                    state: current.to_string(),
                });
            }
        };
        for section in parse_sections(&desc.sdp) {
            if let Some(track_id) = section.track_id {
                self.emit(PeerEvent::Track(MediaTrack::remote(section.kind, track_id)));
            }
        }
        state.remote = Some(desc);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut state = self.open()?;
        if state.remote.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        state.applied.push(candidate);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut state = self.lock();
        if state.signaling == SignalingState::Closed {
            return Ok(());
        }
        state.signaling = SignalingState::Closed;
        state.connection = PeerConnectionState::Closed;
        state.senders.clear();
        self.emit(PeerEvent::ConnectionState(PeerConnectionState::Closed));
        Ok(())
    }
}

fn has_kind(tracks: &[Arc<MediaTrack>], kind: TrackKind) -> bool {
    tracks.iter().any(|t| t.kind() == kind)
}

fn render_sdp(session_id: u64, senders: &[Arc<MediaTrack>], audio: bool, video: bool) -> String {
    let mut sdp = format!("v=0\r\no=- {session_id} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
    let sections = [(TrackKind::Audio, audio, 111), (TrackKind::Video, video, 96)];
    for (mid, (kind, wanted, payload_type)) in sections.into_iter().enumerate() {
        if !wanted {
            continue;
        }
        let sender = senders.iter().find(|t| t.kind() == kind);
        let direction = if sender.is_some() { "sendrecv" } else { "recvonly" };
        sdp.push_str(&format!(
            "m={kind} 9 UDP/TLS/RTP/SAVPF {payload_type}\r\na=mid:{mid}\r\na={direction}\r\n"
        ));
        if let Some(track) = sender {
            sdp.push_str(&format!("a=msid:stream-{session_id} {}\r\n", track.id()));
        }
    }
    sdp
}

struct Section {
    kind: TrackKind,
    track_id: Option<String>,
}

fn parse_sections(sdp: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    for line in sdp.lines() {
        if let Some(media) = line.strip_prefix("m=") {
            let kind = match media.split_whitespace().next() {
                Some("audio") => TrackKind::Audio,
                Some("video") => TrackKind::Video,
                _ => continue,
            };
            sections.push(Section {
                kind,
                track_id: None,
            });
        } else if let Some(msid) = line.strip_prefix("a=msid:") {
            if let Some(section) = sections.last_mut() {
                section.track_id = msid.split_whitespace().nth(1).map(str::to_string);
            }
        }
    }
    sections
}
