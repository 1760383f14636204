//! Per-call media endpoint.
//!
//! Owns the local capture stream and exactly one peer connection at a time.
//! Remote ICE candidates that arrive before a remote description are queued
//! and applied, in arrival order, right after the description lands.

use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::MediaBackend;
use super::peer::{
    OfferOptions, PeerConfig, PeerConnection, PeerConnectionState, PeerEvent, SignalingState,
};
use super::stream::{MediaConstraints, MediaStream, MediaTrack, TrackKind};
use crate::calls::error::CallError;
use crate::subscription::{ListenerSet, Subscription};
use crate::types::{IceCandidate, SdpType, SessionDescription};

/// A remote track together with the stream it was added to.
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub track: Arc<MediaTrack>,
    pub stream: Arc<MediaStream>,
}

#[derive(Default)]
struct EndpointListeners {
    ice: ListenerSet<IceCandidate>,
    track: ListenerSet<RemoteTrack>,
    state: ListenerSet<PeerConnectionState>,
}

#[derive(Default)]
struct EndpointInner {
    closed: bool,
    generation: u64,
    peer: Option<Arc<dyn PeerConnection>>,
    pump: Option<JoinHandle<()>>,
    local_stream: Option<Arc<MediaStream>>,
    tracks_attached: bool,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    audio_muted: bool,
    video_hidden: bool,
}

impl EndpointInner {
    fn ensure_open(&self, op: &str) -> Result<(), CallError> {
        if self.closed {
            return Err(CallError::invalid_state(format!("{op}: endpoint is closed")));
        }
        Ok(())
    }

    fn live_peer(&self, op: &str) -> Result<Arc<dyn PeerConnection>, CallError> {
        self.ensure_open(op)?;
        self.peer
            .clone()
            .ok_or_else(|| CallError::invalid_state(format!("{op}: endpoint has not been reset")))
    }

    fn apply_track_flags(&self, stream: &MediaStream) {
        for track in stream.tracks_of(TrackKind::Audio) {
            track.set_enabled(!self.audio_muted);
        }
        for track in stream.tracks_of(TrackKind::Video) {
            track.set_enabled(!self.video_hidden);
        }
    }
}

pub struct MediaEndpoint {
    backend: MediaBackend,
    peer_config: PeerConfig,
    constraints: MediaConstraints,
    inner: Mutex<EndpointInner>,
    live_generation: Arc<AtomicU64>,
    remote_stream: Arc<StdMutex<Option<Arc<MediaStream>>>>,
    listeners: Arc<EndpointListeners>,
}

impl MediaEndpoint {
    /// A new endpoint has no peer connection; call [`MediaEndpoint::reset`]
    /// before negotiating.
    pub fn new(backend: MediaBackend, peer_config: PeerConfig, constraints: MediaConstraints) -> Self {
        Self {
            backend,
            peer_config,
            constraints,
            inner: Mutex::new(EndpointInner::default()),
            live_generation: Arc::new(AtomicU64::new(0)),
            remote_stream: Arc::new(StdMutex::new(None)),
            listeners: Arc::new(EndpointListeners::default()),
        }
    }

    /// Acquire the local capture stream, prompting the user if needed.
    ///
    /// Idempotent: once a stream is held it is returned without prompting
    /// again. The endpoint lock is not held while the prompt is pending, so
    /// a concurrent [`MediaEndpoint::close`] wins and the fresh stream is
    /// released.
    pub async fn acquire_local_stream(&self) -> Result<Arc<MediaStream>, CallError> {
        {
            let inner = self.inner.lock().await;
            inner.ensure_open("acquire_local_stream")?;
            if let Some(stream) = &inner.local_stream {
                return Ok(stream.clone());
            }
        }

        let stream = self
            .backend
            .devices
            .get_user_media(&self.constraints)
            .await?;

        let mut inner = self.inner.lock().await;
        if inner.closed {
            stream.stop_all();
            return Err(CallError::invalid_state(
                "endpoint closed while local media was being acquired",
            ));
        }
        if let Some(existing) = &inner.local_stream {
            stream.stop_all();
            return Ok(existing.clone());
        }
        inner.apply_track_flags(&stream);
        debug!(
            "Acquired local stream {} with {} tracks",
            stream.id(),
            stream.tracks().len()
        );
        inner.local_stream = Some(stream.clone());
        Ok(stream)
    }

    /// Discard any existing peer connection and create a fresh one.
    ///
    /// Removes the old connection's senders before closing it and empties the
    /// candidate queue. Events still in flight from the old connection are
    /// never delivered.
    pub async fn reset(&self) -> Result<(), CallError> {
        let (generation, old_peer) = {
            let mut inner = self.inner.lock().await;
            inner.ensure_open("reset")?;
            inner.generation += 1;
            self.live_generation.store(inner.generation, Ordering::Release);
            inner.tracks_attached = false;
            inner.remote_description_set = false;
            if !inner.pending_candidates.is_empty() {
                debug!(
                    "Reset discards {} queued remote candidates",
                    inner.pending_candidates.len()
                );
                inner.pending_candidates.clear();
            }
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
            (inner.generation, inner.peer.take())
        };
        self.release_remote_stream();
        if let Some(old) = old_peer {
            teardown(old).await;
        }

        let (peer, events) = self.backend.peers.create(&self.peer_config).await?;

        let mut inner = self.inner.lock().await;
        if inner.closed || inner.generation != generation {
            drop(inner);
            debug!("Discarding peer connection {} from a superseded reset", peer.id());
            teardown(peer).await;
            return Err(CallError::invalid_state(
                "reset superseded by close or a newer reset",
            ));
        }
        debug!("Endpoint now owns peer connection {}", peer.id());
        inner.pump = Some(tokio::spawn(pump_events(
            generation,
            self.live_generation.clone(),
            events,
            self.listeners.clone(),
            self.remote_stream.clone(),
        )));
        inner.peer = Some(peer);
        Ok(())
    }

    /// Attach the local tracks, create an offer and set it as the local
    /// description. The offer asks to receive both audio and video.
    ///
    /// `local_stream` must be the stream this endpoint already holds, if it
    /// holds one.
    pub async fn create_offer(
        &self,
        local_stream: &Arc<MediaStream>,
    ) -> Result<SessionDescription, CallError> {
        let mut inner = self.inner.lock().await;
        let peer = inner.live_peer("create_offer")?;
        let state = peer.signaling_state();
        if !matches!(state, SignalingState::Stable | SignalingState::HaveLocalOffer) {
            return Err(CallError::Negotiation(format!(
                "cannot create an offer in signaling state {state}"
            )));
        }
        match &inner.local_stream {
            Some(held) if !Arc::ptr_eq(held, local_stream) => {
                return Err(CallError::invalid_state(
                    "create_offer given a stream other than the one already held",
                ));
            }
            Some(_) => {}
            None => {
                inner.apply_track_flags(local_stream);
                inner.local_stream = Some(local_stream.clone());
            }
        }
        attach_tracks(&mut inner, &peer).await?;

        let offer = peer.create_offer(OfferOptions::default()).await?;
        peer.set_local_description(offer.clone()).await?;
        debug!("Peer {} created local offer", peer.id());
        Ok(offer)
    }

    /// Apply the caller's offer, then flush queued candidates.
    pub async fn apply_remote_offer(&self, offer: SessionDescription) -> Result<(), CallError> {
        if offer.sdp_type != SdpType::Offer {
            return Err(CallError::Negotiation(format!(
                "expected an offer, got an {}",
                offer.sdp_type
            )));
        }
        let mut inner = self.inner.lock().await;
        let peer = inner.live_peer("apply_remote_offer")?;
        attach_tracks(&mut inner, &peer).await?;
        peer.set_remote_description(offer).await?;
        flush_pending(&mut inner, &peer).await;
        Ok(())
    }

    /// Create the answer to an applied remote offer and set it as the local
    /// description.
    pub async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let mut inner = self.inner.lock().await;
        let peer = inner.live_peer("create_answer")?;
        if !inner.remote_description_set || peer.signaling_state() != SignalingState::HaveRemoteOffer
        {
            return Err(CallError::invalid_state(
                "create_answer requires an applied remote offer",
            ));
        }
        attach_tracks(&mut inner, &peer).await?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        debug!("Peer {} created local answer", peer.id());
        Ok(answer)
    }

    /// Apply the callee's answer to our outstanding offer, then flush queued
    /// candidates.
    pub async fn apply_remote_answer(&self, answer: SessionDescription) -> Result<(), CallError> {
        if answer.sdp_type != SdpType::Answer {
            return Err(CallError::Negotiation(format!(
                "expected an answer, got an {}",
                answer.sdp_type
            )));
        }
        let mut inner = self.inner.lock().await;
        let peer = inner.live_peer("apply_remote_answer")?;
        let state = peer.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            return Err(CallError::Negotiation(format!(
                "no outstanding local offer (signaling state {state})"
            )));
        }
        peer.set_remote_description(answer).await?;
        flush_pending(&mut inner, &peer).await;
        Ok(())
    }

    /// Apply a remote candidate, or queue it if no remote description is set
    /// yet.
    pub async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let peer = inner.live_peer("add_remote_ice_candidate")?;
        if inner.remote_description_set {
            peer.add_ice_candidate(candidate).await?;
        } else {
            trace!("Queueing remote candidate until a remote description is set");
            inner.pending_candidates.push_back(candidate);
        }
        Ok(())
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open("set_muted")?;
        inner.audio_muted = muted;
        if let Some(stream) = &inner.local_stream {
            inner.apply_track_flags(stream);
        }
        Ok(())
    }

    pub async fn set_video_hidden(&self, hidden: bool) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open("set_video_hidden")?;
        inner.video_hidden = hidden;
        if let Some(stream) = &inner.local_stream {
            inner.apply_track_flags(stream);
        }
        Ok(())
    }

    /// Stop every track and close the peer connection. Safe to call more
    /// than once.
    pub async fn close(&self) {
        let (peer, pump, local) = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.generation += 1;
            self.live_generation.store(inner.generation, Ordering::Release);
            inner.pending_candidates.clear();
            inner.remote_description_set = false;
            (
                inner.peer.take(),
                inner.pump.take(),
                inner.local_stream.take(),
            )
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(local) = local {
            local.stop_all();
        }
        self.release_remote_stream();
        if let Some(peer) = peer {
            teardown(peer).await;
        }
        debug!("Media endpoint closed");
    }

    pub fn on_ice_candidate(
        &self,
        callback: impl Fn(IceCandidate) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.ice.add(Arc::new(callback))
    }

    pub fn on_remote_track(
        &self,
        callback: impl Fn(RemoteTrack) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.track.add(Arc::new(callback))
    }

    pub fn on_connection_state_change(
        &self,
        callback: impl Fn(PeerConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.state.add(Arc::new(callback))
    }

    pub async fn local_stream(&self) -> Option<Arc<MediaStream>> {
        self.inner.lock().await.local_stream.clone()
    }

    pub fn remote_stream(&self) -> Option<Arc<MediaStream>> {
        self.remote_stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Id of the peer connection currently owned, for diagnostics.
    pub async fn peer_connection_id(&self) -> Option<u64> {
        self.inner.lock().await.peer.as_ref().map(|p| p.id())
    }

    pub async fn pending_candidate_count(&self) -> usize {
        self.inner.lock().await.pending_candidates.len()
    }

    fn release_remote_stream(&self) {
        let remote = self
            .remote_stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(remote) = remote {
            remote.stop_all();
        }
    }
}

impl Drop for MediaEndpoint {
    fn drop(&mut self) {
        if let Some(pump) = self.inner.get_mut().pump.take() {
            pump.abort();
        }
    }
}

async fn attach_tracks(
    inner: &mut EndpointInner,
    peer: &Arc<dyn PeerConnection>,
) -> Result<(), CallError> {
    if inner.tracks_attached {
        return Ok(());
    }
    let Some(stream) = inner.local_stream.clone() else {
        return Ok(());
    };
    for track in stream.tracks() {
        peer.add_track(track).await?;
    }
    inner.tracks_attached = true;
    Ok(())
}

async fn flush_pending(inner: &mut EndpointInner, peer: &Arc<dyn PeerConnection>) {
    inner.remote_description_set = true;
    let pending = std::mem::take(&mut inner.pending_candidates);
    if !pending.is_empty() {
        debug!("Applying {} queued remote candidates", pending.len());
    }
    for candidate in pending {
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            warn!("Failed to apply queued ICE candidate: {e}");
        }
    }
}

async fn teardown(peer: Arc<dyn PeerConnection>) {
    if let Err(e) = peer.remove_all_senders().await {
        debug!("Removing senders from peer {} failed: {e}", peer.id());
    }
    if let Err(e) = peer.close().await {
        warn!("Closing peer {} failed: {e}", peer.id());
    }
}

async fn pump_events(
    generation: u64,
    live_generation: Arc<AtomicU64>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    listeners: Arc<EndpointListeners>,
    remote_stream: Arc<StdMutex<Option<Arc<MediaStream>>>>,
) {
    while let Some(event) = events.recv().await {
        if live_generation.load(Ordering::Acquire) != generation {
            trace!("Dropping event from superseded peer connection: {event:?}");
            break;
        }
        match event {
            PeerEvent::IceCandidate(candidate) => listeners.ice.emit(candidate),
            PeerEvent::Track(track) => {
                let stream = {
                    let mut slot = remote_stream.lock().unwrap_or_else(PoisonError::into_inner);
                    // A reset may have landed since the check above.
                    if live_generation.load(Ordering::Acquire) != generation {
                        trace!("Dropping track from superseded peer connection");
                        break;
                    }
                    slot.get_or_insert_with(|| MediaStream::new(format!("remote-{generation}")))
                        .clone()
                };
                if stream.add_track(track.clone()) {
                    listeners.track.emit(RemoteTrack { track, stream });
                }
            }
            PeerEvent::ConnectionState(state) => listeners.state.emit(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::media::loopback::{LoopbackDevices, LoopbackPeerFactory};
    use std::time::Duration;

    fn endpoint() -> (MediaEndpoint, Arc<LoopbackDevices>, Arc<LoopbackPeerFactory>) {
        let devices = Arc::new(LoopbackDevices::new());
        let peers = Arc::new(LoopbackPeerFactory::new());
        let ep = MediaEndpoint::new(
            MediaBackend::new(devices.clone(), peers.clone()),
            PeerConfig::default(),
            MediaConstraints::default(),
        );
        (ep, devices, peers)
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(
            format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"),
            Some("0"),
            Some(0),
        )
    }

    /// An offer as a remote caller with one audio track would send it.
    async fn remote_offer() -> SessionDescription {
        let (caller, _, _) = endpoint();
        caller.reset().await.unwrap();
        let stream = caller.acquire_local_stream().await.unwrap();
        caller.create_offer(&stream).await.unwrap()
    }

    #[tokio::test]
    async fn test_operations_before_reset_fail_fast() {
        let (ep, _, _) = endpoint();
        let err = ep.create_answer().await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)));
        let err = ep.add_remote_ice_candidate(candidate(1)).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let (ep, devices, _) = endpoint();
        let first = ep.acquire_local_stream().await.unwrap();
        let second = ep.acquire_local_stream().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(devices.prompt_count(), 1);
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description_then_apply_in_order() {
        let (ep, _, peers) = endpoint();
        ep.reset().await.unwrap();
        for n in 1..=3 {
            ep.add_remote_ice_candidate(candidate(n)).await.unwrap();
        }
        assert_eq!(ep.pending_candidate_count().await, 3);
        let peer = peers.last().unwrap();
        assert!(peer.applied_candidates().is_empty());

        ep.acquire_local_stream().await.unwrap();
        ep.apply_remote_offer(remote_offer().await).await.unwrap();

        assert_eq!(ep.pending_candidate_count().await, 0);
        assert_eq!(
            peer.applied_candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );

        ep.add_remote_ice_candidate(candidate(4)).await.unwrap();
        assert_eq!(peer.applied_candidates().len(), 4);
    }

    #[tokio::test]
    async fn test_reset_swaps_peer_and_drops_queue() {
        let (ep, _, peers) = endpoint();
        ep.reset().await.unwrap();
        let first = ep.peer_connection_id().await.unwrap();
        ep.add_remote_ice_candidate(candidate(1)).await.unwrap();

        ep.reset().await.unwrap();
        let second = ep.peer_connection_id().await.unwrap();

        assert_ne!(first, second);
        assert_eq!(ep.pending_candidate_count().await, 0);
        let created = peers.created();
        assert_eq!(created.len(), 2);
        assert!(created[0].is_closed());
        assert!(!created[1].is_closed());
    }

    #[tokio::test]
    async fn test_create_answer_without_offer_is_invalid_state() {
        let (ep, _, _) = endpoint();
        ep.reset().await.unwrap();
        assert!(matches!(
            ep.create_answer().await,
            Err(CallError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_offer_receives_video_without_camera() {
        let devices = Arc::new(LoopbackDevices::new());
        let ep = MediaEndpoint::new(
            MediaBackend::new(devices, Arc::new(LoopbackPeerFactory::new())),
            PeerConfig::default(),
            MediaConstraints::audio_only(),
        );
        ep.reset().await.unwrap();
        let stream = ep.acquire_local_stream().await.unwrap();
        let offer = ep.create_offer(&stream).await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("a=recvonly"));
    }

    #[tokio::test]
    async fn test_local_candidates_reach_listener() {
        let (ep, _, _) = endpoint();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = ep.on_ice_candidate(move |c| {
            let _ = tx.send(c);
        });
        ep.reset().await.unwrap();
        let stream = ep.acquire_local_stream().await.unwrap();
        ep.create_offer(&stream).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(got.candidate.contains("typ host"));
    }

    #[tokio::test]
    async fn test_remote_tracks_share_one_stream() {
        let (ep, _, _) = endpoint();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = ep.on_remote_track(move |t| {
            let _ = tx.send(t);
        });
        ep.reset().await.unwrap();
        ep.apply_remote_offer(remote_offer().await).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&first.stream, &second.stream));
        assert_eq!(first.stream.tracks().len(), 2);
        assert!(Arc::ptr_eq(&ep.remote_stream().unwrap(), &first.stream));
    }

    #[tokio::test]
    async fn test_offer_in_wrong_state_attaches_nothing() {
        let (ep, _, peers) = endpoint();
        ep.reset().await.unwrap();
        ep.apply_remote_offer(remote_offer().await).await.unwrap();

        let (other, _, _) = endpoint();
        let stream = other.acquire_local_stream().await.unwrap();
        let err = ep.create_offer(&stream).await.unwrap_err();
        assert!(matches!(err, CallError::Negotiation(_)), "{err:?}");
        assert_eq!(peers.last().unwrap().sender_count(), 0);
        assert!(ep.local_stream().await.is_none());
    }

    #[tokio::test]
    async fn test_offer_refuses_a_foreign_stream() {
        let (ep, _, peers) = endpoint();
        ep.reset().await.unwrap();
        let held = ep.acquire_local_stream().await.unwrap();

        let (other, _, _) = endpoint();
        let foreign = other.acquire_local_stream().await.unwrap();
        let err = ep.create_offer(&foreign).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)), "{err:?}");
        assert_eq!(peers.last().unwrap().sender_count(), 0);

        ep.create_offer(&held).await.unwrap();
        assert_eq!(peers.last().unwrap().sender_count(), held.tracks().len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_track_after_reset_does_not_install_stale_stream() {
        let live = Arc::new(AtomicU64::new(1));
        let remote_stream = Arc::new(StdMutex::new(None));
        let listeners = Arc::new(EndpointListeners::default());
        let emitted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = emitted.clone();
        let _sub = listeners.track.add(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let (tx, rx) = mpsc::unbounded_channel();

        // Hold the stream slot so the pump stalls between its two checks,
        // then advance the generation as a reset would.
        let guard = remote_stream.lock().unwrap();
        let pump = tokio::spawn(pump_events(
            1,
            live.clone(),
            rx,
            listeners.clone(),
            remote_stream.clone(),
        ));
        tx.send(PeerEvent::Track(MediaTrack::remote(TrackKind::Audio, "a")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        live.store(2, Ordering::Release);
        drop(guard);

        tokio::time::timeout(Duration::from_secs(1), pump)
            .await
            .unwrap()
            .unwrap();
        assert!(remote_stream.lock().unwrap().is_none());
        assert_eq!(emitted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mute_toggles_local_audio() {
        let (ep, _, _) = endpoint();
        let stream = ep.acquire_local_stream().await.unwrap();
        ep.set_muted(true).await.unwrap();
        assert!(stream.tracks_of(TrackKind::Audio).iter().all(|t| !t.is_enabled()));
        assert!(stream.tracks_of(TrackKind::Video).iter().all(|t| t.is_enabled()));
        ep.set_video_hidden(true).await.unwrap();
        ep.set_muted(false).await.unwrap();
        assert!(stream.tracks_of(TrackKind::Audio).iter().all(|t| t.is_enabled()));
        assert!(stream.tracks_of(TrackKind::Video).iter().all(|t| !t.is_enabled()));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_devices_once() {
        let (ep, devices, peers) = endpoint();
        ep.reset().await.unwrap();
        ep.acquire_local_stream().await.unwrap();

        ep.close().await;
        ep.close().await;

        assert_eq!(devices.released_count(), 2);
        assert!(peers.last().unwrap().is_closed());
        assert!(ep.is_closed().await);
        assert!(matches!(
            ep.acquire_local_stream().await,
            Err(CallError::InvalidState(_))
        ));
        assert!(matches!(ep.reset().await, Err(CallError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_close_during_prompt_releases_late_stream() {
        let devices = Arc::new(LoopbackDevices::new().with_delay(Duration::from_millis(50)));
        let ep = Arc::new(MediaEndpoint::new(
            MediaBackend::new(devices.clone(), Arc::new(LoopbackPeerFactory::new())),
            PeerConfig::default(),
            MediaConstraints::default(),
        ));

        let pending = tokio::spawn({
            let ep = ep.clone();
            async move { ep.acquire_local_stream().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        ep.close().await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(CallError::InvalidState(_))));
        assert_eq!(devices.released_count(), 2);
    }
}
