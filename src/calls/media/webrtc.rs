//! Peer connections backed by webrtc-rs.
//!
//! Local [`MediaTrack`]s are bound to `TrackLocalStaticSample` outputs
//! (Opus for audio, VP8 for video). The capture pipeline feeds encoded
//! frames through [`WebRtcPeerFactory::write_sample`]; frames for a disabled
//! track are dropped, which is what mute and camera-off mean on the wire.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::peer::{
    IceServer, OfferOptions, PeerConfig, PeerConnection, PeerConnectionFactory,
    PeerConnectionState, PeerEvent, SignalingState, next_peer_id,
};
use super::stream::{MediaTrack, TrackKind};
use crate::calls::error::PeerError;
use crate::types::{IceCandidate, SessionDescription};

impl From<webrtc::Error> for PeerError {
    fn from(err: webrtc::Error) -> Self {
        PeerError::Backend(err.to_string())
    }
}

/// Outgoing sample tracks keyed by the local [`MediaTrack`] id, tagged with
/// the owning peer connection.
type SampleTracks = DashMap<String, Vec<(u64, Arc<TrackLocalStaticSample>)>>;

pub struct WebRtcPeerFactory {
    api: API,
    sample_tracks: Arc<SampleTracks>,
}

impl WebRtcPeerFactory {
    pub fn new() -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            sample_tracks: Arc::new(DashMap::new()),
        })
    }

    /// Send one encoded frame of `track` to every peer connection it is
    /// attached to. Frames of disabled or ended tracks are dropped.
    pub async fn write_sample(
        &self,
        track: &MediaTrack,
        data: Bytes,
        duration: Duration,
    ) -> Result<(), PeerError> {
        if !track.is_enabled() || track.is_ended() {
            return Ok(());
        }
        let outputs: Vec<Arc<TrackLocalStaticSample>> = self
            .sample_tracks
            .get(track.id())
            .map(|bound| bound.iter().map(|(_, out)| out.clone()).collect())
            .unwrap_or_default();

        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        for output in outputs {
            output.write_sample(&sample).await?;
        }
        Ok(())
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(PeerError::InvalidDescription(format!(
            "unsupported description type {other}"
        ))),
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let rtc = match desc.sdp_type {
        crate::types::SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        crate::types::SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await?);
        let id = next_peer_id();
        let (tx, rx) = mpsc::unbounded_channel();

        let ice_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = ice_tx.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_m_line_index: init.sdp_mline_index,
                            sdp_mid: init.sdp_mid,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {e}"),
                }
            })
        }));

        let track_tx = tx.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                let _ = track_tx.send(PeerEvent::Track(MediaTrack::remote(kind, track.id())));
            }
            Box::pin(async {})
        }));

        let state_tx = tx;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("Peer {id} connection state: {state}");
            let _ = state_tx.send(PeerEvent::ConnectionState(map_connection_state(state)));
            Box::pin(async {})
        }));

        let peer = WebRtcPeer {
            id,
            pc,
            sample_tracks: self.sample_tracks.clone(),
            negotiated: Mutex::new(Negotiated::default()),
        };
        Ok((Arc::new(peer), rx))
    }
}

struct Sender {
    kind: TrackKind,
    rtp: Arc<RTCRtpSender>,
}

#[derive(Default)]
struct Negotiated {
    senders: Vec<Sender>,
    recv_only_audio: bool,
    recv_only_video: bool,
}

pub struct WebRtcPeer {
    id: u64,
    pc: Arc<RTCPeerConnection>,
    sample_tracks: Arc<SampleTracks>,
    negotiated: Mutex<Negotiated>,
}

impl WebRtcPeer {
    fn unbind_sample_tracks(&self) {
        for mut bound in self.sample_tracks.iter_mut() {
            bound.retain(|(owner, _)| *owner != self.id);
        }
        self.sample_tracks.retain(|_, bound| !bound.is_empty());
    }

    async fn ensure_receive(
        &self,
        negotiated: &mut Negotiated,
        kind: TrackKind,
    ) -> Result<(), PeerError> {
        let has_sender = negotiated.senders.iter().any(|s| s.kind == kind);
        let added = match kind {
            TrackKind::Audio => &mut negotiated.recv_only_audio,
            TrackKind::Video => &mut negotiated.recv_only_video,
        };
        if has_sender || *added {
            return Ok(());
        }
        let codec_type = match kind {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        };
        self.pc
            .add_transceiver_from_kind(
                codec_type,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        *added = true;
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    fn id(&self) -> u64 {
        self.id
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
        }
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError> {
        let codec = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let output = Arc::new(TrackLocalStaticSample::new(
            codec,
            track.id().to_owned(),
            format!("peercall-{}", self.id),
        ));
        let rtp = self
            .pc
            .add_track(output.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        self.sample_tracks
            .entry(track.id().to_owned())
            .or_default()
            .push((self.id, output));
        self.negotiated.lock().await.senders.push(Sender {
            kind: track.kind(),
            rtp,
        });
        Ok(())
    }

    async fn remove_all_senders(&self) -> Result<(), PeerError> {
        let senders = std::mem::take(&mut self.negotiated.lock().await.senders);
        self.unbind_sample_tracks();
        for sender in senders {
            self.pc.remove_track(&sender.rtp).await?;
        }
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, PeerError> {
        {
            let mut negotiated = self.negotiated.lock().await;
            if options.receive_audio {
                self.ensure_receive(&mut negotiated, TrackKind::Audio).await?;
            }
            if options.receive_video {
                self.ensure_receive(&mut negotiated, TrackKind::Video).await?;
            }
        }
        let offer = self.pc.create_offer(None).await?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.unbind_sample_tracks();
        self.pc.close().await?;
        Ok(())
    }
}
