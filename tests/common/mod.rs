//! Shared helpers for call integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use peercall::calls::media::loopback::{LoopbackDevices, LoopbackPeerFactory};
use peercall::calls::media::{PeerConfig, PeerConnection, PeerConnectionFactory};
use peercall::calls::{CallConfig, CallSessionController, CallState, MediaBackend};
use peercall::signaling::{LoopbackHub, SignalHandler, SignalingChannel};
use peercall::subscription::{ListenerSet, Subscription};
use peercall::types::events::StateChange;
use peercall::types::{CallId, Envelope, IceCandidate, SessionDescription, SignalMessage, UserId};

pub const WAIT: Duration = Duration::from_secs(5);

/// A user with inspectable loopback devices and peer connections.
pub struct TestUser {
    pub controller: Arc<CallSessionController>,
    pub devices: Arc<LoopbackDevices>,
    pub peers: Arc<LoopbackPeerFactory>,
}

impl TestUser {
    pub fn on_hub(hub: &Arc<LoopbackHub>, name: &str) -> Self {
        Self::with_backend(
            hub,
            name,
            LoopbackDevices::new(),
            LoopbackPeerFactory::new(),
            CallConfig::default(),
        )
    }

    pub fn with_backend(
        hub: &Arc<LoopbackHub>,
        name: &str,
        devices: LoopbackDevices,
        peers: LoopbackPeerFactory,
        config: CallConfig,
    ) -> Self {
        Self::on_channel(hub.connect(name), name, devices, peers, config)
    }

    pub fn on_channel(
        channel: Arc<dyn SignalingChannel>,
        name: &str,
        devices: LoopbackDevices,
        peers: LoopbackPeerFactory,
        config: CallConfig,
    ) -> Self {
        let devices = Arc::new(devices);
        let peers = Arc::new(peers);
        let controller = Arc::new(CallSessionController::new(
            name,
            channel,
            MediaBackend::new(devices.clone(), peers.clone()),
            config,
        ));
        Self {
            controller,
            devices,
            peers,
        }
    }

    pub fn states(&self) -> broadcast::Receiver<Arc<StateChange>> {
        self.controller.events().state.subscribe()
    }

    /// Accept every incoming call as soon as it rings.
    pub fn auto_accept(&self) -> tokio::task::JoinHandle<()> {
        let controller = self.controller.clone();
        let mut states = self.states();
        tokio::spawn(async move {
            while let Ok(change) = states.recv().await {
                if change.state == CallState::RingingIn {
                    let _ = controller.accept_call().await;
                }
            }
        })
    }
}

/// Wait for the next state change into `state`, skipping others.
pub async fn wait_for(
    states: &mut broadcast::Receiver<Arc<StateChange>>,
    state: CallState,
) -> Arc<StateChange> {
    tokio::time::timeout(WAIT, async {
        loop {
            let change = states.recv().await.expect("state bus closed");
            if change.state == state {
                return change;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
}

/// Poll `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Let spawned tasks drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// A channel driven by hand: outgoing events are recorded, incoming ones
/// are injected with [`ManualChannel::deliver`].
#[derive(Default)]
pub struct ManualChannel {
    sent: Mutex<Vec<(String, Value)>>,
    handlers: DashMap<String, Arc<ListenerSet<Value>>>,
}

impl ManualChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent_events(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    pub fn deliver(&self, msg: SignalMessage) {
        self.deliver_raw(msg.kind().event_name(), msg.to_payload().unwrap());
    }

    /// Inject a payload exactly as given, bypassing the message encoder.
    pub fn deliver_raw(&self, event: &str, payload: Value) {
        let set = self.handlers.get(event).map(|s| s.clone());
        if let Some(set) = set {
            set.emit(payload);
        }
    }
}

#[async_trait]
impl SignalingChannel for ManualChannel {
    async fn send(&self, event: &str, payload: Value) -> Result<(), anyhow::Error> {
        self.sent.lock().unwrap().push((event.to_string(), payload));
        Ok(())
    }

    fn on(&self, event: &str, handler: SignalHandler) -> Subscription {
        self.handlers
            .entry(event.to_string())
            .or_insert_with(|| Arc::new(ListenerSet::new()))
            .clone()
            .add(handler)
    }
}

pub fn envelope(from: &str, to: &str, call_id: &str) -> Envelope {
    Envelope::new(UserId::from(from), UserId::from(to), CallId::new(call_id))
}

/// A real offer from a throwaway loopback peer, with audio and video.
pub async fn loopback_offer() -> SessionDescription {
    let devices = LoopbackDevices::new();
    let stream = peercall::calls::media::MediaDevices::get_user_media(
        &devices,
        &Default::default(),
    )
    .await
    .unwrap();
    let (peer, _events) = LoopbackPeerFactory::new()
        .create(&PeerConfig::default())
        .await
        .unwrap();
    for track in stream.tracks() {
        peer.add_track(track).await.unwrap();
    }
    peer.create_offer(Default::default()).await.unwrap()
}

pub fn candidate(n: u16) -> IceCandidate {
    IceCandidate::new(
        format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
        Some("0"),
        Some(0),
    )
}
