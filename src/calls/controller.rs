//! Call lifecycle orchestration.
//!
//! [`CallSessionController`] owns at most one [`CallSession`] and the
//! [`MediaEndpoint`] serving it. Inbound work (signals, endpoint events,
//! timers) is queued to a single driver task and handled one item at a time.
//! UI operations run on the caller's task.
//!
//! The session lives behind a mutex that is never held across a signaling
//! send or a device prompt. Every step that awaits re-checks that its call
//! attempt is still the current one before acting on the result, so a hangup
//! or a remote `end-call` that lands mid-flight wins cleanly.

use chrono::Utc;
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;

use super::config::CallConfig;
use super::error::CallError;
use super::media::{MediaBackend, MediaEndpoint, MediaStream, PeerConnectionState, RemoteTrack};
use super::protocol::CallSignalingProtocol;
use super::state::{CallSession, CallState, CallTransition, Negotiation};
use crate::signaling::SignalingChannel;
use crate::subscription::Subscription;
use crate::types::events::{
    BusyNotice, CallSummary, EventBus, RemoteAccepted, RemoteMediaState, StateChange,
    StreamReady,
};
use crate::types::{
    CallId, EndReason, Envelope, IceCandidate, SessionDescription, SignalMessage, UserId,
};

enum ControllerInput {
    Signal(SignalMessage),
    Endpoint {
        call_id: CallId,
        event: EndpointEvent,
    },
    RingTimeout(CallId),
    ConnectTimeout(CallId),
}

enum EndpointEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    Connection(PeerConnectionState),
}

/// What to tell the peer when a call is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notify {
    Nobody,
    End,
    Reject,
}

/// Everything tied to the current call attempt.
#[derive(Default)]
struct Slot {
    session: Option<CallSession>,
    endpoint: Option<Arc<MediaEndpoint>>,
    /// The endpoint has a peer connection and can take remote candidates.
    endpoint_ready: bool,
    pending_offer: Option<SessionDescription>,
    /// Remote candidates received before the endpoint was ready.
    early_candidates: Vec<IceCandidate>,
    remote_stream_announced: bool,
    /// Caller only: local candidates wait until the offer is on the wire.
    offer_sent: bool,
    held_candidates: Vec<IceCandidate>,
    ring_timer: Option<JoinHandle<()>>,
    connect_timer: Option<JoinHandle<()>>,
    endpoint_subscriptions: Vec<Subscription>,
    audio_muted: bool,
    video_hidden: bool,
}

impl Slot {
    fn is_current(&self, call_id: &CallId) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| &session.call_id == call_id)
    }

    fn cancel_ring_timer(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }

    fn cancel_connect_timer(&mut self) {
        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
    }

    /// Drop all per-attempt data and hand back the endpoint for closing.
    fn clear_attempt(&mut self) -> Option<Arc<MediaEndpoint>> {
        self.cancel_ring_timer();
        self.cancel_connect_timer();
        self.endpoint_subscriptions.clear();
        self.endpoint_ready = false;
        self.pending_offer = None;
        self.early_candidates.clear();
        self.remote_stream_announced = false;
        self.offer_sent = false;
        self.held_candidates.clear();
        self.audio_muted = false;
        self.video_hidden = false;
        self.endpoint.take()
    }
}

/// Work left after a session has been removed from the slot.
struct Teardown {
    call_id: CallId,
    peer_id: UserId,
    endpoint: Option<Arc<MediaEndpoint>>,
}

struct ControllerInner {
    self_id: UserId,
    config: CallConfig,
    backend: MediaBackend,
    protocol: CallSignalingProtocol,
    events: EventBus,
    slot: Mutex<Slot>,
    inbox: mpsc::UnboundedSender<ControllerInput>,
    shut_down: AtomicBool,
    driver: StdMutex<Option<JoinHandle<()>>>,
}

/// Orchestrates one user's calls: at most one session at a time.
pub struct CallSessionController {
    inner: Arc<ControllerInner>,
}

impl CallSessionController {
    /// Create a controller for `self_id` and start listening for call events
    /// on `channel`. Must be called from within a Tokio runtime.
    pub fn new(
        self_id: impl Into<UserId>,
        channel: Arc<dyn SignalingChannel>,
        backend: MediaBackend,
        config: CallConfig,
    ) -> Self {
        let self_id = self_id.into();
        let (inbox, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ControllerInner {
            protocol: CallSignalingProtocol::new(self_id.clone(), channel),
            events: EventBus::with_capacity(config.event_capacity),
            self_id,
            config,
            backend,
            slot: Mutex::new(Slot::default()),
            inbox,
            shut_down: AtomicBool::new(false),
            driver: StdMutex::new(None),
        });

        let signals = inner.inbox.clone();
        inner.protocol.listen(move |msg| {
            let _ = signals.send(ControllerInput::Signal(msg));
        });
        let driver = tokio::spawn(drive(Arc::downgrade(&inner), rx));
        *inner.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(driver);

        info!("Call controller ready for {}", inner.self_id);
        Self { inner }
    }

    pub fn self_id(&self) -> &UserId {
        &self.inner.self_id
    }

    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }

    /// Broadcast channels for every controller event.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub async fn state(&self) -> CallState {
        self.inner
            .slot
            .lock()
            .await
            .session
            .as_ref()
            .map_or(CallState::Idle, |s| s.state)
    }

    pub async fn peer_id(&self) -> Option<UserId> {
        self.inner
            .slot
            .lock()
            .await
            .session
            .as_ref()
            .map(|s| s.peer_id.clone())
    }

    pub async fn current_call_id(&self) -> Option<CallId> {
        self.inner
            .slot
            .lock()
            .await
            .session
            .as_ref()
            .map(|s| s.call_id.clone())
    }

    pub async fn current_session(&self) -> Option<CallSession> {
        self.inner.slot.lock().await.session.clone()
    }

    /// The endpoint serving the current call, if one has been created.
    pub async fn endpoint(&self) -> Option<Arc<MediaEndpoint>> {
        self.inner.slot.lock().await.endpoint.clone()
    }

    /// Start an outgoing call.
    ///
    /// Fails with [`CallError::CallBusy`] if any session exists. Returns the
    /// new call id once the offer is on its way; if the call is ended while
    /// it is being set up, returns `Ok` and the end is reported through the
    /// state events.
    pub async fn initiate_call(&self, peer_id: impl Into<UserId>) -> Result<CallId, CallError> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let peer_id = peer_id.into();
        if peer_id == inner.self_id {
            return Err(CallError::invalid_state("cannot call yourself"));
        }

        let call_id = CallId::generate();
        let endpoint = {
            let mut slot = inner.slot.lock().await;
            if let Some(existing) = &slot.session {
                info!(
                    "Refusing call to {peer_id}: call {} with {} is {}",
                    existing.call_id, existing.peer_id, existing.state
                );
                return Err(CallError::CallBusy);
            }
            slot.session = Some(CallSession::new_outgoing(call_id.clone(), peer_id.clone()));
            let endpoint = inner.install_endpoint(&mut slot, &call_id).await;
            inner.emit_state(slot.session.as_ref(), None, None);
            endpoint
        };
        info!("Calling {peer_id} (call {call_id})");

        match inner.start_outgoing(&call_id, &peer_id, &endpoint).await {
            Ok(()) => Ok(call_id),
            Err(err) => match inner.abort_attempt(&call_id, err, Notify::Nobody).await {
                Some(err) => Err(err),
                None => Ok(call_id),
            },
        }
    }

    /// Accept the ringing incoming call.
    ///
    /// Sends `call-accepted` first so the caller can stop ringing, then
    /// acquires media and answers. The call becomes `Active` only once the
    /// media path connects.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        inner.ensure_running()?;

        let (call_id, peer_id, offer, endpoint) = {
            let mut slot = inner.slot.lock().await;
            let session = slot
                .session
                .as_mut()
                .ok_or_else(|| CallError::invalid_state("no incoming call to accept"))?;
            if session.state != CallState::RingingIn || session.negotiation != Negotiation::Pending
            {
                return Err(CallError::invalid_state(format!(
                    "cannot accept while {} ({:?})",
                    session.state, session.negotiation
                )));
            }
            session.apply_transition(CallTransition::LocalAccepted)?;
            let call_id = session.call_id.clone();
            let peer_id = session.peer_id.clone();
            let Some(offer) = slot.pending_offer.take() else {
                return Err(CallError::invalid_state("incoming call has no offer"));
            };
            let endpoint = inner.install_endpoint(&mut slot, &call_id).await;
            (call_id, peer_id, offer, endpoint)
        };
        info!("Accepting call {call_id} from {peer_id}");

        match inner
            .start_incoming(&call_id, &peer_id, offer, &endpoint)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => match inner.abort_attempt(&call_id, err, Notify::End).await {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    /// Decline the ringing incoming call.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let teardown = {
            let mut slot = inner.slot.lock().await;
            match &slot.session {
                Some(session) if session.state == CallState::RingingIn => {}
                Some(session) => {
                    return Err(CallError::invalid_state(format!(
                        "cannot reject while {}",
                        session.state
                    )));
                }
                None => return Err(CallError::invalid_state("no incoming call to reject")),
            }
            inner.finish_locked(&mut slot, EndReason::Declined, None)
        };
        if let Some(teardown) = teardown {
            inner.complete_teardown(teardown, Notify::Reject).await;
        }
        Ok(())
    }

    /// End the current call, whatever its state.
    pub async fn hangup(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let teardown = {
            let mut slot = inner.slot.lock().await;
            if slot.session.is_none() {
                return Err(CallError::invalid_state("no call to hang up"));
            }
            inner.finish_locked(&mut slot, EndReason::LocalHangup, None)
        };
        if let Some(teardown) = teardown {
            inner.complete_teardown(teardown, Notify::End).await;
        }
        Ok(())
    }

    /// Mute or unmute the microphone and tell the peer.
    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.inner.update_media_state(Some(muted), None).await
    }

    /// Hide or show the camera and tell the peer.
    pub async fn set_video_hidden(&self, hidden: bool) -> Result<(), CallError> {
        self.inner.update_media_state(None, Some(hidden)).await
    }

    pub fn on_state_change(
        &self,
        callback: impl Fn(&StateChange) + Send + 'static,
    ) -> Subscription {
        forward(self.inner.events.state.subscribe(), callback)
    }

    pub fn on_local_stream(
        &self,
        callback: impl Fn(&StreamReady) + Send + 'static,
    ) -> Subscription {
        forward(self.inner.events.local_stream.subscribe(), callback)
    }

    pub fn on_remote_stream(
        &self,
        callback: impl Fn(&StreamReady) + Send + 'static,
    ) -> Subscription {
        forward(self.inner.events.remote_stream.subscribe(), callback)
    }

    /// End any call with [`EndReason::Shutdown`] and stop listening. Later
    /// operations fail with [`CallError::InvalidState`]. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.protocol.stop();
        let teardown = {
            let mut slot = inner.slot.lock().await;
            inner.finish_locked(&mut slot, EndReason::Shutdown, None)
        };
        if let Some(teardown) = teardown {
            inner.complete_teardown(teardown, Notify::End).await;
        }
        let driver = inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            driver.abort();
        }
        info!("Call controller for {} shut down", inner.self_id);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for CallSessionController {
    fn drop(&mut self) {
        self.inner.protocol.stop();
        let driver = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            driver.abort();
        }
    }
}

/// Run `callback` for every event on `rx` until the subscription is dropped.
fn forward<T: Send + Sync + 'static>(
    mut rx: broadcast::Receiver<Arc<T>>,
    callback: impl Fn(&T) + Send + 'static,
) -> Subscription {
    let task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => callback(event.as_ref()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Call event listener lagged, {skipped} events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    Subscription::new(move || task.abort())
}

/// Listener that queues endpoint events for the driver, tagged with the
/// attempt they belong to.
fn route<T: 'static>(
    inbox: mpsc::UnboundedSender<ControllerInput>,
    call_id: CallId,
    wrap: fn(T) -> EndpointEvent,
) -> impl Fn(T) + Send + Sync + 'static {
    move |value| {
        let _ = inbox.send(ControllerInput::Endpoint {
            call_id: call_id.clone(),
            event: wrap(value),
        });
    }
}

async fn drive(weak: Weak<ControllerInner>, mut rx: mpsc::UnboundedReceiver<ControllerInput>) {
    while let Some(input) = rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if inner.shut_down.load(Ordering::SeqCst) {
            break;
        }
        inner.handle_input(input).await;
    }
    debug!("Call controller driver stopped");
}

impl ControllerInner {
    fn ensure_running(&self) -> Result<(), CallError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(CallError::invalid_state("call controller is shut down"));
        }
        Ok(())
    }

    async fn is_current(&self, call_id: &CallId) -> bool {
        self.slot.lock().await.is_current(call_id)
    }

    fn emit_state(
        &self,
        session: Option<&CallSession>,
        reason: Option<EndReason>,
        error: Option<String>,
    ) {
        let change = match session {
            Some(session) => StateChange {
                state: session.state,
                call_id: Some(session.call_id.clone()),
                peer_id: Some(session.peer_id.clone()),
                reason,
                error,
            },
            None => StateChange::idle(),
        };
        debug!("Call state -> {}", change.state);
        let _ = self.events.state.send(Arc::new(change));
    }

    fn spawn_timer(&self, delay: Duration, input: ControllerInput) -> JoinHandle<()> {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(input);
        })
    }

    /// Create the endpoint for `call_id` and route its events to the driver.
    async fn install_endpoint(&self, slot: &mut Slot, call_id: &CallId) -> Arc<MediaEndpoint> {
        let endpoint = Arc::new(MediaEndpoint::new(
            self.backend.clone(),
            self.config.peer_config(),
            self.config.media,
        ));

        let inbox = &self.inbox;
        slot.endpoint_subscriptions = vec![
            endpoint.on_ice_candidate(route(
                inbox.clone(),
                call_id.clone(),
                EndpointEvent::LocalCandidate,
            )),
            endpoint.on_remote_track(route(
                inbox.clone(),
                call_id.clone(),
                EndpointEvent::RemoteTrack,
            )),
            endpoint.on_connection_state_change(route(
                inbox.clone(),
                call_id.clone(),
                EndpointEvent::Connection,
            )),
        ];

        // Mute state chosen while ringing carries over to the new tracks.
        if slot.audio_muted {
            let _ = endpoint.set_muted(true).await;
        }
        if slot.video_hidden {
            let _ = endpoint.set_video_hidden(true).await;
        }
        slot.endpoint = Some(endpoint.clone());
        endpoint
    }

    /// Mark the endpoint ready for remote candidates and hand it the ones
    /// that arrived early. Returns `false` if the attempt is no longer
    /// current.
    async fn endpoint_ready(&self, call_id: &CallId) -> Result<bool, CallError> {
        let mut slot = self.slot.lock().await;
        if !slot.is_current(call_id) {
            return Ok(false);
        }
        slot.endpoint_ready = true;
        let early = std::mem::take(&mut slot.early_candidates);
        if let Some(endpoint) = slot.endpoint.clone() {
            if !early.is_empty() {
                debug!("Feeding {} early candidates for call {call_id}", early.len());
            }
            for candidate in early {
                endpoint.add_remote_ice_candidate(candidate).await?;
            }
        }
        Ok(true)
    }

    async fn announce_local_stream(
        &self,
        call_id: &CallId,
        peer_id: &UserId,
        stream: &Arc<MediaStream>,
    ) -> bool {
        let slot = self.slot.lock().await;
        if !slot.is_current(call_id) {
            return false;
        }
        let _ = self.events.local_stream.send(Arc::new(StreamReady {
            call_id: call_id.clone(),
            peer_id: peer_id.clone(),
            stream: stream.clone(),
        }));
        true
    }

    async fn start_outgoing(
        &self,
        call_id: &CallId,
        peer_id: &UserId,
        endpoint: &MediaEndpoint,
    ) -> Result<(), CallError> {
        endpoint.reset().await?;
        if !self.endpoint_ready(call_id).await? {
            return Ok(());
        }

        let stream = endpoint.acquire_local_stream().await?;
        if !self.announce_local_stream(call_id, peer_id, &stream).await {
            return Ok(());
        }

        let offer = endpoint.create_offer(&stream).await?;
        if !self.is_current(call_id).await {
            return Ok(());
        }
        self.protocol.send_offer(peer_id, call_id, offer).await?;

        let held = {
            let mut slot = self.slot.lock().await;
            if !slot.is_current(call_id) {
                return Ok(());
            }
            slot.offer_sent = true;
            let still_ringing = slot.session.as_ref().is_some_and(|s| {
                s.state == CallState::RingingOut && s.negotiation == Negotiation::Pending
            });
            if still_ringing {
                slot.ring_timer = Some(self.spawn_timer(
                    self.config.ring_timeout(),
                    ControllerInput::RingTimeout(call_id.clone()),
                ));
            }
            std::mem::take(&mut slot.held_candidates)
        };
        for candidate in held {
            if let Err(e) = self
                .protocol
                .send_ice_candidate(peer_id, call_id, candidate)
                .await
            {
                warn!("Failed to send ICE candidate for call {call_id}: {e}");
            }
        }
        Ok(())
    }

    async fn start_incoming(
        &self,
        call_id: &CallId,
        peer_id: &UserId,
        offer: SessionDescription,
        endpoint: &MediaEndpoint,
    ) -> Result<(), CallError> {
        self.protocol.send_accepted(peer_id, call_id).await?;

        endpoint.reset().await?;
        if !self.endpoint_ready(call_id).await? {
            return Ok(());
        }

        let stream = endpoint.acquire_local_stream().await?;
        if !self.announce_local_stream(call_id, peer_id, &stream).await {
            return Ok(());
        }

        endpoint.apply_remote_offer(offer).await?;
        if !self.is_current(call_id).await {
            return Ok(());
        }

        let answer = endpoint.create_answer().await?;
        {
            let mut slot = self.slot.lock().await;
            if !slot.is_current(call_id) {
                return Ok(());
            }
            let connected = match slot.session.as_mut() {
                // The media path may already be up.
                Some(session) if session.state == CallState::Active => true,
                Some(session) => {
                    session.apply_transition(CallTransition::AnswerSent)?;
                    false
                }
                None => return Ok(()),
            };
            if !connected {
                slot.cancel_ring_timer();
                slot.connect_timer = Some(self.spawn_timer(
                    self.config.connect_timeout(),
                    ControllerInput::ConnectTimeout(call_id.clone()),
                ));
            }
        }
        self.protocol.send_answer(peer_id, call_id, answer).await?;
        Ok(())
    }

    /// End the attempt after a failed operation. Returns the error if the
    /// attempt was still current, or `None` if it had already been ended
    /// by someone else.
    async fn abort_attempt(
        &self,
        call_id: &CallId,
        err: CallError,
        notify: Notify,
    ) -> Option<CallError> {
        let teardown = {
            let mut slot = self.slot.lock().await;
            if !slot.is_current(call_id) {
                debug!("Call {call_id} ended while in progress: {err}");
                return None;
            }
            if err.is_contract_violation() {
                error!("Call {call_id} failed: {err}");
            } else {
                warn!("Call {call_id} failed: {err}");
            }
            self.finish_locked(&mut slot, err.end_reason(), Some(err.to_string()))
        };
        if let Some(teardown) = teardown {
            self.complete_teardown(teardown, notify).await;
        }
        Some(err)
    }

    /// End `call_id` if it is current.
    async fn end_call(
        &self,
        call_id: &CallId,
        reason: EndReason,
        error: Option<String>,
        notify: Notify,
    ) {
        let teardown = {
            let mut slot = self.slot.lock().await;
            if !slot.is_current(call_id) {
                return;
            }
            self.finish_locked(&mut slot, reason, error)
        };
        if let Some(teardown) = teardown {
            self.complete_teardown(teardown, notify).await;
        }
    }

    /// Move the session to `Ended`, report it, then report `Idle`. The
    /// endpoint is closed afterwards by [`Self::complete_teardown`], outside
    /// the lock.
    fn finish_locked(
        &self,
        slot: &mut Slot,
        reason: EndReason,
        error: Option<String>,
    ) -> Option<Teardown> {
        let mut session = slot.session.take()?;
        let endpoint = slot.clear_attempt();
        if let Err(e) = session.apply_transition(CallTransition::Terminated { reason }) {
            warn!("{e}");
        }
        info!(
            "Call {} with {} ended: {reason}",
            session.call_id, session.peer_id
        );

        self.emit_state(Some(&session), Some(reason), error);
        let _ = self.events.call_ended.send(Arc::new(CallSummary {
            call_id: session.call_id.clone(),
            peer_id: session.peer_id.clone(),
            direction: session.direction,
            reason,
            created_at: session.created_at,
            connected_at: session.connected_at,
            ended_at: session.ended_at.unwrap_or_else(Utc::now),
            duration_secs: session.duration_secs(),
        }));
        self.emit_state(None, None, None);

        Some(Teardown {
            call_id: session.call_id,
            peer_id: session.peer_id,
            endpoint,
        })
    }

    async fn complete_teardown(&self, teardown: Teardown, notify: Notify) {
        let Teardown {
            call_id,
            peer_id,
            endpoint,
        } = teardown;
        let sent = match notify {
            Notify::Nobody => Ok(()),
            Notify::End => self.protocol.send_end(&peer_id, &call_id).await,
            Notify::Reject => self.protocol.send_reject(&peer_id, &call_id).await,
        };
        if let Err(e) = sent {
            warn!("Failed to notify {peer_id} that call {call_id} ended: {e}");
        }
        if let Some(endpoint) = endpoint {
            endpoint.close().await;
        }
    }

    async fn update_media_state(
        &self,
        muted: Option<bool>,
        hidden: Option<bool>,
    ) -> Result<(), CallError> {
        self.ensure_running()?;
        let (endpoint, call_id, peer_id, audio_muted, video_hidden) = {
            let mut slot = self.slot.lock().await;
            let Some(session) = slot.session.as_ref() else {
                return Err(CallError::invalid_state("no call in progress"));
            };
            let (call_id, peer_id) = (session.call_id.clone(), session.peer_id.clone());
            if let Some(muted) = muted {
                slot.audio_muted = muted;
            }
            if let Some(hidden) = hidden {
                slot.video_hidden = hidden;
            }
            (
                slot.endpoint.clone(),
                call_id,
                peer_id,
                slot.audio_muted,
                slot.video_hidden,
            )
        };

        if let Some(endpoint) = endpoint {
            let applied = match (muted, hidden) {
                (Some(muted), _) => endpoint.set_muted(muted).await,
                (_, Some(hidden)) => endpoint.set_video_hidden(hidden).await,
                (None, None) => Ok(()),
            };
            if let Err(e) = applied {
                if !self.is_current(&call_id).await {
                    return Ok(());
                }
                return Err(e);
            }
        }
        self.protocol
            .send_media_state(&peer_id, &call_id, audio_muted, video_hidden)
            .await
    }

    async fn handle_input(&self, input: ControllerInput) {
        match input {
            ControllerInput::Signal(msg) => self.handle_signal(msg).await,
            ControllerInput::Endpoint { call_id, event } => {
                self.handle_endpoint_event(call_id, event).await
            }
            ControllerInput::RingTimeout(call_id) => self.handle_ring_timeout(call_id).await,
            ControllerInput::ConnectTimeout(call_id) => {
                self.handle_connect_timeout(call_id).await
            }
        }
    }

    async fn handle_signal(&self, msg: SignalMessage) {
        match msg {
            SignalMessage::Offer { envelope, offer } => self.on_offer(envelope, offer).await,
            SignalMessage::Answer { envelope, answer } => self.on_answer(envelope, answer).await,
            SignalMessage::Accepted { envelope } => self.on_accepted(envelope).await,
            SignalMessage::IceCandidate {
                envelope,
                candidate,
            } => self.on_remote_candidate(envelope, candidate).await,
            SignalMessage::Reject { envelope } => {
                self.on_remote_end(envelope, EndReason::Rejected).await
            }
            SignalMessage::End { envelope } => {
                self.on_remote_end(envelope, EndReason::RemoteHangup).await
            }
            SignalMessage::MediaState {
                envelope,
                audio_muted,
                video_hidden,
            } => self.on_media_state(envelope, audio_muted, video_hidden).await,
        }
    }

    async fn on_offer(&self, envelope: Envelope, offer: SessionDescription) {
        let Some(call_id) = envelope.call_id else {
            return;
        };
        let from = envelope.from_id;

        let replaced = {
            let mut slot = self.slot.lock().await;
            let replaced = match &slot.session {
                None => None,
                Some(existing) if existing.call_id == call_id => {
                    debug!("Duplicate offer for call {call_id}");
                    return;
                }
                Some(existing)
                    if existing.peer_id == from && existing.state == CallState::RingingIn =>
                {
                    info!(
                        "{from} sent a new offer (call {call_id}), replacing pending call {}",
                        existing.call_id
                    );
                    slot.session = None;
                    Some(slot.clear_attempt())
                }
                Some(existing) => {
                    info!(
                        "Busy: ignoring call {call_id} from {from} during call with {}",
                        existing.peer_id
                    );
                    let _ = self.events.busy.send(Arc::new(BusyNotice {
                        from,
                        call_id,
                    }));
                    return;
                }
            };

            info!("Incoming call {call_id} from {from}");
            slot.session = Some(CallSession::new_incoming(call_id.clone(), from));
            slot.pending_offer = Some(offer);
            slot.ring_timer = Some(self.spawn_timer(
                self.config.ring_timeout(),
                ControllerInput::RingTimeout(call_id),
            ));
            self.emit_state(slot.session.as_ref(), None, None);
            replaced.flatten()
        };

        if let Some(endpoint) = replaced {
            endpoint.close().await;
        }
    }

    async fn on_answer(&self, envelope: Envelope, answer: SessionDescription) {
        let Some(call_id) = envelope.call_id else {
            return;
        };
        let endpoint = {
            let mut slot = self.slot.lock().await;
            let Some(session) = slot.session.as_mut() else {
                debug!("Ignoring answer for call {call_id}: no call in progress");
                return;
            };
            if !session.matches(&envelope.from_id, Some(&call_id))
                || session.state != CallState::RingingOut
            {
                debug!("Ignoring stale answer for call {call_id}");
                return;
            }
            if let Err(e) = session.apply_transition(CallTransition::AnswerApplied) {
                debug!("Ignoring answer for call {call_id}: {e}");
                return;
            }
            slot.cancel_ring_timer();
            if slot.connect_timer.is_none() {
                slot.connect_timer = Some(self.spawn_timer(
                    self.config.connect_timeout(),
                    ControllerInput::ConnectTimeout(call_id.clone()),
                ));
            }
            slot.endpoint.clone()
        };

        let Some(endpoint) = endpoint else {
            return;
        };
        if let Err(err) = endpoint.apply_remote_answer(answer).await {
            self.abort_attempt(&call_id, err, Notify::End).await;
        }
    }

    async fn on_accepted(&self, envelope: Envelope) {
        let Some(call_id) = envelope.call_id else {
            return;
        };
        let mut slot = self.slot.lock().await;
        let Some(session) = slot.session.as_mut() else {
            return;
        };
        if !session.matches(&envelope.from_id, Some(&call_id))
            || session.state != CallState::RingingOut
        {
            debug!("Ignoring stale call-accepted for {call_id}");
            return;
        }
        if session.apply_transition(CallTransition::RemoteAccepted).is_err() {
            // The answer overtook the acceptance notice.
            trace!("call-accepted for {call_id} arrived after the answer");
            return;
        }
        let peer_id = session.peer_id.clone();
        info!("{peer_id} accepted call {call_id}");

        slot.cancel_ring_timer();
        if slot.connect_timer.is_none() {
            slot.connect_timer = Some(self.spawn_timer(
                self.config.connect_timeout(),
                ControllerInput::ConnectTimeout(call_id.clone()),
            ));
        }
        let _ = self
            .events
            .remote_accepted
            .send(Arc::new(RemoteAccepted { call_id, peer_id }));
    }

    async fn on_remote_candidate(&self, envelope: Envelope, candidate: IceCandidate) {
        let Some(call_id) = envelope.call_id else {
            return;
        };
        let endpoint = {
            let mut slot = self.slot.lock().await;
            let current = slot
                .session
                .as_ref()
                .is_some_and(|s| s.matches(&envelope.from_id, Some(&call_id)));
            if !current {
                debug!("Discarding candidate for stale call {call_id}");
                return;
            }
            if !slot.endpoint_ready {
                trace!("Holding early candidate for call {call_id}");
                slot.early_candidates.push(candidate);
                return;
            }
            slot.endpoint.clone()
        };

        if let Some(endpoint) = endpoint {
            if let Err(e) = endpoint.add_remote_ice_candidate(candidate).await {
                warn!("Failed to apply remote candidate for call {call_id}: {e}");
            }
        }
    }

    async fn on_remote_end(&self, envelope: Envelope, reason: EndReason) {
        let teardown = {
            let mut slot = self.slot.lock().await;
            let current = slot
                .session
                .as_ref()
                .is_some_and(|s| s.matches(&envelope.from_id, envelope.call_id.as_ref()));
            if !current {
                debug!(
                    "Ignoring {reason} from {} for stale call {:?}",
                    envelope.from_id, envelope.call_id
                );
                return;
            }
            self.finish_locked(&mut slot, reason, None)
        };
        if let Some(teardown) = teardown {
            self.complete_teardown(teardown, Notify::Nobody).await;
        }
    }

    async fn on_media_state(&self, envelope: Envelope, audio_muted: bool, video_hidden: bool) {
        let Some(call_id) = envelope.call_id else {
            return;
        };
        let slot = self.slot.lock().await;
        let current = slot
            .session
            .as_ref()
            .is_some_and(|s| s.matches(&envelope.from_id, Some(&call_id)));
        if !current {
            return;
        }
        let _ = self
            .events
            .remote_media_state
            .send(Arc::new(RemoteMediaState {
                call_id,
                peer_id: envelope.from_id,
                audio_muted,
                video_hidden,
            }));
    }

    async fn handle_endpoint_event(&self, call_id: CallId, event: EndpointEvent) {
        match event {
            EndpointEvent::LocalCandidate(candidate) => {
                let peer_id = {
                    let mut slot = self.slot.lock().await;
                    let (peer_id, initiator) = match slot.session.as_ref() {
                        Some(s) if s.call_id == call_id => (s.peer_id.clone(), s.is_initiator()),
                        _ => return,
                    };
                    if initiator && !slot.offer_sent {
                        slot.held_candidates.push(candidate);
                        return;
                    }
                    peer_id
                };
                if let Err(e) = self
                    .protocol
                    .send_ice_candidate(&peer_id, &call_id, candidate)
                    .await
                {
                    warn!("Failed to send ICE candidate for call {call_id}: {e}");
                }
            }
            EndpointEvent::RemoteTrack(remote) => {
                let mut slot = self.slot.lock().await;
                let Some(peer_id) = slot
                    .session
                    .as_ref()
                    .filter(|s| s.call_id == call_id)
                    .map(|s| s.peer_id.clone())
                else {
                    return;
                };
                debug!(
                    "Remote {} track {} for call {call_id}",
                    remote.track.kind(),
                    remote.track.id()
                );
                if !slot.remote_stream_announced {
                    slot.remote_stream_announced = true;
                    let _ = self.events.remote_stream.send(Arc::new(StreamReady {
                        call_id,
                        peer_id,
                        stream: remote.stream,
                    }));
                }
            }
            EndpointEvent::Connection(PeerConnectionState::Connected) => {
                let mut slot = self.slot.lock().await;
                let Some(session) = slot.session.as_mut().filter(|s| s.call_id == call_id) else {
                    return;
                };
                if let Err(e) = session.apply_transition(CallTransition::MediaConnected) {
                    debug!("Ignoring connected event for call {call_id}: {e}");
                    return;
                }
                info!("Call {call_id} connected");
                slot.cancel_ring_timer();
                slot.cancel_connect_timer();
                self.emit_state(slot.session.as_ref(), None, None);
            }
            EndpointEvent::Connection(PeerConnectionState::Failed) => {
                self.end_call(
                    &call_id,
                    EndReason::ConnectFailed,
                    Some("peer connection failed".into()),
                    Notify::End,
                )
                .await;
            }
            EndpointEvent::Connection(PeerConnectionState::Disconnected) => {
                warn!("Media path for call {call_id} disconnected");
            }
            EndpointEvent::Connection(state) => {
                trace!("Call {call_id} peer connection {state:?}");
            }
        }
    }

    async fn handle_ring_timeout(&self, call_id: CallId) {
        let notify = {
            let slot = self.slot.lock().await;
            match slot.session.as_ref() {
                Some(s) if s.call_id == call_id && s.negotiation == Negotiation::Pending => {
                    match s.state {
                        CallState::RingingOut => Notify::End,
                        // Missed call: the caller times out on its own.
                        CallState::RingingIn => Notify::Nobody,
                        _ => return,
                    }
                }
                _ => return,
            }
        };
        let err = CallError::SignalingTimeout(self.config.ring_timeout());
        info!("Call {call_id}: {err}");
        self.end_call(&call_id, EndReason::RingTimeout, Some(err.to_string()), notify)
            .await;
    }

    async fn handle_connect_timeout(&self, call_id: CallId) {
        let pending = self
            .slot
            .lock()
            .await
            .session
            .as_ref()
            .is_some_and(|s| s.call_id == call_id && s.state != CallState::Active);
        if !pending {
            return;
        }
        let msg = format!(
            "media did not connect within {}s",
            self.config.connect_timeout_secs
        );
        warn!("Call {call_id}: {msg}");
        self.end_call(&call_id, EndReason::ConnectFailed, Some(msg), Notify::End)
            .await;
    }
}
