//! Call signaling over the relay channel.
//!
//! Outgoing messages are encoded into the JSON payloads peers expect;
//! incoming payloads are parsed, checked for addressing, de-duplicated and
//! handed to a single sink in arrival order.

use log::{debug, trace, warn};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use super::error::CallError;
use crate::signaling::SignalingChannel;
use crate::subscription::Subscription;
use crate::types::{
    CallId, Envelope, IceCandidate, SessionDescription, SignalKind, SignalMessage, UserId,
};

/// How many (kind, call id) pairs are remembered for duplicate detection.
const SEEN_CAPACITY: usize = 128;

#[derive(Default)]
struct SeenSignals {
    order: VecDeque<(SignalKind, CallId)>,
    set: HashSet<(SignalKind, CallId)>,
}

impl SeenSignals {
    /// Returns `false` if this (kind, call id) was seen before.
    fn first_time(&mut self, kind: SignalKind, call_id: &CallId) -> bool {
        let key = (kind, call_id.clone());
        if !self.set.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > SEEN_CAPACITY
            && let Some(oldest) = self.order.pop_front()
        {
            self.set.remove(&oldest);
        }
        true
    }
}

/// Messages that must be acted on at most once per call attempt.
fn is_once_per_attempt(kind: SignalKind) -> bool {
    matches!(
        kind,
        SignalKind::Offer | SignalKind::Answer | SignalKind::Accepted
    )
}

pub struct CallSignalingProtocol {
    self_id: UserId,
    channel: Arc<dyn SignalingChannel>,
    subscriptions: Mutex<Vec<Subscription>>,
    seen: Arc<Mutex<SeenSignals>>,
}

impl CallSignalingProtocol {
    pub fn new(self_id: UserId, channel: Arc<dyn SignalingChannel>) -> Self {
        Self {
            self_id,
            channel,
            subscriptions: Mutex::new(Vec::new()),
            seen: Arc::new(Mutex::new(SeenSignals::default())),
        }
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    /// Subscribe to every call event and pass each valid message addressed
    /// to us to `sink`. Replaces any previous registration.
    ///
    /// Malformed payloads are logged and dropped. A repeated offer, answer or
    /// acceptance for the same call id is dropped as a relay duplicate.
    pub fn listen(&self, sink: impl Fn(SignalMessage) + Send + Sync + 'static) {
        let sink = Arc::new(sink);
        let mut subscriptions = Vec::with_capacity(SignalKind::ALL.len());

        for kind in SignalKind::ALL {
            let sink = sink.clone();
            let seen = self.seen.clone();
            let self_id = self.self_id.clone();
            let handler = Arc::new(move |payload: Value| {
                let msg = match SignalMessage::from_event(kind.event_name(), &payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Dropping {}", CallError::MalformedSignal(e));
                        return;
                    }
                };
                if msg.envelope().to_id != self_id {
                    debug!(
                        "Dropping {kind} addressed to {} (we are {self_id})",
                        msg.envelope().to_id
                    );
                    return;
                }
                if is_once_per_attempt(kind)
                    && let Some(call_id) = msg.call_id()
                {
                    let first = seen
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .first_time(kind, call_id);
                    if !first {
                        debug!("Ignoring duplicate {kind} for call {call_id}");
                        return;
                    }
                }
                trace!("<-- {kind} from {}", msg.from_id());
                sink(msg);
            });
            subscriptions.push(self.channel.on(kind.event_name(), handler));
        }

        let previous = std::mem::replace(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            subscriptions,
        );
        drop(previous);
    }

    /// Drop every channel registration. Idempotent.
    pub fn stop(&self) {
        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }
    }

    pub fn is_listening(&self) -> bool {
        !self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn envelope(&self, to: &UserId, call_id: &CallId) -> Envelope {
        Envelope::new(self.self_id.clone(), to.clone(), call_id.clone())
    }

    pub async fn send_offer(
        &self,
        to: &UserId,
        call_id: &CallId,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        self.send(SignalMessage::Offer {
            envelope: self.envelope(to, call_id),
            offer,
        })
        .await
    }

    pub async fn send_answer(
        &self,
        to: &UserId,
        call_id: &CallId,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        self.send(SignalMessage::Answer {
            envelope: self.envelope(to, call_id),
            answer,
        })
        .await
    }

    pub async fn send_accepted(&self, to: &UserId, call_id: &CallId) -> Result<(), CallError> {
        self.send(SignalMessage::Accepted {
            envelope: self.envelope(to, call_id),
        })
        .await
    }

    pub async fn send_ice_candidate(
        &self,
        to: &UserId,
        call_id: &CallId,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        self.send(SignalMessage::IceCandidate {
            envelope: self.envelope(to, call_id),
            candidate,
        })
        .await
    }

    pub async fn send_reject(&self, to: &UserId, call_id: &CallId) -> Result<(), CallError> {
        self.send(SignalMessage::Reject {
            envelope: self.envelope(to, call_id),
        })
        .await
    }

    pub async fn send_end(&self, to: &UserId, call_id: &CallId) -> Result<(), CallError> {
        self.send(SignalMessage::End {
            envelope: self.envelope(to, call_id),
        })
        .await
    }

    pub async fn send_media_state(
        &self,
        to: &UserId,
        call_id: &CallId,
        audio_muted: bool,
        video_hidden: bool,
    ) -> Result<(), CallError> {
        self.send(SignalMessage::MediaState {
            envelope: self.envelope(to, call_id),
            audio_muted,
            video_hidden,
        })
        .await
    }

    async fn send(&self, msg: SignalMessage) -> Result<(), CallError> {
        let kind = msg.kind();
        let payload = msg.to_payload()?;
        self.channel
            .send(kind.event_name(), payload)
            .await
            .map_err(|e| CallError::Signaling(e.to_string()))?;
        trace!("--> {kind} to {}", msg.envelope().to_id);
        Ok(())
    }
}

impl Drop for CallSignalingProtocol {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::mock::RecordingChannel;
    use crate::types::codec::decode_description;
    use serde_json::json;

    fn protocol(channel: &Arc<RecordingChannel>) -> CallSignalingProtocol {
        CallSignalingProtocol::new(UserId::from("bob"), channel.clone())
    }

    fn collect(protocol: &CallSignalingProtocol) -> Arc<Mutex<Vec<SignalMessage>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        protocol.listen(move |msg| sink.lock().unwrap().push(msg));
        received
    }

    fn offer_payload(to: &str, call_id: &str) -> Value {
        SignalMessage::Offer {
            envelope: Envelope::new(UserId::from("alice"), UserId::from(to), CallId::new(call_id)),
            offer: SessionDescription::offer("v=0\r\n"),
        }
        .to_payload()
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_offer_wire_shape() {
        let channel = RecordingChannel::new();
        let protocol = protocol(&channel);
        let call_id = CallId::new("C1");

        protocol
            .send_offer(
                &UserId::from("alice"),
                &call_id,
                SessionDescription::offer("v=0\r\n"),
            )
            .await
            .unwrap();

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        let (event, payload) = &sent[0];
        assert_eq!(event, "call-offer");
        assert_eq!(payload["fromId"], "bob");
        assert_eq!(payload["toId"], "alice");
        assert_eq!(payload["callId"], "C1");
        let offer = decode_description(payload["offer"].as_str().unwrap()).unwrap();
        assert_eq!(offer.sdp, "v=0\r\n");
    }

    #[tokio::test]
    async fn test_listen_registers_every_event() {
        let channel = RecordingChannel::new();
        let protocol = protocol(&channel);
        let _received = collect(&protocol);
        for kind in SignalKind::ALL {
            assert_eq!(channel.handler_count(kind.event_name()), 1, "{kind}");
        }

        protocol.stop();
        protocol.stop();
        assert!(!protocol.is_listening());
        assert_eq!(channel.handler_count("call-offer"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_offer_is_dropped() {
        let channel = RecordingChannel::new();
        let protocol = protocol(&channel);
        let received = collect(&protocol);

        channel.deliver("call-offer", offer_payload("bob", "C1"));
        channel.deliver("call-offer", offer_payload("bob", "C1"));
        channel.deliver("call-offer", offer_payload("bob", "C2"));

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[1].call_id(), Some(&CallId::new("C2")));
    }

    #[tokio::test]
    async fn test_candidates_are_never_deduplicated() {
        let channel = RecordingChannel::new();
        let protocol = protocol(&channel);
        let received = collect(&protocol);
        let payload = json!({
            "fromId": "alice", "toId": "bob", "callId": "C1",
            "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
        });

        channel.deliver("ice-candidate", payload.clone());
        channel.deliver("ice-candidate", payload);

        assert_eq!(received.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_misaddressed_and_malformed_payloads_are_dropped() {
        let channel = RecordingChannel::new();
        let protocol = protocol(&channel);
        let received = collect(&protocol);

        channel.deliver("call-offer", offer_payload("carol", "C1"));
        channel.deliver("call-offer", json!({"fromId": "alice", "toId": "bob", "callId": "C1", "offer": "%%%"}));
        channel.deliver("call-answer", json!({"toId": "bob"}));

        assert!(received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_protocol_unsubscribes() {
        let channel = RecordingChannel::new();
        {
            let protocol = protocol(&channel);
            let _received = collect(&protocol);
            assert_eq!(channel.handler_count("end-call"), 1);
        }
        assert_eq!(channel.handler_count("end-call"), 0);
    }
}
