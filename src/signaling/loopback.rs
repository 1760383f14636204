//! In-process signaling relay.
//!
//! Every connected user gets a [`LoopbackChannel`]; payloads are routed by
//! their `toId` field and delivered on the recipient's reader task, in the
//! order they were sent, the same way a socket relay hands frames to a
//! reader loop.

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, trace, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use super::{SignalHandler, SignalingChannel};
use crate::subscription::{ListenerSet, Subscription};
use crate::types::UserId;

#[derive(Default)]
pub struct LoopbackHub {
    users: DashMap<UserId, Arc<LoopbackChannel>>,
    delivered: AtomicUsize,
    dropped: AtomicUsize,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `user` and return its channel. Reconnecting replaces the
    /// previous channel; its handlers stop receiving.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(self: &Arc<Self>, user: impl Into<UserId>) -> Arc<LoopbackChannel> {
        let user = user.into();
        let handlers: Arc<DashMap<String, Arc<ListenerSet<Value>>>> = Arc::new(DashMap::new());
        let (inbox, mut frames) = mpsc::unbounded_channel::<(String, Value)>();

        let reader_handlers = handlers.clone();
        let reader_user = user.clone();
        tokio::spawn(async move {
            while let Some((event, payload)) = frames.recv().await {
                deliver(&reader_user, &reader_handlers, &event, payload);
            }
            trace!("Loopback reader for {reader_user} stopped");
        });

        let channel = Arc::new(LoopbackChannel {
            user: user.clone(),
            hub: Arc::downgrade(self),
            handlers,
            inbox,
        });
        if self.users.insert(user.clone(), channel.clone()).is_some() {
            debug!("Loopback user {user} reconnected, replacing channel");
        }
        channel
    }

    /// Stop routing to `user`. Payloads addressed to it are dropped.
    pub fn disconnect(&self, user: &UserId) {
        if self.users.remove(user).is_some() {
            debug!("Loopback user {user} disconnected");
        }
    }

    pub fn is_connected(&self, user: &UserId) -> bool {
        self.users.contains_key(user)
    }

    /// Payloads handed to a recipient so far.
    pub fn delivered_count(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Payloads dropped for lack of a routable recipient.
    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    fn route(&self, from: &UserId, event: &str, payload: Value) {
        let Some(to) = payload.get("toId").and_then(Value::as_str) else {
            warn!("Dropping {event} from {from}: payload has no toId");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let to = UserId::from(to);
        let Some(target) = self.users.get(&to).map(|c| c.clone()) else {
            debug!("Dropping {event} from {from}: {to} is not connected");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if target.inbox.send((event.to_string(), payload)).is_err() {
            warn!("Dropping {event} from {from}: reader for {to} has stopped");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

fn deliver(
    user: &UserId,
    handlers: &DashMap<String, Arc<ListenerSet<Value>>>,
    event: &str,
    payload: Value,
) {
    let listeners = handlers.get(event).map(|set| set.clone());
    match listeners {
        Some(set) if !set.is_empty() => {
            trace!("<-- {user} {event}: {payload}");
            set.emit(payload);
        }
        _ => debug!("{user} has no handler for {event}, dropping"),
    }
}

pub struct LoopbackChannel {
    user: UserId,
    hub: Weak<LoopbackHub>,
    handlers: Arc<DashMap<String, Arc<ListenerSet<Value>>>>,
    inbox: mpsc::UnboundedSender<(String, Value)>,
}

impl LoopbackChannel {
    pub fn user(&self) -> &UserId {
        &self.user
    }
}

#[async_trait]
impl SignalingChannel for LoopbackChannel {
    async fn send(&self, event: &str, payload: Value) -> Result<(), anyhow::Error> {
        let hub = self
            .hub
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("loopback hub is gone"))?;
        if !hub.is_connected(&self.user) {
            return Err(anyhow::anyhow!("{} is not connected", self.user));
        }
        trace!("--> {} {event}: {payload}", self.user);
        hub.route(&self.user, event, payload);
        Ok(())
    }

    fn on(&self, event: &str, handler: SignalHandler) -> Subscription {
        let set = self
            .handlers
            .entry(event.to_string())
            .or_insert_with(|| Arc::new(ListenerSet::new()))
            .clone();
        set.add(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_routes_by_to_id() {
        let hub = LoopbackHub::new();
        let alice = hub.connect("alice");
        let bob = hub.connect("bob");
        let carol = hub.connect("carol");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _bob_sub = bob.on(
            "call-offer",
            Arc::new(move |v| {
                let _ = tx.send(v);
            }),
        );
        let carol_hits = Arc::new(AtomicUsize::new(0));
        let hits = carol_hits.clone();
        let _carol_sub = carol.on(
            "call-offer",
            Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
        );

        alice
            .send("call-offer", json!({"fromId": "alice", "toId": "bob"}))
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got["fromId"], "alice");
        assert_eq!(carol_hits.load(Ordering::SeqCst), 0);
        assert_eq!(hub.delivered_count(), 1);
    }

    #[tokio::test]
    async fn test_delivery_is_never_synchronous() {
        let hub = LoopbackHub::new();
        let alice = hub.connect("alice");
        let received = Arc::new(AtomicUsize::new(0));
        let r = received.clone();
        let _sub = alice.on(
            "end-call",
            Arc::new(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            }),
        );

        alice
            .send("end-call", json!({"fromId": "alice", "toId": "alice"}))
            .await
            .unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unroutable_payloads_are_dropped() {
        let hub = LoopbackHub::new();
        let alice = hub.connect("alice");

        alice
            .send("end-call", json!({"fromId": "alice"}))
            .await
            .unwrap();
        alice
            .send("end-call", json!({"fromId": "alice", "toId": "nobody"}))
            .await
            .unwrap();
        assert_eq!(hub.dropped_count(), 2);

        hub.disconnect(alice.user());
        assert!(
            alice
                .send("end-call", json!({"fromId": "alice", "toId": "alice"}))
                .await
                .is_err()
        );
    }
}
