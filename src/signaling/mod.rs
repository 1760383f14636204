//! The signaling relay seam.
//!
//! Call control rides on an already-connected, authenticated bidirectional
//! channel. The relay routes each payload by its `toId` field; it gives no
//! ordering guarantee across event names and no delivery confirmation.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::subscription::Subscription;

pub mod loopback;

pub use loopback::{LoopbackChannel, LoopbackHub};

/// Callback invoked with the raw JSON payload of a named event.
pub type SignalHandler = Arc<dyn Fn(Value) + Send + Sync>;

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Emit a named event. Fire-and-forget: `Ok` means handed to the relay,
    /// not delivered.
    async fn send(&self, event: &str, payload: Value) -> Result<(), anyhow::Error>;

    /// Register a handler for a named event. Handlers must not be invoked
    /// synchronously from within [`SignalingChannel::send`].
    fn on(&self, event: &str, handler: SignalHandler) -> Subscription;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::subscription::ListenerSet;
    use dashmap::DashMap;
    use std::sync::Mutex;

    /// Records outgoing events; incoming ones are injected with
    /// [`RecordingChannel::deliver`].
    #[derive(Default)]
    pub struct RecordingChannel {
        sent: Mutex<Vec<(String, Value)>>,
        handlers: DashMap<String, Arc<ListenerSet<Value>>>,
    }

    impl RecordingChannel {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn sent(&self) -> Vec<(String, Value)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn sent_events(&self) -> Vec<String> {
            self.sent().into_iter().map(|(event, _)| event).collect()
        }

        pub fn deliver(&self, event: &str, payload: Value) {
            let set = self.handlers.get(event).map(|s| s.clone());
            if let Some(set) = set {
                set.emit(payload);
            }
        }

        pub fn handler_count(&self, event: &str) -> usize {
            self.handlers.get(event).map(|s| s.len()).unwrap_or(0)
        }
    }

    #[async_trait]
    impl SignalingChannel for RecordingChannel {
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
}
