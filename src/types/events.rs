use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::calls::{CallState, MediaStream};
use crate::types::{CallDirection, CallId, EndReason, UserId};

// The default size of each broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

// Macro to generate EventBus fields and constructors
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self::with_capacity(CHANNEL_CAPACITY)
            }

            pub fn with_capacity(capacity: usize) -> Self {
                Self {
                    $(
                        $field: broadcast::channel(capacity.max(1)).0,
                    )*
                }
            }
        }

        impl Default for EventBus {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

define_event_bus! {
    // Lifecycle
    (state, Arc<StateChange>),
    (call_ended, Arc<CallSummary>),

    // Media
    (local_stream, Arc<StreamReady>),
    (remote_stream, Arc<StreamReady>),
    (remote_media_state, Arc<RemoteMediaState>),

    // Peer notices
    (remote_accepted, Arc<RemoteAccepted>),
    (busy, Arc<BusyNotice>),
}

/// A lifecycle state change. `Ended` always carries a reason; failures also
/// carry a description of the error that caused them.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub state: CallState,
    pub call_id: Option<CallId>,
    pub peer_id: Option<UserId>,
    pub reason: Option<EndReason>,
    pub error: Option<String>,
}

impl StateChange {
    pub fn idle() -> Self {
        Self {
            state: CallState::Idle,
            call_id: None,
            peer_id: None,
            reason: None,
            error: None,
        }
    }
}

/// A stream the UI should render.
#[derive(Debug, Clone)]
pub struct StreamReady {
    pub call_id: CallId,
    pub peer_id: UserId,
    pub stream: Arc<MediaStream>,
}

/// Someone called while another call was in progress. Nothing is sent back
/// to them.
#[derive(Debug, Clone, Serialize)]
pub struct BusyNotice {
    pub from: UserId,
    pub call_id: CallId,
}

/// The callee accepted; negotiation is under way.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteAccepted {
    pub call_id: CallId,
    pub peer_id: UserId,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteMediaState {
    pub call_id: CallId,
    pub peer_id: UserId,
    pub audio_muted: bool,
    pub video_hidden: bool,
}

/// Record of a finished call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub call_id: CallId,
    pub peer_id: UserId,
    pub direction: CallDirection,
    pub reason: EndReason,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: Option<i64>,
}
