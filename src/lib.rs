// Core call types are re-exported, but events (with EventBus) remain here for runtime-specific functionality
pub mod types {
    pub use callcore::codec;
    pub use callcore::signaling::{Envelope, SignalKind};
    pub use callcore::types::call::*;
    pub use callcore::{CodecError, SignalMessage};
    pub mod events;
}

pub mod calls;
pub mod signaling;
pub mod subscription;

pub use calls::{CallConfig, CallError, CallSessionController, CallState, MediaBackend};
pub use signaling::SignalingChannel;
pub use subscription::Subscription;
