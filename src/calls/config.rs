use std::time::Duration;

use super::media::{IceServer, MediaConstraints, PeerConfig};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Configuration for [`CallSessionController`](super::CallSessionController).
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Seconds an outgoing call rings before giving up.
    pub ring_timeout_secs: u64,
    /// Seconds allowed between acceptance and the media path connecting.
    pub connect_timeout_secs: u64,
    pub ice_servers: Vec<IceServer>,
    /// What to ask the capture devices for.
    pub media: MediaConstraints,
    /// Buffer size of each event bus channel.
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 45,
            connect_timeout_secs: 30,
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            media: MediaConstraints::default(),
            event_capacity: 100,
        }
    }
}

impl CallConfig {
    pub fn with_ring_timeout_secs(mut self, secs: u64) -> Self {
        self.ring_timeout_secs = secs;
        self
    }

    pub fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_media(mut self, media: MediaConstraints) -> Self {
        self.media = media;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }
}
