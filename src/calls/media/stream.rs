//! Media tracks and streams.

use log::debug;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// A single audio or video track.
///
/// Local tracks usually hold a capture device; the release hook runs exactly
/// once, on the first [`MediaTrack::stop`].
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    remote: bool,
    enabled: AtomicBool,
    ended: AtomicBool,
    release: Mutex<Option<ReleaseHook>>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(kind, id.into(), false, None))
    }

    /// A local track whose `release` runs when the track is stopped.
    pub fn with_release(
        kind: TrackKind,
        id: impl Into<String>,
        release: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self::build(kind, id.into(), false, Some(Box::new(release))))
    }

    /// A track received from the peer.
    pub fn remote(kind: TrackKind, id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(kind, id.into(), true, None))
    }

    fn build(kind: TrackKind, id: String, remote: bool, release: Option<ReleaseHook>) -> Self {
        Self {
            id,
            kind,
            remote,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            release: Mutex::new(release),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// A disabled track stays attached but carries silence / black frames.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// End the track and release its device. Returns `false` if it had
    /// already ended.
    pub fn stop(&self) -> bool {
        if self.ended.swap(true, Ordering::AcqRel) {
            return false;
        }
        let release = self
            .release
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(release) = release {
            release();
        }
        debug!("Stopped {} {} track {}", self.origin(), self.kind, self.id);
        true
    }

    fn origin(&self) -> &'static str {
        if self.remote { "remote" } else { "local" }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote", &self.remote)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// An ordered group of tracks with a stable identity.
///
/// Remote streams grow as tracks arrive; the `Arc` handed to the UI stays
/// the same object throughout, so a renderer can attach it once.
pub struct MediaStream {
    id: String,
    tracks: RwLock<Vec<Arc<MediaTrack>>>,
    track_added: broadcast::Sender<Arc<MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Self::with_tracks(id, Vec::new())
    }

    pub fn with_tracks(id: impl Into<String>, tracks: Vec<Arc<MediaTrack>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            tracks: RwLock::new(tracks),
            track_added: broadcast::channel(16).0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tracks_of(&self, kind: TrackKind) -> Vec<Arc<MediaTrack>> {
        self.tracks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|t| t.kind() == kind)
    }

    /// Append a track. Returns `false` if a track with the same id is
    /// already present.
    pub fn add_track(&self, track: Arc<MediaTrack>) -> bool {
        {
            let mut tracks = self.tracks.write().unwrap_or_else(PoisonError::into_inner);
            if tracks.iter().any(|t| t.id() == track.id()) {
                return false;
            }
            tracks.push(track.clone());
        }
        let _ = self.track_added.send(track);
        true
    }

    /// Notifications for tracks appended after this call.
    pub fn subscribe_tracks(&self) -> broadcast::Receiver<Arc<MediaTrack>> {
        self.track_added.subscribe()
    }

    /// Stop every track. Returns how many were still live.
    pub fn stop_all(&self) -> usize {
        self.tracks().iter().filter(|t| t.stop()).count()
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
        }
    }
}

/// What to ask the capture devices for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(VideoConstraints::default()),
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_stop_releases_device_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let r = released.clone();
        let track = MediaTrack::with_release(TrackKind::Audio, "mic", move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert!(track.stop());
        assert!(!track.stop());
        assert!(track.is_ended());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stream_identity_survives_track_additions() {
        let stream = MediaStream::new("remote");
        let mut added = stream.subscribe_tracks();
        let same = stream.clone();

        assert!(stream.add_track(MediaTrack::remote(TrackKind::Audio, "a")));
        assert!(stream.add_track(MediaTrack::remote(TrackKind::Video, "v")));
        assert!(!stream.add_track(MediaTrack::remote(TrackKind::Video, "v")));

        assert!(Arc::ptr_eq(&stream, &same));
        assert_eq!(same.tracks().len(), 2);
        assert_eq!(added.try_recv().unwrap().id(), "a");
        assert_eq!(added.try_recv().unwrap().id(), "v");
        assert!(added.try_recv().is_err());
    }

    #[test]
    fn test_disable_keeps_track_live() {
        let track = MediaTrack::new(TrackKind::Video, "cam");
        track.set_enabled(false);
        assert!(!track.is_enabled());
        assert!(!track.is_ended());
    }

    #[test]
    fn test_default_constraints_ask_for_hd_video() {
        let c = MediaConstraints::default();
        assert!(c.audio);
        assert_eq!(
            c.video,
            Some(VideoConstraints {
                ideal_width: 1280,
                ideal_height: 720
            })
        );
        assert!(MediaConstraints::audio_only().video.is_none());
    }
}
