//! Local and remote media handles.
//!
//! Capture itself happens outside this crate; a [`LocalMediaSource`] is the handle the
//! room session owns and shares read-only with its peer links. Only the session flips
//! track `enabled` flags.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Camera,
    Screen,
}

/// One captured track. The `enabled` flag is flipped by the session's toggles.
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Flip the enabled flag, returning the new value.
    pub(crate) fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::AcqRel)
    }
}

/// Fired by the capture side when a source stops on its own, e.g. the user ends a
/// screen share from the browser or OS chrome.
#[derive(Debug, Clone)]
pub struct SourceEndedNotifier(CancellationToken);

impl SourceEndedNotifier {
    pub fn notify(&self) {
        self.0.cancel();
    }
}

#[derive(Debug)]
pub struct LocalMediaSource {
    id: String,
    kind: SourceKind,
    tracks: Vec<Arc<MediaTrack>>,
    ended: CancellationToken,
}

impl LocalMediaSource {
    pub fn new(id: impl Into<String>, kind: SourceKind, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            kind,
            tracks: tracks.into_iter().map(Arc::new).collect(),
            ended: CancellationToken::new(),
        }
    }

    /// Camera/microphone source with the requested track kinds.
    pub fn camera(id: impl Into<String>, audio: bool, video: bool) -> Self {
        let id = id.into();
        let mut tracks = Vec::new();
        if audio {
            tracks.push(MediaTrack::new(format!("{id}-audio"), MediaKind::Audio));
        }
        if video {
            tracks.push(MediaTrack::new(format!("{id}-video"), MediaKind::Video));
        }
        Self::new(id, SourceKind::Camera, tracks)
    }

    /// Screen capture: a single video track.
    pub fn screen(id: impl Into<String>) -> Self {
        let id = id.into();
        let tracks = vec![MediaTrack::new(format!("{id}-screen"), MediaKind::Video)];
        Self::new(id, SourceKind::Screen, tracks)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    #[must_use]
    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    #[must_use]
    pub fn ended_notifier(&self) -> SourceEndedNotifier {
        SourceEndedNotifier(self.ended.clone())
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    /// Resolves once capture has stopped or the source was released.
    pub async fn ended(&self) {
        self.ended.cancelled().await;
    }

    pub(crate) fn release(&self) {
        self.ended.cancel();
    }

    /// Flip every track of `kind`. Returns the first track's new state, or `None`
    /// when the source has no such track.
    pub(crate) fn toggle(&self, kind: MediaKind) -> Option<bool> {
        self.tracks_of(kind)
            .map(|track| track.toggle())
            .fold(None, |first, state| first.or(Some(state)))
    }
}

/// Resolution bounds for camera capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub min: u32,
    pub ideal: u32,
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub width: Range,
    pub height: Range,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            width: Range {
                min: 160,
                ideal: 640,
                max: 1280,
            },
            height: Range {
                min: 120,
                ideal: 360,
                max: 720,
            },
        }
    }
}

/// Local capture capability. May wait on hardware or user permission; callers
/// bound it with a timeout.
#[async_trait]
pub trait MediaAcquirer: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaSource>;
}

/// Acquirer with a fixed outcome, for headless runs and tests.
#[derive(Debug, Clone)]
pub enum StaticMediaAcquirer {
    Grant,
    Deny(String),
    /// Never resolves, like a permission prompt nobody answers.
    Pending,
}

#[async_trait]
impl MediaAcquirer for StaticMediaAcquirer {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaSource> {
        match self {
            StaticMediaAcquirer::Grant => Ok(LocalMediaSource::camera(
                format!("camera-{:08x}", rand::random::<u32>()),
                constraints.audio,
                constraints.video,
            )),
            StaticMediaAcquirer::Deny(reason) => Err(Error::MediaAccess(reason.clone())),
            StaticMediaAcquirer::Pending => std::future::pending().await,
        }
    }
}

/// Remote media delivered by a connected peer link, handed to the rendering sink.
#[derive(Clone)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_id: String,
    pub kind: MediaKind,
    /// Present when a real media transport negotiated the link.
    pub track: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .field("kind", &self.kind)
            .field("has_track", &self.track.is_some())
            .finish()
    }
}
