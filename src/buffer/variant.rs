//! Codec variants
//!
//! A variant pairs one video track with one audio track under a canonical
//! `"video/audio"` key. The source variant is fed by the demuxer; derived
//! variants are fed by transcoder workers and garbage collected when idle.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

use crate::config::BufferConfig;

use super::track::{Track, TrackKind};

/// Identity of a variant: a concrete codec pair, or `Copy` meaning whatever
/// the source provides.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VariantKey {
    Copy,
    Codecs { video: String, audio: String },
}

impl VariantKey {
    pub fn codecs(video: &str, audio: &str) -> Self {
        VariantKey::Codecs {
            video: video.to_ascii_lowercase(),
            audio: audio.to_ascii_lowercase(),
        }
    }

    /// Canonical map key, e.g. `"h264/aac"`. `Copy` has no canonical form.
    pub fn canonical(&self) -> Option<String> {
        match self {
            VariantKey::Copy => None,
            VariantKey::Codecs { video, audio } => Some(format!("{}/{}", video, audio)),
        }
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantKey::Copy => write!(f, "copy"),
            VariantKey::Codecs { video, audio } => write!(f, "{}/{}", video, audio),
        }
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One (video, audio) track pair within the shared buffer.
pub struct CodecVariant {
    video: Track,
    audio: Track,
    derived: bool,
    failed: AtomicBool,
    failure: parking_lot::Mutex<Option<String>>,
    last_read_secs: AtomicU64,
    cancel: CancellationToken,
}

impl fmt::Debug for CodecVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecVariant")
            .field("derived", &self.derived)
            .field("failed", &self.failed.load(Ordering::Relaxed))
            .finish()
    }
}

impl CodecVariant {
    pub(super) fn new(config: &BufferConfig, derived: bool, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            video: Track::new(TrackKind::Video, config),
            audio: Track::new(TrackKind::Audio, config),
            derived,
            failed: AtomicBool::new(false),
            failure: parking_lot::Mutex::new(None),
            last_read_secs: AtomicU64::new(unix_secs()),
            cancel: parent.child_token(),
        })
    }

    pub fn video(&self) -> &Track {
        &self.video
    }

    pub fn audio(&self) -> &Track {
        &self.audio
    }

    pub fn is_derived(&self) -> bool {
        self.derived
    }

    /// Canonical key once both codecs are known, else `None`.
    pub fn key(&self) -> Option<String> {
        match (self.video.codec(), self.audio.codec()) {
            (Some(v), Some(a)) => Some(format!("{}/{}", v, a)),
            _ => None,
        }
    }

    /// Cancelled when the variant is torn down or its producer failed.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn register_consumer(&self, id: &str) {
        self.video.register_consumer(id);
        self.audio.register_consumer(id);
        self.touch();
    }

    pub fn unregister_consumer(&self, id: &str) {
        self.video.unregister_consumer(id);
        self.audio.unregister_consumer(id);
    }

    /// Record per-consumer read positions and refresh the idle clock.
    pub fn update_consumer_position(&self, id: &str, video_seq: u64, audio_seq: u64) {
        self.video.update_consumer(id, video_seq);
        self.audio.update_consumer(id, audio_seq);
        self.touch();
    }

    pub fn write_video(&self, pts: i64, dts: i64, data: Bytes, is_keyframe: bool) -> u64 {
        self.video.push(pts, dts, data, is_keyframe, None)
    }

    pub fn write_audio(&self, pts: i64, data: Bytes) -> u64 {
        // Audio has no decode reordering; dts mirrors pts.
        self.audio.push(pts, pts, data, false, None)
    }

    pub fn touch(&self) {
        self.last_read_secs.store(unix_secs(), Ordering::Relaxed);
    }

    /// Seconds since the last consumer read (or registration).
    pub fn idle_secs(&self) -> u64 {
        unix_secs().saturating_sub(self.last_read_secs.load(Ordering::Relaxed))
    }

    /// Mark the variant failing: wakes all waiters and records the reason.
    /// Consumers observe this through the cancellation token; bytes already
    /// produced downstream are retained by their processors.
    pub fn fail(&self, reason: &str) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            *self.failure.lock() = Some(reason.to_string());
            self.cancel.cancel();
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    pub(super) fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_key() {
        assert_eq!(
            VariantKey::codecs("H264", "AAC").canonical(),
            Some("h264/aac".to_string())
        );
        assert_eq!(VariantKey::Copy.canonical(), None);
        assert_eq!(VariantKey::codecs("h265", "eac3").to_string(), "h265/eac3");
    }

    #[test]
    fn test_variant_key_resolution() {
        let cancel = CancellationToken::new();
        let variant = CodecVariant::new(&BufferConfig::default(), false, &cancel);
        assert_eq!(variant.key(), None);
        variant.video().set_codec("h264");
        assert_eq!(variant.key(), None);
        variant.audio().set_codec("aac");
        assert_eq!(variant.key(), Some("h264/aac".to_string()));
    }

    #[test]
    fn test_fail_is_idempotent_and_cancels() {
        let cancel = CancellationToken::new();
        let variant = CodecVariant::new(&BufferConfig::default(), true, &cancel);
        assert!(!variant.cancelled().is_cancelled());
        variant.fail("encoder exited");
        variant.fail("second call ignored");
        assert!(variant.is_failed());
        assert!(variant.cancelled().is_cancelled());
        assert_eq!(variant.failure_reason().as_deref(), Some("encoder exited"));
    }

    #[test]
    fn test_consumer_position_updates_both_tracks() {
        let cancel = CancellationToken::new();
        let variant = CodecVariant::new(&BufferConfig::default(), false, &cancel);
        variant.register_consumer("hls");
        variant.write_video(0, 0, Bytes::from_static(b"kf"), true);
        variant.write_audio(0, Bytes::from_static(b"au"));
        variant.update_consumer_position("hls", 1, 1);
        assert_eq!(variant.video().consumer_count(), 1);
        assert_eq!(variant.audio().consumer_count(), 1);
    }
}
