//! Format processors
//!
//! Four processors read the same variant and package it independently:
//! HLS with TS segments, HLS with fMP4 segments, DASH, and a continuous
//! MPEG-TS broadcast. They share the sliding segment window, the consumer
//! read loop and the client records; the containers differ.

pub mod cmaf;
pub mod dash;
pub mod hls_fmp4;
pub mod hls_ts;
pub mod mpegts;

pub use dash::DashProcessor;
pub use hls_fmp4::HlsFmp4Processor;
pub use hls_ts::HlsTsProcessor;
pub use mpegts::MpegtsProcessor;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::buffer::{CodecVariant, Sample};
use crate::error::{RelayError, Result};
use crate::routing::ClientFormat;

/// Read cadence of the processing loops.
pub(crate) const TICK: Duration = Duration::from_millis(10);
pub(crate) const MAX_VIDEO_BATCH: usize = 100;
pub(crate) const MAX_AUDIO_BATCH: usize = 200;
/// How long to wait for audio init data before degrading to defaults.
pub(crate) const AUDIO_INIT_WAIT: Duration = Duration::from_secs(2);
/// Segments may come out short at discontinuities but never shorter.
pub(crate) const MIN_SEGMENT_SECS: f64 = 0.1;

/// A finished media segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub sequence: u64,
    pub duration_seconds: f64,
    pub data: Bytes,
    pub pts_start: Option<i64>,
    pub pts_end: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub is_keyframe_start: bool,
    pub discontinuity: bool,
}

struct WindowState {
    segments: VecDeque<Arc<Segment>>,
    next_sequence: u64,
    ended: bool,
}

/// Bounded sliding window of segments with waiter notification.
pub struct SegmentWindow {
    state: RwLock<WindowState>,
    notify: Notify,
    max_segments: usize,
}

impl SegmentWindow {
    pub fn new(max_segments: usize) -> Self {
        Self {
            state: RwLock::new(WindowState {
                segments: VecDeque::new(),
                next_sequence: 0,
                ended: false,
            }),
            notify: Notify::new(),
            max_segments,
        }
    }

    /// Append a segment, dropping the oldest beyond the bound.
    pub fn push(
        &self,
        data: Bytes,
        duration_seconds: f64,
        pts_start: Option<i64>,
        pts_end: Option<i64>,
        is_keyframe_start: bool,
        discontinuity: bool,
    ) -> Arc<Segment> {
        let mut state = self.state.write();
        let segment = Arc::new(Segment {
            sequence: state.next_sequence,
            duration_seconds: duration_seconds.max(MIN_SEGMENT_SECS),
            data,
            pts_start,
            pts_end,
            created_at: Utc::now(),
            is_keyframe_start,
            discontinuity,
        });
        state.next_sequence += 1;
        state.segments.push_back(segment.clone());
        while state.segments.len() > self.max_segments {
            state.segments.pop_front();
        }
        drop(state);
        self.notify.notify_waiters();
        segment
    }

    pub fn get(&self, sequence: u64) -> Option<Arc<Segment>> {
        self.state
            .read()
            .segments
            .iter()
            .find(|s| s.sequence == sequence)
            .cloned()
    }

    /// The last `n` retained segments, oldest first.
    pub fn tail(&self, n: usize) -> Vec<Arc<Segment>> {
        let state = self.state.read();
        let skip = state.segments.len().saturating_sub(n);
        state.segments.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().segments.is_empty()
    }

    pub fn mark_ended(&self) {
        self.state.write().ended = true;
        self.notify.notify_waiters();
    }

    pub fn is_ended(&self) -> bool {
        self.state.read().ended
    }

    /// Block until at least one segment exists, the window is marked ended,
    /// or the timeout/cancel fires.
    pub async fn wait_nonempty(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let changed = self.notify.notified();
            {
                let state = self.state.read();
                if !state.segments.is_empty() || state.ended {
                    return Ok(());
                }
            }
            tokio::select! {
                _ = changed => {}
                _ = cancel.cancelled() => return Err(RelayError::Stopping),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(RelayError::NoSegments);
                }
            }
        }
    }
}

/// Book-keeping for one connected client.
#[derive(Debug)]
pub struct ClientRecord {
    pub client_id: String,
    pub remote_addr: String,
    pub user_agent: String,
    pub format: ClientFormat,
    pub connected_at: DateTime<Utc>,
    pub bytes_written: AtomicU64,
}

impl ClientRecord {
    pub fn new(client_id: &str, remote_addr: &str, user_agent: &str, format: ClientFormat) -> Self {
        Self {
            client_id: client_id.to_string(),
            remote_addr: remote_addr.to_string(),
            user_agent: user_agent.to_string(),
            format,
            connected_at: Utc::now(),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

/// Consumer-side reader over one variant with per-track positions.
pub(crate) struct VariantReader {
    variant: Arc<CodecVariant>,
    consumer_id: String,
    video_pos: u64,
    audio_pos: u64,
    pub bytes_read: u64,
}

impl VariantReader {
    pub fn new(variant: Arc<CodecVariant>, consumer_id: &str) -> Self {
        variant.register_consumer(consumer_id);
        Self {
            variant,
            consumer_id: consumer_id.to_string(),
            video_pos: 0,
            audio_pos: 0,
            bytes_read: 0,
        }
    }

    pub fn variant(&self) -> &Arc<CodecVariant> {
        &self.variant
    }

    /// Park until the video track holds a keyframe past the current
    /// position, then align both positions so the next batch starts there.
    /// Audio-only variants return immediately.
    pub async fn wait_for_keyframe(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.variant.video().codec().is_none() {
            return Ok(());
        }
        loop {
            let changed = self.variant.video().changed();
            let batch = self.variant.video().read_from_keyframe(self.video_pos, 1);
            if let Some(first) = batch.first() {
                self.video_pos = first.sequence - 1;
                // Skip audio that predates the keyframe to keep A/V close.
                let kf_pts = first.pts;
                let audio = self.variant.audio().read_from(self.audio_pos, usize::MAX);
                for sample in audio {
                    if sample.pts >= kf_pts {
                        break;
                    }
                    self.audio_pos = sample.sequence;
                }
                return Ok(());
            }
            let variant_cancelled = self.variant.cancelled();
            tokio::select! {
                _ = changed => {}
                _ = cancel.cancelled() => return Err(RelayError::Stopping),
                _ = variant_cancelled.cancelled() => {
                    return Err(RelayError::VariantFailed(
                        self.variant.failure_reason().unwrap_or_else(|| "variant closed".into()),
                    ));
                }
            }
        }
    }

    /// One tick worth of samples; advances the recorded consumer position.
    pub fn read_batch(&mut self) -> (Vec<Sample>, Vec<Sample>) {
        let video = self.variant.video().read_from(self.video_pos, MAX_VIDEO_BATCH);
        let audio = self.variant.audio().read_from(self.audio_pos, MAX_AUDIO_BATCH);
        if let Some(last) = video.last() {
            self.video_pos = last.sequence;
        }
        if let Some(last) = audio.last() {
            self.audio_pos = last.sequence;
        }
        self.bytes_read += video.iter().chain(audio.iter()).map(|s| s.data.len() as u64).sum::<u64>();
        self.variant
            .update_consumer_position(&self.consumer_id, self.video_pos, self.audio_pos);
        (video, audio)
    }

    pub fn release(&self) {
        self.variant.unregister_consumer(&self.consumer_id);
    }
}

/// Wait up to `timeout` for audio init data (e.g. the AAC ASC) to appear.
/// Missing init data is an observable degradation, not an error.
pub(crate) async fn wait_audio_init(
    variant: &CodecVariant,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Option<Bytes> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let changed = variant.audio().changed();
        if let Some(init) = variant.audio().init_data() {
            return Some(init);
        }
        tokio::select! {
            _ = changed => {}
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!("audio init data not available, using defaults");
                return None;
            }
        }
    }
}

/// The four concrete processors behind one dispatchable surface; the HTTP
/// layer selects by format.
#[derive(Clone)]
pub enum FormatProcessor {
    HlsTs(Arc<HlsTsProcessor>),
    HlsFmp4(Arc<HlsFmp4Processor>),
    Dash(Arc<DashProcessor>),
    Mpegts(Arc<MpegtsProcessor>),
}

impl FormatProcessor {
    pub fn format(&self) -> ClientFormat {
        match self {
            FormatProcessor::HlsTs(_) => ClientFormat::HlsTs,
            FormatProcessor::HlsFmp4(_) => ClientFormat::HlsFmp4,
            FormatProcessor::Dash(_) => ClientFormat::Dash,
            FormatProcessor::Mpegts(_) => ClientFormat::Mpegts,
        }
    }

    /// Block until the variant is ready, then launch the processing loop.
    pub async fn start(&self) -> Result<()> {
        match self {
            FormatProcessor::HlsTs(p) => p.start().await,
            FormatProcessor::HlsFmp4(p) => p.start().await,
            FormatProcessor::Dash(p) => p.start().await,
            FormatProcessor::Mpegts(p) => p.start().await,
        }
    }

    /// Cancel the loop, wait for it and release the variant.
    pub async fn stop(&self) {
        match self {
            FormatProcessor::HlsTs(p) => p.stop().await,
            FormatProcessor::HlsFmp4(p) => p.stop().await,
            FormatProcessor::Dash(p) => p.stop().await,
            FormatProcessor::Mpegts(p) => p.stop().await,
        }
    }

    pub fn is_idle(&self) -> bool {
        match self {
            FormatProcessor::HlsTs(p) => p.is_idle(),
            FormatProcessor::HlsFmp4(p) => p.is_idle(),
            FormatProcessor::Dash(p) => p.is_idle(),
            FormatProcessor::Mpegts(p) => p.is_idle(),
        }
    }

    pub fn client_count(&self) -> usize {
        match self {
            FormatProcessor::HlsTs(p) => p.client_count(),
            FormatProcessor::HlsFmp4(p) => p.client_count(),
            FormatProcessor::Dash(p) => p.client_count(),
            FormatProcessor::Mpegts(p) => p.client_count(),
        }
    }

    pub fn bytes_served(&self) -> u64 {
        match self {
            FormatProcessor::HlsTs(p) => p.bytes_served(),
            FormatProcessor::HlsFmp4(p) => p.bytes_served(),
            FormatProcessor::Dash(p) => p.bytes_served(),
            FormatProcessor::Mpegts(p) => p.bytes_served(),
        }
    }

    /// Upstream EOF: segment windows advertise the end; the continuous
    /// path has nothing to mark.
    pub fn mark_ended(&self) {
        match self {
            FormatProcessor::HlsTs(p) => p.mark_ended(),
            FormatProcessor::HlsFmp4(p) => p.mark_ended(),
            FormatProcessor::Dash(p) => p.mark_ended(),
            FormatProcessor::Mpegts(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_drops_oldest_and_numbers_contiguously() {
        let window = SegmentWindow::new(3);
        for i in 0..5 {
            window.push(
                Bytes::from(vec![i as u8]),
                4.0,
                None,
                None,
                true,
                false,
            );
        }
        assert_eq!(window.len(), 3);
        let tail = window.tail(10);
        let seqs: Vec<u64> = tail.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert!(window.get(1).is_none());
        assert!(window.get(4).is_some());
    }

    #[test]
    fn test_window_enforces_min_duration() {
        let window = SegmentWindow::new(4);
        let seg = window.push(Bytes::new(), 0.0, None, None, false, false);
        assert!(seg.duration_seconds >= MIN_SEGMENT_SECS);
    }

    #[tokio::test]
    async fn test_wait_nonempty_wakes_on_push() {
        let window = Arc::new(SegmentWindow::new(4));
        let cancel = CancellationToken::new();
        let waiter = {
            let window = window.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { window.wait_nonempty(Duration::from_secs(5), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        window.push(Bytes::from_static(b"x"), 4.0, None, None, true, false);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_nonempty_times_out() {
        let window = SegmentWindow::new(4);
        let cancel = CancellationToken::new();
        let err = window
            .wait_nonempty(Duration::from_millis(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoSegments));
    }
}
