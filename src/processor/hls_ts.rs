//! HLS processor with MPEG-TS segments
//!
//! One persistent TS muxer spans all segments so continuity counters stay
//! correct; between segments the muxer's sink is swapped to the next
//! segment buffer and PAT/PMT are re-emitted at each segment start.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::{SharedEsBuffer, VariantKey};
use crate::config::SegmentConfig;
use crate::error::{RelayError, Result};
use crate::mux::TsMuxer;
use crate::routing::ClientFormat;

use super::{
    wait_audio_init, ClientRecord, Segment, SegmentWindow, VariantReader, AUDIO_INIT_WAIT, TICK,
};

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct HlsTsProcessor {
    consumer_id: String,
    buffer: Arc<SharedEsBuffer>,
    variant_key: VariantKey,
    config: SegmentConfig,
    window: Arc<SegmentWindow>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    clients: RwLock<HashMap<String, Arc<ClientRecord>>>,
    last_manifest_secs: AtomicU64,
    bytes_served: AtomicU64,
}

impl HlsTsProcessor {
    pub fn new(
        buffer: Arc<SharedEsBuffer>,
        variant_key: VariantKey,
        config: SegmentConfig,
        parent_cancel: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            consumer_id: format!("hls-ts-{}", uuid::Uuid::new_v4().simple()),
            buffer,
            variant_key,
            window: Arc::new(SegmentWindow::new(config.max_segments)),
            config,
            cancel: parent_cancel.child_token(),
            task: Mutex::new(None),
            stopping: AtomicBool::new(false),
            clients: RwLock::new(HashMap::new()),
            last_manifest_secs: AtomicU64::new(unix_secs()),
            bytes_served: AtomicU64::new(0),
        })
    }

    pub async fn start(&self) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(RelayError::Stopping);
        }
        let variant = self
            .buffer
            .get_or_create_variant(&self.variant_key, &self.cancel)
            .await?;
        self.buffer.register_processor(&self.consumer_id);
        let reader = VariantReader::new(variant, &self.consumer_id);
        let window = self.window.clone();
        let target = self.config.target_duration_secs;
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(run_ts_segment_loop(reader, window, target, cancel));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        self.buffer.unregister_processor(&self.consumer_id);
        self.clients.write().clear();
    }

    pub fn register_client(&self, record: ClientRecord) -> Result<Arc<ClientRecord>> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(RelayError::Stopping);
        }
        let record = Arc::new(record);
        self.clients
            .write()
            .insert(record.client_id.clone(), record.clone());
        Ok(record)
    }

    pub fn unregister_client(&self, client_id: &str) {
        self.clients.write().remove(client_id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::Relaxed)
    }

    pub fn add_bytes_served(&self, n: u64) {
        self.bytes_served.fetch_add(n, Ordering::Relaxed);
    }

    pub fn format(&self) -> ClientFormat {
        ClientFormat::HlsTs
    }

    pub fn is_idle(&self) -> bool {
        let idle_after = (self.config.playlist_segments as f64 * self.config.target_duration_secs * 2.0)
            .max(1.0) as u64;
        unix_secs().saturating_sub(self.last_manifest_secs.load(Ordering::Relaxed)) > idle_after
    }

    /// Render the HLSv3 media playlist, waiting briefly for the first
    /// segment to exist.
    pub async fn playlist(&self) -> Result<String> {
        self.last_manifest_secs.store(unix_secs(), Ordering::Relaxed);
        self.window
            .wait_nonempty(self.config.manifest_wait(), &self.cancel)
            .await?;
        let segments = self.window.tail(self.config.playlist_segments);
        if segments.is_empty() {
            return Err(RelayError::NoSegments);
        }
        Ok(render_ts_playlist(
            &segments,
            self.config.target_duration_secs,
            None,
            self.window.is_ended(),
        ))
    }

    pub fn segment(&self, sequence: u64) -> Result<Arc<Segment>> {
        self.window
            .get(sequence)
            .ok_or(RelayError::SegmentNotFound { sequence })
    }

    pub fn segment_count(&self) -> usize {
        self.window.len()
    }

    /// Upstream reached EOF: playlists may advertise the end.
    pub fn mark_ended(&self) {
        self.window.mark_ended();
    }
}

/// Segment cut state for the TS loop; pts are 90 kHz.
struct TsAccumulator {
    first_pts: Option<i64>,
    last_pts: Option<i64>,
    wall_start: Instant,
    muxed_any: bool,
    starts_keyframe: bool,
}

impl TsAccumulator {
    fn new() -> Self {
        Self {
            first_pts: None,
            last_pts: None,
            wall_start: Instant::now(),
            muxed_any: false,
            starts_keyframe: false,
        }
    }

    fn note(&mut self, pts: i64, keyframe: bool) {
        if !self.muxed_any {
            self.wall_start = Instant::now();
        }
        self.muxed_any = true;
        if self.first_pts.is_none() {
            self.first_pts = Some(pts);
            self.starts_keyframe = keyframe;
        }
        self.last_pts = Some(pts.max(self.last_pts.unwrap_or(pts)));
    }

    fn content_secs(&self) -> f64 {
        match (self.first_pts, self.last_pts) {
            (Some(f), Some(l)) => (l - f) as f64 / 90_000.0,
            _ => 0.0,
        }
    }

    fn wall_secs(&self) -> f64 {
        self.wall_start.elapsed().as_secs_f64()
    }
}

async fn run_ts_segment_loop(
    mut reader: VariantReader,
    window: Arc<SegmentWindow>,
    target_secs: f64,
    cancel: CancellationToken,
) {
    if reader.wait_for_keyframe(&cancel).await.is_err() {
        window.mark_ended();
        reader.release();
        return;
    }
    let variant = reader.variant().clone();
    let has_video = variant.video().codec().is_some();
    let audio_codec = variant.audio().codec();
    let audio_init = if audio_codec.as_deref() == Some("aac") {
        wait_audio_init(&variant, AUDIO_INIT_WAIT, &cancel).await
    } else {
        variant.audio().init_data()
    };

    let mut muxer = TsMuxer::new();
    if let Err(e) = muxer.set_streams(
        variant.video().codec().as_deref(),
        audio_codec.as_deref(),
        audio_init.as_ref(),
    ) {
        tracing::error!(error = %e, "stream not muxable into TS segments");
        window.mark_ended();
        reader.release();
        return;
    }
    muxer.write_psi();

    let mut acc = TsAccumulator::new();
    let variant_cancel = variant.cancelled();
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = variant_cancel.cancelled() => break,
            _ = ticker.tick() => {
                let (video, audio) = reader.read_batch();
                for sample in &video {
                    let cut = sample.is_keyframe
                        && acc.muxed_any
                        && acc.content_secs() >= target_secs;
                    if cut {
                        finalize_segment(&mut muxer, &window, &mut acc, Some(sample.pts));
                    }
                    if muxer.mux_video(sample.pts, sample.dts, &sample.data, sample.is_keyframe).is_ok() {
                        acc.note(sample.pts, sample.is_keyframe);
                    }
                }
                for sample in &audio {
                    if muxer.mux_audio(sample.pts, &sample.data).is_ok() {
                        // Audio alone drives the timeline when no video exists.
                        if !has_video {
                            acc.note(sample.pts, false);
                        } else {
                            acc.muxed_any = true;
                        }
                    }
                }
                let overdue = acc.muxed_any
                    && (acc.wall_secs() >= target_secs * 1.5
                        || (!has_video && acc.content_secs() >= target_secs));
                if overdue {
                    finalize_segment(&mut muxer, &window, &mut acc, None);
                }
            }
        }
    }
    if acc.muxed_any {
        finalize_segment(&mut muxer, &window, &mut acc, None);
    }
    window.mark_ended();
    reader.release();
}

fn finalize_segment(
    muxer: &mut TsMuxer,
    window: &SegmentWindow,
    acc: &mut TsAccumulator,
    cut_pts: Option<i64>,
) {
    let data = muxer.take_output();
    if data.is_empty() {
        *acc = TsAccumulator::new();
        muxer.write_psi();
        return;
    }
    let end = cut_pts.or(acc.last_pts);
    let duration = match (acc.first_pts, end) {
        (Some(f), Some(l)) if l > f => (l - f) as f64 / 90_000.0,
        _ => acc.wall_secs(),
    };
    window.push(data, duration, acc.first_pts, acc.last_pts, acc.starts_keyframe, false);
    *acc = TsAccumulator::new();
    // New segment starts with fresh tables so late joiners can decode it.
    muxer.write_psi();
}

pub(super) fn render_ts_playlist(
    segments: &[Arc<Segment>],
    target: f64,
    playlist_type: Option<&str>,
    ended: bool,
) -> String {
    let mut out = String::with_capacity(256);
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target.ceil() as u64));
    out.push_str(&format!(
        "#EXT-X-MEDIA-SEQUENCE:{}\n",
        segments.first().map(|s| s.sequence).unwrap_or(0)
    ));
    if let Some(ty) = playlist_type {
        out.push_str(&format!("#EXT-X-PLAYLIST-TYPE:{}\n", ty));
    }
    for segment in segments {
        if segment.discontinuity {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }
        out.push_str(&format!("#EXTINF:{:.3},\n", segment.duration_seconds));
        out.push_str(&format!("segment{}.ts\n", segment.sequence));
    }
    if ended {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_playlist_v3_shape() {
        let window = SegmentWindow::new(8);
        for _ in 0..3 {
            window.push(Bytes::from_static(b"seg"), 4.1, None, None, true, false);
        }
        let playlist = render_ts_playlist(&window.tail(2), 4.0, None, false);
        let lines: Vec<&str> = playlist.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXT-X-VERSION:3");
        assert_eq!(lines[2], "#EXT-X-TARGETDURATION:4");
        assert_eq!(lines[3], "#EXT-X-MEDIA-SEQUENCE:1");
        assert_eq!(lines[4], "#EXTINF:4.100,");
        assert_eq!(lines[5], "segment1.ts");
        assert!(!playlist.contains("EXT-X-MAP"));
    }

    #[test]
    fn test_playlist_type_and_endlist() {
        let window = SegmentWindow::new(8);
        window.push(Bytes::from_static(b"seg"), 4.0, None, None, true, false);
        window.mark_ended();
        let playlist = render_ts_playlist(&window.tail(5), 4.0, Some("EVENT"), window.is_ended());
        assert!(playlist.contains("#EXT-X-PLAYLIST-TYPE:EVENT"));
        assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn test_every_playlist_segment_is_retrievable() {
        let window = SegmentWindow::new(3);
        for _ in 0..6 {
            window.push(Bytes::from_static(b"seg"), 4.0, None, None, true, false);
        }
        let segments = window.tail(5);
        // Window retains 3 of the 6; the playlist may only reference those.
        assert_eq!(segments.len(), 3);
        for segment in &segments {
            assert!(window.get(segment.sequence).is_some());
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let buffer = SharedEsBuffer::new(Default::default(), CancellationToken::new());
        let processor = HlsTsProcessor::new(
            buffer,
            VariantKey::Copy,
            SegmentConfig::default(),
            &CancellationToken::new(),
        );
        processor.stop().await;
        processor.stop().await;
        assert!(matches!(
            processor.start().await,
            Err(RelayError::Stopping)
        ));
    }
}
