//! DASH processor
//!
//! Shares the CMAF engine with the HLS-fMP4 processor and serves a live
//! MPD instead of a playlist. `availabilityStartTime` is pinned to the
//! wall time of the first segment the session produced.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::{SharedEsBuffer, VariantKey};
use crate::config::SegmentConfig;
use crate::error::{RelayError, Result};
use crate::mux::InitSegment;
use crate::routing::ClientFormat;

use super::cmaf::{run_cmaf_loop, CmafEngine};
use super::{ClientRecord, Segment, SegmentWindow, VariantReader};

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct DashProcessor {
    consumer_id: String,
    buffer: Arc<SharedEsBuffer>,
    variant_key: VariantKey,
    config: SegmentConfig,
    window: Arc<SegmentWindow>,
    init: Arc<RwLock<Option<Arc<InitSegment>>>>,
    availability_start: Arc<OnceLock<DateTime<Utc>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    clients: RwLock<HashMap<String, Arc<ClientRecord>>>,
    last_manifest_secs: AtomicU64,
    bytes_served: AtomicU64,
}

impl DashProcessor {
    pub fn new(
        buffer: Arc<SharedEsBuffer>,
        variant_key: VariantKey,
        config: SegmentConfig,
        parent_cancel: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            consumer_id: format!("dash-{}", uuid::Uuid::new_v4().simple()),
            buffer,
            variant_key,
            window: Arc::new(SegmentWindow::new(config.max_segments)),
            init: Arc::new(RwLock::new(None)),
            availability_start: Arc::new(OnceLock::new()),
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
        let reader = VariantReader::new(variant.clone(), &self.consumer_id);
        let engine = CmafEngine::new(
            variant.video().codec().as_deref(),
            variant.audio().codec().as_deref(),
            self.window.clone(),
            self.init.clone(),
            self.availability_start.clone(),
        );
        let target = self.config.target_duration_secs;
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(run_cmaf_loop(reader, engine, target, cancel));
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
        ClientFormat::Dash
    }

    pub fn is_idle(&self) -> bool {
        let idle_after = (self.config.playlist_segments as f64 * self.config.target_duration_secs * 2.0)
            .max(1.0) as u64;
        unix_secs().saturating_sub(self.last_manifest_secs.load(Ordering::Relaxed)) > idle_after
    }

    /// Render the live MPD, waiting briefly for the first segment.
    pub async fn manifest(&self) -> Result<String> {
        self.last_manifest_secs.store(unix_secs(), Ordering::Relaxed);
        self.window
            .wait_nonempty(self.config.manifest_wait(), &self.cancel)
            .await?;
        let segments = self.window.tail(self.config.playlist_segments);
        if segments.is_empty() {
            return Err(RelayError::NoSegments);
        }
        let init = self.init_segment()?;
        let availability = self
            .availability_start
            .get()
            .copied()
            .unwrap_or_else(Utc::now);
        Ok(render_mpd(
            &segments,
            &init,
            availability,
            self.config.target_duration_secs,
            self.config.min_buffer_secs,
        ))
    }

    pub fn init_segment(&self) -> Result<Arc<InitSegment>> {
        self.init.read().clone().ok_or(RelayError::InitSegmentNotReady)
    }

    pub fn segment(&self, sequence: u64) -> Result<Arc<Segment>> {
        self.window
            .get(sequence)
            .ok_or(RelayError::SegmentNotFound { sequence })
    }

    pub fn segment_count(&self) -> usize {
        self.window.len()
    }

    /// Upstream reached EOF; kept for parity with the HLS processors.
    pub fn mark_ended(&self) {
        self.window.mark_ended();
    }
}

fn render_mpd(
    segments: &[Arc<Segment>],
    init: &InitSegment,
    availability_start: DateTime<Utc>,
    target: f64,
    min_buffer: f64,
) -> String {
    let start_number = segments.first().map(|s| s.sequence).unwrap_or(0);
    let mut mpd = String::with_capacity(1024);
    mpd.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    let _ = write!(
        mpd,
        "<MPD xmlns=\"urn:mpeg:dash:schema:mpd:2011\" type=\"dynamic\" \
         profiles=\"urn:mpeg:dash:profile:isoff-live:2011\" \
         minBufferTime=\"PT{}S\" minimumUpdatePeriod=\"PT{}S\" \
         availabilityStartTime=\"{}\" publishTime=\"{}\">\n",
        min_buffer,
        target,
        availability_start.to_rfc3339_opts(SecondsFormat::Millis, true),
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    mpd.push_str("  <Period id=\"0\" start=\"PT0S\">\n");

    if init.has_video {
        mpd.push_str(
            "    <AdaptationSet contentType=\"video\" mimeType=\"video/mp4\" segmentAlignment=\"true\">\n",
        );
        let _ = write!(
            mpd,
            "      <Representation id=\"video\" codecs=\"{}\" width=\"{}\" height=\"{}\" bandwidth=\"0\">\n",
            init.video_codec_string.as_deref().unwrap_or("avc1"),
            init.width,
            init.height,
        );
        let _ = write!(
            mpd,
            "        <SegmentTemplate media=\"segment$Number$.m4s\" initialization=\"init.mp4\" \
             timescale=\"{}\" startNumber=\"{}\">\n",
            init.timescale, start_number,
        );
        mpd.push_str("          <SegmentTimeline>\n");
        for segment in segments {
            let ticks = (segment.duration_seconds * init.timescale as f64).round() as u64;
            let _ = writeln!(mpd, "            <S d=\"{}\"/>", ticks);
        }
        mpd.push_str("          </SegmentTimeline>\n");
        mpd.push_str("        </SegmentTemplate>\n");
        mpd.push_str("      </Representation>\n");
        mpd.push_str("    </AdaptationSet>\n");
    }

    if init.has_audio {
        mpd.push_str("    <AdaptationSet contentType=\"audio\" mimeType=\"audio/mp4\">\n");
        let _ = write!(
            mpd,
            "      <Representation id=\"audio\" codecs=\"{}\" audioSamplingRate=\"{}\" bandwidth=\"0\">\n",
            init.audio_codec_string.as_deref().unwrap_or("mp4a.40.2"),
            init.audio_sample_rate,
        );
        let _ = write!(
            mpd,
            "        <SegmentTemplate media=\"segment$Number$.m4s\" initialization=\"init.mp4\" \
             timescale=\"{}\" startNumber=\"{}\"/>\n",
            init.timescale, start_number,
        );
        mpd.push_str("      </Representation>\n");
        mpd.push_str("    </AdaptationSet>\n");
    }

    mpd.push_str("  </Period>\n");
    mpd.push_str("</MPD>\n");
    mpd
}
