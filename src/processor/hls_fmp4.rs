//! HLS processor with fMP4 (CMAF) segments
//!
//! Serves an HLSv7 playlist referencing `init.mp4` through `EXT-X-MAP`
//! plus `segment<seq>.m4s` media segments from a sliding window.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
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

pub struct HlsFmp4Processor {
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

impl HlsFmp4Processor {
    pub fn new(
        buffer: Arc<SharedEsBuffer>,
        variant_key: VariantKey,
        config: SegmentConfig,
        parent_cancel: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            consumer_id: format!("hls-fmp4-{}", uuid::Uuid::new_v4().simple()),
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

    /// Resolve the variant, register as a consumer and launch the loop.
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
        ClientFormat::HlsFmp4
    }

    /// Idle when no playlist request arrived within twice the playlist
    /// window span.
    pub fn is_idle(&self) -> bool {
        let idle_after = (self.config.playlist_segments as f64 * self.config.target_duration_secs * 2.0)
            .max(1.0) as u64;
        unix_secs().saturating_sub(self.last_manifest_secs.load(Ordering::Relaxed)) > idle_after
    }

    fn touch_manifest(&self) {
        self.last_manifest_secs.store(unix_secs(), Ordering::Relaxed);
    }

    /// Render the HLSv7 media playlist, waiting briefly for the first
    /// segment to exist.
    pub async fn playlist(&self) -> Result<String> {
        self.touch_manifest();
        self.window
            .wait_nonempty(self.config.manifest_wait(), &self.cancel)
            .await?;
        let segments = self.window.tail(self.config.playlist_segments);
        if segments.is_empty() {
            return Err(RelayError::NoSegments);
        }
        Ok(render_fmp4_playlist(
            &segments,
            self.config.target_duration_secs,
            self.window.is_ended(),
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

    /// Upstream reached EOF: playlists may advertise the end.
    pub fn mark_ended(&self) {
        self.window.mark_ended();
    }
}

pub(super) fn render_fmp4_playlist(segments: &[Arc<Segment>], target: f64, ended: bool) -> String {
    let mut out = String::with_capacity(256);
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:7\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target.ceil() as u64));
    out.push_str(&format!(
        "#EXT-X-MEDIA-SEQUENCE:{}\n",
        segments.first().map(|s| s.sequence).unwrap_or(0)
    ));
    out.push_str("#EXT-X-MAP:URI=\"init.mp4\"\n");
    for segment in segments {
        if segment.discontinuity {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }
        out.push_str(&format!("#EXTINF:{:.3},\n", segment.duration_seconds));
        out.push_str(&format!("segment{}.m4s\n", segment.sequence));
    }
    if ended {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}
