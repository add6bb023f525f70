//! Sessions and the session manager
//!
//! One session per channel: one upstream fetch, one shared buffer, one
//! demuxer, and the processors clients asked for. The manager owns the
//! session map, enforces capacity, consults the circuit breaker on
//! creation and sweeps away idle or closed sessions.

use chrono::{DateTime, Utc};
use std::fmt;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::{SharedEsBuffer, VariantKey};
use crate::circuit::CircuitBreakerRegistry;
use crate::classify::{Classification, StreamClassifier, UrlClassifier};
use crate::config::{ProfileConfig, RelayConfig};
use crate::demux::TsDemuxer;
use crate::error::{RelayError, Result};
use crate::processor::{
    DashProcessor, FormatProcessor, HlsFmp4Processor, HlsTsProcessor, MpegtsProcessor,
};
use crate::routing::{ClientFormat, RouteDecision, RoutePath};
use crate::transcode::{TranscodeSupervisor, TranscodeTarget, TranscoderWorker};
use crate::upstream::{spawn_pump, UpstreamSource};

/// Cadence of the derived-variant idle sweep inside a session.
const VARIANT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct Session {
    pub id: String,
    pub channel_id: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    profile: ProfileConfig,
    config: RelayConfig,
    classification: Classification,
    buffer: Arc<SharedEsBuffer>,
    cancel: CancellationToken,
    processors: parking_lot::RwLock<HashMap<ClientFormat, FormatProcessor>>,
    /// Serialises processor creation per format
    create_lock: Mutex<()>,
    transcode: Arc<TranscodeSupervisor>,
    pump_watch: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    last_activity_secs: AtomicU64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("channel_id", &self.channel_id)
            .field("url", &self.url)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl Session {
    pub fn buffer(&self) -> &Arc<SharedEsBuffer> {
        &self.buffer
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    pub fn profile(&self) -> &ProfileConfig {
        &self.profile
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        self.last_activity_secs.store(unix_secs(), Ordering::Relaxed);
    }

    pub fn idle_secs(&self) -> u64 {
        unix_secs().saturating_sub(self.last_activity_secs.load(Ordering::Relaxed))
    }

    pub fn total_clients(&self) -> usize {
        self.processors.read().values().map(|p| p.client_count()).sum()
    }

    /// True when every processor considers itself idle and nobody is
    /// connected.
    pub fn is_idle(&self) -> bool {
        let processors = self.processors.read();
        processors.values().all(|p| p.is_idle()) && processors.values().all(|p| p.client_count() == 0)
    }

    /// The variant a decision reads from: transcoded decisions get their
    /// derived variant (spawning the worker on first need), everything
    /// else reads the source.
    async fn variant_key_for(&self, decision: &RouteDecision) -> Result<VariantKey> {
        let transcoding = decision.path == RoutePath::Transcode
            && (decision.video_codec != "copy" || decision.audio_codec != "copy");
        if !transcoding {
            return Ok(VariantKey::Copy);
        }
        let target = TranscodeTarget {
            video_codec: decision.video_codec.clone(),
            audio_codec: decision.audio_codec.clone(),
        };
        self.transcode
            .ensure_variant(&self.buffer, target.clone(), &self.cancel)
            .await?;
        Ok(target.variant_key())
    }

    /// Return the processor for a decision, creating and starting it on
    /// first use.
    pub async fn processor_for(&self, decision: &RouteDecision) -> Result<FormatProcessor> {
        if self.is_closed() {
            return Err(RelayError::Stopping);
        }
        self.touch();
        let format = decision.client_format;
        if let Some(existing) = self.processors.read().get(&format) {
            return Ok(existing.clone());
        }
        let _guard = self.create_lock.lock().await;
        if let Some(existing) = self.processors.read().get(&format) {
            return Ok(existing.clone());
        }

        let variant_key = self.variant_key_for(decision).await?;
        let processor = match format {
            ClientFormat::HlsTs => FormatProcessor::HlsTs(HlsTsProcessor::new(
                self.buffer.clone(),
                variant_key,
                self.config.segment.clone(),
                &self.cancel,
            )),
            ClientFormat::HlsFmp4 => FormatProcessor::HlsFmp4(HlsFmp4Processor::new(
                self.buffer.clone(),
                variant_key,
                self.config.segment.clone(),
                &self.cancel,
            )),
            ClientFormat::Dash => FormatProcessor::Dash(DashProcessor::new(
                self.buffer.clone(),
                variant_key,
                self.config.segment.clone(),
                &self.cancel,
            )),
            ClientFormat::Mpegts => FormatProcessor::Mpegts(MpegtsProcessor::new(
                self.buffer.clone(),
                variant_key,
                self.config.delivery.clone(),
                &self.cancel,
            )),
        };
        processor.start().await?;
        tracing::info!(
            channel = %self.channel_id,
            format = format.as_str(),
            path = ?decision.path,
            reasons = ?decision.reasons,
            "processor started"
        );
        self.processors.write().insert(format, processor.clone());
        Ok(processor)
    }

    fn on_upstream_complete(&self) {
        for processor in self.processors.read().values() {
            processor.mark_ended();
        }
    }

    /// Best-effort teardown: each processor is stopped exactly once even
    /// when called repeatedly.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(channel = %self.channel_id, session = %self.id, "closing session");
        self.cancel.cancel();
        let processors: Vec<FormatProcessor> = {
            let mut map = self.processors.write();
            map.drain().map(|(_, p)| p).collect()
        };
        for processor in processors {
            processor.stop().await;
        }
        self.buffer.close();
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
        // Abort rather than await: the watcher itself calls close() on
        // upstream faults and must not join its own task.
        if let Some(handle) = self.pump_watch.lock().await.take() {
            handle.abort();
        }
    }

    pub fn debug_json(&self) -> serde_json::Value {
        let processors: Vec<serde_json::Value> = self
            .processors
            .read()
            .values()
            .map(|p| {
                serde_json::json!({
                    "format": p.format().as_str(),
                    "clients": p.client_count(),
                    "bytes_served": p.bytes_served(),
                    "idle": p.is_idle(),
                })
            })
            .collect();
        serde_json::json!({
            "session_id": self.id,
            "channel_id": self.channel_id,
            "url": self.url,
            "created_at": self.created_at.to_rfc3339(),
            "source_format": self.classification.format,
            "variants": self.buffer.variant_keys(),
            "clients": self.total_clients(),
            "processors": processors,
        })
    }
}

pub struct SessionManager {
    config: RelayConfig,
    sessions: DashMap<String, Arc<Session>>,
    by_channel: DashMap<String, String>,
    classifier: Arc<dyn StreamClassifier>,
    breakers: CircuitBreakerRegistry,
    transcode: Arc<TranscodeSupervisor>,
    cancel: CancellationToken,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Self::with_parts(config, Arc::new(UrlClassifier), None)
    }

    pub fn with_parts(
        config: RelayConfig,
        classifier: Arc<dyn StreamClassifier>,
        transcoder: Option<Arc<dyn TranscoderWorker>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: DashMap::new(),
            by_channel: DashMap::new(),
            classifier,
            breakers: CircuitBreakerRegistry::new(),
            transcode: Arc::new(TranscodeSupervisor::new(transcoder)),
            cancel: CancellationToken::new(),
            cleanup: Mutex::new(None),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn session_for_channel(&self, channel_id: &str) -> Option<Arc<Session>> {
        let id = self.by_channel.get(channel_id)?.clone();
        self.sessions.get(&id).map(|s| s.clone()).filter(|s| !s.is_closed())
    }

    /// Reuse the channel's open session or dial the upstream and create
    /// one, bounded by `max_sessions`.
    pub async fn get_or_create_session(
        &self,
        channel_id: &str,
        url: &str,
        profile: ProfileConfig,
    ) -> Result<Arc<Session>> {
        if let Some(existing) = self.session_for_channel(channel_id) {
            existing.touch();
            return Ok(existing);
        }
        if self.sessions.len() >= self.config.session.max_sessions {
            return Err(RelayError::MaxSessions);
        }
        if !self.breakers.allow(url) {
            return Err(RelayError::CircuitOpen(url.to_string()));
        }
        let source = match UpstreamSource::connect(url).await {
            Ok(source) => {
                self.breakers.record_success(url);
                source
            }
            Err(e) => {
                self.breakers.record_failure(url);
                return Err(e);
            }
        };
        self.create_with_source(channel_id, url, profile, source).await
    }

    /// Build a session around an already-connected source. Used directly
    /// by tests and by embedders that fetch upstreams themselves.
    pub async fn create_with_source(
        &self,
        channel_id: &str,
        url: &str,
        profile: ProfileConfig,
        source: UpstreamSource,
    ) -> Result<Arc<Session>> {
        if self.sessions.len() >= self.config.session.max_sessions {
            return Err(RelayError::MaxSessions);
        }
        let classification = self.classifier.classify(url);
        let cancel = self.cancel.child_token();
        let buffer = SharedEsBuffer::new(self.config.buffer.clone(), cancel.clone());
        let demuxer = TsDemuxer::new(buffer.clone(), None);
        let pump = spawn_pump(source, demuxer, cancel.clone());

        let session = Arc::new(Session {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            url: url.to_string(),
            created_at: Utc::now(),
            profile,
            config: self.config.clone(),
            classification,
            buffer: buffer.clone(),
            cancel: cancel.clone(),
            processors: parking_lot::RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            transcode: self.transcode.clone(),
            pump_watch: Mutex::new(None),
            sweeper: Mutex::new(None),
            closed: AtomicBool::new(false),
            last_activity_secs: AtomicU64::new(unix_secs()),
        });

        // Watch the pump: EOF marks windows ended, faults close the session.
        let watcher = {
            let session = session.clone();
            tokio::spawn(async move {
                match pump.await {
                    Ok(Ok(())) => {
                        tracing::info!(channel = %session.channel_id, "upstream completed");
                        session.on_upstream_complete();
                    }
                    Ok(Err(RelayError::Stopping)) => {}
                    Ok(Err(e)) => {
                        tracing::error!(channel = %session.channel_id, error = %e, "upstream failed");
                        session.close().await;
                    }
                    Err(join_err) => {
                        tracing::error!(channel = %session.channel_id, error = %join_err, "pump panicked");
                        session.close().await;
                    }
                }
            })
        };
        *session.pump_watch.lock().await = Some(watcher);

        // Periodic derived-variant garbage collection.
        let sweeper = {
            let buffer = buffer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(VARIANT_SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {
                            buffer.sweep_idle_variants();
                        }
                    }
                }
            })
        };
        *session.sweeper.lock().await = Some(sweeper);

        self.sessions.insert(session.id.clone(), session.clone());
        self.by_channel
            .insert(channel_id.to_string(), session.id.clone());
        tracing::info!(channel = channel_id, session = %session.id, url, "session created");
        Ok(session)
    }

    /// Idempotent best-effort close.
    pub async fn close_session(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            self.by_channel.remove(&session.channel_id);
            session.close().await;
        }
    }

    /// Remove closed sessions and close sessions idle past the timeout.
    pub async fn cleanup_pass(&self) -> usize {
        let timeout = self.config.session.session_timeout().as_secs();
        let mut stale = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.is_closed() {
                stale.push(session.id.clone());
            } else if session.total_clients() == 0 && session.idle_secs() > timeout {
                stale.push(session.id.clone());
            }
        }
        let count = stale.len();
        for id in stale {
            self.close_session(&id).await;
        }
        count
    }

    /// Launch the background cleanup sweep.
    pub fn start_cleanup(self: &Arc<Self>) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.session.cleanup_interval());
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let removed = manager.cleanup_pass().await;
                        if removed > 0 {
                            tracing::debug!(removed, "session cleanup pass");
                        }
                    }
                }
            }
        });
        if let Ok(mut slot) = self.cleanup.try_lock() {
            *slot = Some(handle);
        }
    }

    /// Stop everything: all sessions and the cleanup task.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close_session(&id).await;
        }
        if let Some(handle) = self.cleanup.lock().await.take() {
            handle.abort();
        }
    }

    pub fn debug_json(&self) -> serde_json::Value {
        let sessions: Vec<serde_json::Value> =
            self.sessions.iter().map(|e| e.value().debug_json()).collect();
        serde_json::json!({
            "count": sessions.len(),
            "max_sessions": self.config.session.max_sessions,
            "sessions": sessions,
        })
    }
}
