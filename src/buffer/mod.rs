//! Shared elementary-stream buffer
//!
//! One buffer per session. It owns the source variant (fed by the demuxer)
//! and any derived variants (fed by transcoder workers), fans samples out to
//! the format processors, and garbage collects derived variants that nobody
//! reads. Producers never block on slow consumers; slowness is handled by
//! per-track eviction.

mod track;
mod variant;

pub use track::{Sample, Track, TrackKind};
pub use variant::{CodecVariant, VariantKey};

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::BufferConfig;
use crate::error::{RelayError, Result};

/// The set of codec variants for one session.
pub struct SharedEsBuffer {
    config: BufferConfig,
    source: Arc<CodecVariant>,
    derived: RwLock<HashMap<String, Arc<CodecVariant>>>,
    processors: RwLock<HashSet<String>>,
    /// Signalled when the source codec pair becomes known
    resolved: Notify,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl SharedEsBuffer {
    pub fn new(config: BufferConfig, cancel: CancellationToken) -> Arc<Self> {
        let source = CodecVariant::new(&config, false, &cancel);
        Arc::new(Self {
            config,
            source,
            derived: RwLock::new(HashMap::new()),
            processors: RwLock::new(HashSet::new()),
            resolved: Notify::new(),
            closed: AtomicBool::new(false),
            cancel,
        })
    }

    pub fn source(&self) -> Arc<CodecVariant> {
        self.source.clone()
    }

    /// Canonical key of the source variant once resolved.
    pub fn source_key(&self) -> Option<String> {
        self.source.key()
    }

    /// Called by the demuxer after PAT/PMT parse. Safe to call more than
    /// once; only the first resolution wakes waiters.
    pub fn publish_source_codecs(&self, video: Option<&str>, audio: Option<&str>) {
        let was_resolved = self.source.key().is_some();
        if let Some(v) = video {
            self.source.video().set_codec(v);
        }
        if let Some(a) = audio {
            self.source.audio().set_codec(a);
        }
        if !was_resolved && self.source.key().is_some() {
            self.resolved.notify_waiters();
        }
    }

    pub fn register_processor(&self, id: &str) {
        self.processors.write().insert(id.to_string());
    }

    pub fn unregister_processor(&self, id: &str) {
        self.processors.write().remove(id);
    }

    pub fn processor_count(&self) -> usize {
        self.processors.read().len()
    }

    /// Resolve `key` to a variant, creating a derived one on first request.
    ///
    /// For [`VariantKey::Copy`] this waits until the source variant has a
    /// resolved codec pair, bounded by the configured resolve timeout, and
    /// returns the source under that identity.
    pub async fn get_or_create_variant(
        &self,
        key: &VariantKey,
        cancel: &CancellationToken,
    ) -> Result<Arc<CodecVariant>> {
        let canonical = match key {
            VariantKey::Copy => {
                self.wait_source_resolved(cancel).await?;
                return Ok(self.source.clone());
            }
            VariantKey::Codecs { .. } => key.canonical().expect("concrete key"),
        };

        if self.source.key().as_deref() == Some(canonical.as_str()) {
            return Ok(self.source.clone());
        }

        if let Some(existing) = self.derived.read().get(&canonical) {
            return Ok(existing.clone());
        }

        let mut derived = self.derived.write();
        if let Some(existing) = derived.get(&canonical) {
            return Ok(existing.clone());
        }
        let variant = CodecVariant::new(&self.config, true, &self.cancel);
        if let VariantKey::Codecs { video, audio } = key {
            variant.video().set_codec(video);
            variant.audio().set_codec(audio);
        }
        tracing::debug!(key = %canonical, "created derived variant");
        derived.insert(canonical, variant.clone());
        Ok(variant)
    }

    async fn wait_source_resolved(&self, cancel: &CancellationToken) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.resolve_timeout();
        loop {
            let notified = self.resolved.notified();
            if self.source.key().is_some() {
                return Ok(());
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(RelayError::Stopping),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(RelayError::SourceUnresolved(self.config.resolve_timeout()));
                }
            }
        }
    }

    /// Look up an existing variant without creating one.
    pub fn variant(&self, canonical: &str) -> Option<Arc<CodecVariant>> {
        if self.source.key().as_deref() == Some(canonical) {
            return Some(self.source.clone());
        }
        self.derived.read().get(canonical).cloned()
    }

    /// All live variant keys, source first.
    pub fn variant_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(k) = self.source.key() {
            keys.push(k);
        }
        keys.extend(self.derived.read().keys().cloned());
        keys
    }

    fn write_target(&self, key: &VariantKey) -> Option<Arc<CodecVariant>> {
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!("dropping write to closed buffer");
            return None;
        }
        match key {
            VariantKey::Copy => Some(self.source.clone()),
            VariantKey::Codecs { .. } => {
                let canonical = key.canonical().expect("concrete key");
                let target = self.variant(&canonical);
                if target.is_none() {
                    tracing::debug!(key = %canonical, "dropping write to unknown variant");
                }
                target
            }
        }
    }

    /// Write one video sample to `key`. Writes to a closed buffer or an
    /// unknown variant are dropped after logging; producers never block.
    pub fn write_video_to_variant(
        &self,
        key: &VariantKey,
        pts: i64,
        dts: i64,
        data: Bytes,
        is_keyframe: bool,
    ) {
        if let Some(variant) = self.write_target(key) {
            variant.write_video(pts, dts, data, is_keyframe);
        }
    }

    pub fn write_audio_to_variant(&self, key: &VariantKey, pts: i64, data: Bytes) {
        if let Some(variant) = self.write_target(key) {
            variant.write_audio(pts, data);
        }
    }

    /// Shortcut targeting the source variant.
    pub fn write_source_video(&self, pts: i64, dts: i64, data: Bytes, is_keyframe: bool) {
        self.write_video_to_variant(&VariantKey::Copy, pts, dts, data, is_keyframe);
    }

    /// Shortcut targeting the source variant.
    pub fn write_source_audio(&self, pts: i64, data: Bytes) {
        self.write_audio_to_variant(&VariantKey::Copy, pts, data);
    }

    /// Tear down derived variants whose last consumer read is older than the
    /// configured idle timeout. Returns the removed keys.
    pub fn sweep_idle_variants(&self) -> Vec<String> {
        let timeout = self.config.variant_idle_timeout().as_secs();
        let mut removed = Vec::new();
        let mut derived = self.derived.write();
        derived.retain(|key, variant| {
            if variant.idle_secs() > timeout {
                variant.shutdown();
                removed.push(key.clone());
                false
            } else {
                true
            }
        });
        drop(derived);
        for key in &removed {
            tracing::info!(key = %key, "derived variant idle, torn down");
        }
        removed
    }

    /// Close the buffer: subsequent writes are dropped and all variants are
    /// cancelled. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.source.shutdown();
            for variant in self.derived.read().values() {
                variant.shutdown();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
