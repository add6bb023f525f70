//! Transcoder worker seam
//!
//! The encoder itself lives outside this crate. A worker implementation
//! reads samples from the source variant and feeds the derived variant,
//! either as MPEG-TS bytes (piped through a dedicated demuxer) or as
//! direct sample emissions. Worker failure propagates to the variant so
//! every consumer observes the shutdown.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::buffer::{CodecVariant, SharedEsBuffer, VariantKey};
use crate::demux::TsDemuxer;
use crate::error::{RelayError, Result};

/// Target of a transcode: the derived variant's codec pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeTarget {
    pub video_codec: String,
    pub audio_codec: String,
}

impl TranscodeTarget {
    pub fn variant_key(&self) -> VariantKey {
        VariantKey::codecs(&self.video_codec, &self.audio_codec)
    }
}

/// Write side handed to a worker.
pub struct TranscodeOutput {
    buffer: Arc<SharedEsBuffer>,
    variant: Arc<CodecVariant>,
    key: VariantKey,
    demuxer: Mutex<TsDemuxer>,
}

impl TranscodeOutput {
    fn new(buffer: Arc<SharedEsBuffer>, variant: Arc<CodecVariant>, key: VariantKey) -> Arc<Self> {
        let demuxer = TsDemuxer::with_target(buffer.clone(), key.clone(), None);
        Arc::new(Self {
            buffer,
            variant,
            key,
            demuxer: Mutex::new(demuxer),
        })
    }

    /// Pipe encoder MPEG-TS output into the derived variant.
    pub fn write_ts(&self, bytes: &[u8]) -> Result<()> {
        self.demuxer.lock().write(bytes)
    }

    /// Direct sample emission for workers that skip the TS detour.
    pub fn write_video_sample(&self, pts: i64, dts: i64, data: Bytes, is_keyframe: bool) {
        self.buffer
            .write_video_to_variant(&self.key, pts, dts, data, is_keyframe);
    }

    pub fn write_audio_sample(&self, pts: i64, data: Bytes) {
        self.buffer.write_audio_to_variant(&self.key, pts, data);
    }

    pub fn set_video_init(&self, data: Bytes) {
        self.variant.video().set_init_data(data);
    }

    pub fn set_audio_init(&self, data: Bytes) {
        self.variant.audio().set_init_data(data);
    }

    /// Flag the variant failing; all consumers receive a variant-level
    /// shutdown and keep whatever they already produced.
    pub fn fail(&self, reason: &str) {
        tracing::error!(variant = %self.key, reason, "transcoder worker failed");
        self.variant.fail(reason);
    }

    /// Clean completion: flush the demuxer tail.
    pub fn complete(&self) {
        self.demuxer.lock().finish();
        tracing::info!(variant = %self.key, "transcoder worker completed");
    }
}

/// Implemented by the embedding application; `launch` must not block and
/// spawns whatever tasks or subprocesses the encoder needs.
pub trait TranscoderWorker: Send + Sync {
    fn launch(
        &self,
        source: Arc<CodecVariant>,
        target: TranscodeTarget,
        output: Arc<TranscodeOutput>,
    ) -> Result<()>;
}

/// Creates derived variants and hands them to the configured worker.
pub struct TranscodeSupervisor {
    worker: Option<Arc<dyn TranscoderWorker>>,
}

impl TranscodeSupervisor {
    pub fn new(worker: Option<Arc<dyn TranscoderWorker>>) -> Self {
        Self { worker }
    }

    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// Ensure a worker feeds the derived variant for `target`. Idempotent
    /// per variant: a live (unfailed) variant is reused as is.
    pub async fn ensure_variant(
        &self,
        buffer: &Arc<SharedEsBuffer>,
        target: TranscodeTarget,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Arc<CodecVariant>> {
        let worker = self
            .worker
            .clone()
            .ok_or_else(|| RelayError::VariantFailed("no transcoder worker configured".into()))?;
        let key = target.variant_key();
        let existed = key
            .canonical()
            .and_then(|k| buffer.variant(&k))
            .filter(|v| !v.is_failed())
            .is_some();
        let variant = buffer.get_or_create_variant(&key, cancel).await?;
        if existed || !variant.is_derived() {
            return Ok(variant);
        }
        let source = buffer.source();
        let output = TranscodeOutput::new(buffer.clone(), variant.clone(), key);
        worker.launch(source, target, output)?;
        Ok(variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SharedEsBuffer;
    use tokio_util::sync::CancellationToken;

    struct NoopWorker;

    impl TranscoderWorker for NoopWorker {
        fn launch(
            &self,
            _source: Arc<CodecVariant>,
            _target: TranscodeTarget,
            output: Arc<TranscodeOutput>,
        ) -> Result<()> {
            // Emit one sample synchronously so the test can observe it.
            output.write_video_sample(0, 0, Bytes::from_static(b"kf"), true);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_supervisor_launches_worker_once() {
        let buffer = SharedEsBuffer::new(Default::default(), CancellationToken::new());
        buffer.publish_source_codecs(Some("vp9"), Some("opus"));
        let supervisor = TranscodeSupervisor::new(Some(Arc::new(NoopWorker)));
        let cancel = CancellationToken::new();
        let target = TranscodeTarget {
            video_codec: "h264".into(),
            audio_codec: "aac".into(),
        };
        let variant = supervisor
            .ensure_variant(&buffer, target.clone(), &cancel)
            .await
            .unwrap();
        assert!(variant.is_derived());
        assert_eq!(variant.video().count(), 1);

        // Second call reuses the live variant without relaunching.
        let again = supervisor
            .ensure_variant(&buffer, target, &cancel)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&variant, &again));
        assert_eq!(again.video().count(), 1);
    }

    #[tokio::test]
    async fn test_supervisor_without_worker_fails() {
        let buffer = SharedEsBuffer::new(Default::default(), CancellationToken::new());
        let supervisor = TranscodeSupervisor::new(None);
        let cancel = CancellationToken::new();
        let target = TranscodeTarget {
            video_codec: "h264".into(),
            audio_codec: "aac".into(),
        };
        let err = supervisor
            .ensure_variant(&buffer, target, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::VariantFailed(_)));
    }

    #[tokio::test]
    async fn test_output_failure_propagates_to_variant() {
        let buffer = SharedEsBuffer::new(Default::default(), CancellationToken::new());
        buffer.publish_source_codecs(Some("vp9"), Some("opus"));
        let cancel = CancellationToken::new();
        let key = VariantKey::codecs("h264", "aac");
        let variant = buffer.get_or_create_variant(&key, &cancel).await.unwrap();
        let output = TranscodeOutput::new(buffer, variant.clone(), key);
        output.fail("encoder crashed");
        assert!(variant.is_failed());
        assert!(variant.cancelled().is_cancelled());
    }
}
