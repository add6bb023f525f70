//! Shared CMAF segment engine
//!
//! The HLS-fMP4 and DASH processors accumulate identically: samples are
//! adapted and retained until codec parameters allow an init segment, then
//! each keyframe-aligned batch becomes one `moof+mdat` segment in the
//! processor's window. Init generation is the only place the pipeline
//! defers: a flush without parameters returns `NotYet` and keeps the
//! accumulator, bounded by a hard byte cap.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use crate::buffer::Sample;
use crate::error::{RelayError, Result};
use crate::mux::fmp4::{self, FragSample, InitSegment};
use crate::mux::Fmp4Adapter;

use super::SegmentWindow;

/// Pending accumulators may not grow without bound while init generation
/// defers; past this the processor fails terminally.
const PENDING_CAP_BYTES: usize = 32 * 1024 * 1024;

/// Default tick counts when a sample's duration cannot be derived.
const DEFAULT_VIDEO_DURATION: u32 = 3600; // 25 fps
const DEFAULT_AUDIO_DURATION: u32 = 1920; // AAC at 48 kHz

/// Outcome of a flush attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FlushOutcome {
    /// A segment was produced.
    Flushed,
    /// Codec parameters are still missing; samples were retained.
    NotYet,
    /// Nothing to flush.
    Empty,
}

struct Pending {
    data: Bytes,
    pts: i64,
    dts: i64,
    keyframe: bool,
}

pub(crate) struct CmafEngine {
    adapter: Fmp4Adapter,
    window: Arc<SegmentWindow>,
    init: Arc<RwLock<Option<Arc<InitSegment>>>>,
    availability_start: Arc<OnceLock<DateTime<Utc>>>,
    video: Vec<Pending>,
    audio: Vec<Pending>,
    pending_bytes: usize,
    segment_wall_start: Instant,
    /// Session dts epoch so tfdt starts near zero
    base_dts: Option<i64>,
    fragment_sequence: u32,
    discontinuity_pending: bool,
}

impl CmafEngine {
    pub fn new(
        video_codec: Option<&str>,
        audio_codec: Option<&str>,
        window: Arc<SegmentWindow>,
        init: Arc<RwLock<Option<Arc<InitSegment>>>>,
        availability_start: Arc<OnceLock<DateTime<Utc>>>,
    ) -> Self {
        Self {
            adapter: Fmp4Adapter::new(video_codec, audio_codec),
            window,
            init,
            availability_start,
            video: Vec::new(),
            audio: Vec::new(),
            pending_bytes: 0,
            segment_wall_start: Instant::now(),
            base_dts: None,
            fragment_sequence: 1,
            discontinuity_pending: false,
        }
    }

    pub fn push_video(&mut self, sample: &Sample) {
        let data = self.adapter.adapt_video(sample);
        if data.is_empty() {
            return;
        }
        if !self.has_content() {
            self.segment_wall_start = Instant::now();
        }
        if self.base_dts.is_none() {
            self.base_dts = Some(sample.dts);
        }
        self.pending_bytes += data.len();
        self.video.push(Pending {
            data,
            pts: sample.pts,
            dts: sample.dts,
            keyframe: sample.is_keyframe,
        });
    }

    pub fn push_audio(&mut self, sample: &Sample, init_data: Option<&Bytes>) {
        let data = self.adapter.adapt_audio(sample, init_data);
        if !self.has_content() {
            self.segment_wall_start = Instant::now();
        }
        if self.base_dts.is_none() {
            self.base_dts = Some(sample.pts);
        }
        self.pending_bytes += data.len();
        self.audio.push(Pending {
            data,
            pts: sample.pts,
            dts: sample.pts,
            keyframe: false,
        });
    }

    pub fn has_content(&self) -> bool {
        !self.video.is_empty() || !self.audio.is_empty()
    }

    pub fn has_video(&self) -> bool {
        !self.video.is_empty()
    }

    /// Media seconds accumulated so far, measured on dts.
    pub fn content_secs(&self) -> f64 {
        let video_span = match (self.video.first(), self.video.last()) {
            (Some(f), Some(l)) => (l.dts - f.dts) as f64 / 90_000.0,
            _ => 0.0,
        };
        let audio_span = match (self.audio.first(), self.audio.last()) {
            (Some(f), Some(l)) => (l.dts - f.dts) as f64 / 90_000.0,
            _ => 0.0,
        };
        video_span.max(audio_span)
    }

    pub fn wall_secs(&self) -> f64 {
        self.segment_wall_start.elapsed().as_secs_f64()
    }

    /// Record a timeline break; the next produced segment carries the flag.
    pub fn mark_discontinuity(&mut self) {
        self.discontinuity_pending = true;
    }

    fn ensure_init(&mut self) -> Result<()> {
        if self.init.read().is_some() {
            return Ok(());
        }
        let video = self
            .adapter
            .video_expected()
            .then(|| self.adapter.video_params().clone());
        let audio = self
            .adapter
            .audio_expected()
            .then(|| self.adapter.audio_params().clone());
        let init = fmp4::build_init(video.as_ref(), audio.as_ref())?;
        tracing::debug!(etag = %init.etag, "init segment generated");
        *self.init.write() = Some(Arc::new(init));
        Ok(())
    }

    fn frag_samples(pending: &[Pending], next_dts: Option<i64>, default_duration: u32) -> Vec<FragSample> {
        let mut out = Vec::with_capacity(pending.len());
        for (i, sample) in pending.iter().enumerate() {
            let duration = pending
                .get(i + 1)
                .map(|n| n.dts - sample.dts)
                .or_else(|| {
                    // The cut sample's dts bounds the last duration.
                    next_dts.map(|n| n - sample.dts).filter(|d| *d > 0)
                })
                .and_then(|d| u32::try_from(d).ok())
                .filter(|d| *d > 0)
                .unwrap_or_else(|| {
                    if i > 0 {
                        (pending[i].dts - pending[i - 1].dts).max(1) as u32
                    } else {
                        default_duration
                    }
                });
            out.push(FragSample {
                data: sample.data.clone(),
                duration,
                composition_offset: (sample.pts - sample.dts) as i32,
                keyframe: sample.keyframe,
            });
        }
        out
    }

    /// Try to cut a segment from everything pending. `next_dts` is the dts
    /// of the keyframe that triggered the cut, when there is one.
    pub fn flush(&mut self, next_dts: Option<i64>) -> Result<FlushOutcome> {
        if !self.has_content() {
            return Ok(FlushOutcome::Empty);
        }
        if !self.adapter.params_ready() {
            if self.pending_bytes > PENDING_CAP_BYTES {
                return Err(RelayError::InitSegmentNotReady);
            }
            return Ok(FlushOutcome::NotYet);
        }
        self.ensure_init()?;

        let base = self.base_dts.unwrap_or(0);
        let video_base = self.video.first().map(|s| (s.dts - base).max(0) as u64).unwrap_or(0);
        let audio_base = self.audio.first().map(|s| (s.dts - base).max(0) as u64).unwrap_or(0);
        let video = Self::frag_samples(&self.video, next_dts, DEFAULT_VIDEO_DURATION);
        let audio = Self::frag_samples(&self.audio, None, DEFAULT_AUDIO_DURATION);

        let duration_ticks: u64 = video
            .iter()
            .map(|s| s.duration as u64)
            .sum::<u64>()
            .max(if video.is_empty() {
                audio.iter().map(|s| s.duration as u64).sum::<u64>()
            } else {
                0
            });
        let data = fmp4::build_fragment(self.fragment_sequence, &video, video_base, &audio, audio_base);
        self.fragment_sequence += 1;

        let pts_start = self
            .video
            .first()
            .map(|s| s.pts)
            .or_else(|| self.audio.first().map(|s| s.pts));
        let pts_end = self
            .video
            .last()
            .map(|s| s.pts)
            .or_else(|| self.audio.last().map(|s| s.pts));
        let keyframe_start = self.video.first().map(|s| s.keyframe).unwrap_or(false);

        let segment = self.window.push(
            data,
            duration_ticks as f64 / 90_000.0,
            pts_start,
            pts_end,
            keyframe_start,
            self.discontinuity_pending,
        );
        let _ = self.availability_start.set(segment.created_at);
        self.discontinuity_pending = false;
        self.video.clear();
        self.audio.clear();
        self.pending_bytes = 0;
        self.segment_wall_start = Instant::now();
        Ok(FlushOutcome::Flushed)
    }

    /// Final flush on shutdown; marks the window ended for playlist
    /// consumers.
    pub fn finish(&mut self) {
        if let Err(e) = self.flush(None) {
            tracing::debug!(error = %e, "final flush dropped pending samples");
        }
        self.window.mark_ended();
    }
}

/// The processing loop shared by the HLS-fMP4 and DASH processors: wait for
/// a keyframe, then read on a short tick, cutting keyframe-aligned segments
/// of at least the target duration with a wall-clock safety net.
pub(crate) async fn run_cmaf_loop(
    mut reader: super::VariantReader,
    mut engine: CmafEngine,
    target_secs: f64,
    cancel: tokio_util::sync::CancellationToken,
) {
    if reader.wait_for_keyframe(&cancel).await.is_err() {
        engine.finish();
        reader.release();
        return;
    }
    let variant_cancel = reader.variant().cancelled();
    let mut ticker = tokio::time::interval(super::TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = variant_cancel.cancelled() => break,
            _ = ticker.tick() => {
                let (video, audio) = reader.read_batch();
                let init_data = reader.variant().audio().init_data();
                for sample in &video {
                    if sample.is_keyframe
                        && engine.has_video()
                        && engine.content_secs() >= target_secs
                    {
                        match engine.flush(Some(sample.dts)) {
                            Err(e) => {
                                tracing::error!(error = %e, "segment flush failed, stopping loop");
                                engine.finish();
                                reader.release();
                                return;
                            }
                            Ok(_) => {}
                        }
                    }
                    engine.push_video(sample);
                }
                for sample in &audio {
                    engine.push_audio(sample, init_data.as_ref());
                }
                if engine.has_content() && engine.wall_secs() >= target_secs * 1.5 {
                    if let Err(e) = engine.flush(None) {
                        tracing::error!(error = %e, "segment flush failed, stopping loop");
                        engine.finish();
                        reader.release();
                        return;
                    }
                }
            }
        }
    }
    engine.finish();
    reader.release();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::adts;

    // 1280x720 High profile SPS as produced by x264.
    const SPS: [u8; 26] = [
        0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9, 0x40, 0x50, 0x05, 0xBB, 0x01, 0x10, 0x00, 0x00,
        0x03, 0x00, 0x10, 0x00, 0x00, 0x03, 0x03, 0x20, 0xF1, 0x83, 0x19, 0x60,
    ];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

    fn engine() -> CmafEngine {
        CmafEngine::new(
            Some("h264"),
            Some("aac"),
            Arc::new(SegmentWindow::new(8)),
            Arc::new(RwLock::new(None)),
            Arc::new(OnceLock::new()),
        )
    }

    fn keyframe_au() -> Bytes {
        let mut au = Vec::new();
        for nal in [&SPS[..], &PPS[..], &[0x65, 0x88, 0x84][..]] {
            au.extend_from_slice(&[0, 0, 0, 1]);
            au.extend_from_slice(nal);
        }
        Bytes::from(au)
    }

    fn plain_au() -> Bytes {
        Bytes::from_static(&[0, 0, 0, 1, 0x41, 0x9A, 0x02])
    }

    fn video_sample(seq: u64, dts: i64, keyframe: bool) -> Sample {
        Sample {
            sequence: seq,
            pts: dts,
            dts,
            data: if keyframe { keyframe_au() } else { plain_au() },
            is_keyframe: keyframe,
            duration: None,
        }
    }

    fn audio_sample(seq: u64, pts: i64) -> Sample {
        Sample {
            sequence: seq,
            pts,
            dts: pts,
            data: Bytes::from_static(&[0x21, 0x10, 0x05]),
            is_keyframe: false,
            duration: None,
        }
    }

    #[test]
    fn test_flush_defers_until_params_then_loses_nothing() {
        let mut engine = engine();
        let asc = Bytes::copy_from_slice(&adts::build_asc(2, 48_000, 2));

        // Plain slices first: no SPS/PPS anywhere yet.
        engine.push_video(&video_sample(1, 0, false));
        engine.push_audio(&audio_sample(1, 0), None);
        assert_eq!(engine.flush(None).unwrap(), FlushOutcome::NotYet);
        assert!(engine.has_content(), "deferred flush retains samples");

        // Parameters arrive; the retained samples flush with the new ones.
        engine.push_video(&video_sample(2, 3600, true));
        engine.push_audio(&audio_sample(2, 1920), Some(&asc));
        assert_eq!(engine.flush(Some(7200)).unwrap(), FlushOutcome::Flushed);
        assert!(!engine.has_content());
        assert_eq!(engine.window.len(), 1);
        let segment = engine.window.get(0).unwrap();
        assert!(segment.data.len() > 8);
    }

    #[test]
    fn test_init_generated_once_and_shared() {
        let init_slot: Arc<RwLock<Option<Arc<InitSegment>>>> = Arc::new(RwLock::new(None));
        let mut engine = CmafEngine::new(
            Some("h264"),
            None,
            Arc::new(SegmentWindow::new(8)),
            init_slot.clone(),
            Arc::new(OnceLock::new()),
        );
        engine.push_video(&video_sample(1, 0, true));
        engine.push_video(&video_sample(2, 3600, false));
        engine.flush(Some(7200)).unwrap();
        let first = init_slot.read().clone().unwrap();

        engine.push_video(&video_sample(3, 7200, true));
        engine.flush(Some(10800)).unwrap();
        let second = init_slot.read().clone().unwrap();
        assert!(Arc::ptr_eq(&first, &second), "init generated exactly once");
        assert!(first.has_video);
        assert!(!first.has_audio);
        assert_eq!(first.width, 1280);
    }

    #[test]
    fn test_empty_flush() {
        let mut engine = engine();
        assert_eq!(engine.flush(None).unwrap(), FlushOutcome::Empty);
    }

    #[test]
    fn test_durations_use_cut_sample_dts() {
        let mut engine = engine();
        let asc = Bytes::copy_from_slice(&adts::build_asc(2, 48_000, 2));
        engine.push_video(&video_sample(1, 0, true));
        engine.push_video(&video_sample(2, 90_000, false));
        engine.push_audio(&audio_sample(1, 0), Some(&asc));
        engine.flush(Some(180_000)).unwrap();
        let segment = engine.window.get(0).unwrap();
        // Two video samples of one second each.
        assert!((segment.duration_seconds - 2.0).abs() < 1e-6);
        assert!(segment.is_keyframe_start);
    }

    #[test]
    fn test_discontinuity_flag_carries_to_next_segment() {
        let mut engine = engine();
        engine.push_video(&video_sample(1, 0, true));
        engine.push_video(&video_sample(2, 3600, false));
        engine.mark_discontinuity();
        engine.flush(Some(7200)).unwrap();
        let segment = engine.window.get(0).unwrap();
        assert!(segment.discontinuity);

        engine.push_video(&video_sample(3, 7200, true));
        engine.flush(Some(10800)).unwrap();
        assert!(!engine.window.get(1).unwrap().discontinuity);
    }

    #[test]
    fn test_availability_start_set_once() {
        let availability = Arc::new(OnceLock::new());
        let mut engine = CmafEngine::new(
            Some("h264"),
            None,
            Arc::new(SegmentWindow::new(8)),
            Arc::new(RwLock::new(None)),
            availability.clone(),
        );
        engine.push_video(&video_sample(1, 0, true));
        engine.flush(Some(3600)).unwrap();
        let first = *availability.get().unwrap();
        engine.push_video(&video_sample(2, 3600, true));
        engine.flush(Some(7200)).unwrap();
        assert_eq!(first, *availability.get().unwrap());
    }
}
