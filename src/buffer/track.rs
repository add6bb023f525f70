//! Elementary stream tracks
//!
//! A track is an append-only, bounded sequence of samples for exactly one
//! elementary stream. Readers poll then wait on the track's notifier;
//! eviction trims from the head and never outruns a registered consumer.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::config::BufferConfig;

/// Which kind of elementary stream a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// The atomic unit stored in a track.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Monotonically increasing per-track sequence, starting at 1
    pub sequence: u64,
    /// Presentation timestamp, 90 kHz
    pub pts: i64,
    /// Decode timestamp, 90 kHz
    pub dts: i64,
    /// Annex-B access unit for video, raw access unit for audio
    pub data: Bytes,
    /// Set for IDR/IRAP access units; always false for audio
    pub is_keyframe: bool,
    /// Track-local duration in 90 kHz ticks when known
    pub duration: Option<u32>,
}

struct TrackState {
    codec: Option<String>,
    init_data: Option<Bytes>,
    samples: VecDeque<Sample>,
    /// Sequence the next appended sample receives
    next_seq: u64,
    /// Total payload bytes currently retained
    bytes: usize,
    /// Newest keyframe sequence still retained (video only)
    last_keyframe_seq: Option<u64>,
    /// Registered consumer id to last-read sequence
    consumers: HashMap<String, u64>,
    /// Samples dropped by eviction since track creation
    evicted: u64,
}

/// One elementary stream inside a variant.
pub struct Track {
    kind: TrackKind,
    max_samples: usize,
    max_bytes: usize,
    state: RwLock<TrackState>,
    notify: Notify,
}

impl Track {
    pub fn new(kind: TrackKind, config: &BufferConfig) -> Self {
        Self {
            kind,
            max_samples: config.max_samples,
            max_bytes: config.max_bytes,
            state: RwLock::new(TrackState {
                codec: None,
                init_data: None,
                samples: VecDeque::new(),
                next_seq: 1,
                bytes: 0,
                last_keyframe_seq: None,
                consumers: HashMap::new(),
                evicted: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn codec(&self) -> Option<String> {
        self.state.read().codec.clone()
    }

    pub fn set_codec(&self, codec: &str) {
        self.state.write().codec = Some(codec.to_ascii_lowercase());
    }

    pub fn init_data(&self) -> Option<Bytes> {
        self.state.read().init_data.clone()
    }

    pub fn set_init_data(&self, data: Bytes) {
        self.state.write().init_data = Some(data);
    }

    /// Number of samples currently retained.
    pub fn count(&self) -> usize {
        self.state.read().samples.len()
    }

    /// Sequence of the most recently appended sample, 0 if none yet.
    pub fn latest_sequence(&self) -> u64 {
        self.state.read().next_seq - 1
    }

    /// Future resolved on the next append batch. Obtain it *before* the
    /// empty-read check to avoid missed wake-ups.
    pub fn changed(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Append one sample and wake waiters.
    pub fn push(&self, pts: i64, dts: i64, data: Bytes, is_keyframe: bool, duration: Option<u32>) -> u64 {
        let seq = self.push_quiet(pts, dts, data, is_keyframe, duration);
        self.notify.notify_waiters();
        seq
    }

    /// Append a batch and wake waiters once for the whole batch.
    pub fn push_batch(&self, batch: Vec<(i64, i64, Bytes, bool, Option<u32>)>) -> u64 {
        let mut last = 0;
        for (pts, dts, data, kf, dur) in batch {
            last = self.push_quiet(pts, dts, data, kf, dur);
        }
        self.notify.notify_waiters();
        last
    }

    fn push_quiet(&self, pts: i64, dts: i64, data: Bytes, is_keyframe: bool, duration: Option<u32>) -> u64 {
        let mut state = self.state.write();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.bytes += data.len();
        if is_keyframe {
            state.last_keyframe_seq = Some(seq);
        }
        state.samples.push_back(Sample {
            sequence: seq,
            pts,
            dts,
            data,
            is_keyframe,
            duration,
        });
        self.evict_locked(&mut state);
        seq
    }

    /// Trim from the head while over the sample or byte bound, without
    /// passing the slowest registered consumer or the newest keyframe.
    fn evict_locked(&self, state: &mut TrackState) {
        let slowest = state.consumers.values().copied().min().unwrap_or(u64::MAX);
        while state.samples.len() > self.max_samples || state.bytes > self.max_bytes {
            let Some(head) = state.samples.front() else {
                break;
            };
            if head.sequence > slowest {
                break;
            }
            if self.kind == TrackKind::Video && state.last_keyframe_seq == Some(head.sequence) {
                break;
            }
            let head = state.samples.pop_front().expect("front checked above");
            state.bytes -= head.data.len();
            state.evicted += 1;
        }
    }

    /// Samples with `sequence > seq`, oldest first, at most `max`.
    /// A read past the retained window returns an empty batch.
    pub fn read_from(&self, seq: u64, max: usize) -> Vec<Sample> {
        let state = self.state.read();
        let start = match state.samples.front() {
            Some(front) if seq + 1 >= front.sequence => (seq + 1 - front.sequence) as usize,
            Some(_) => 0,
            None => return Vec::new(),
        };
        state.samples.iter().skip(start).take(max).cloned().collect()
    }

    /// Like [`read_from`], but skips forward to the first keyframe with
    /// `sequence > seq`. Video only; an audio track returns `read_from`.
    pub fn read_from_keyframe(&self, seq: u64, max: usize) -> Vec<Sample> {
        if self.kind != TrackKind::Video {
            return self.read_from(seq, max);
        }
        let state = self.state.read();
        let mut out = Vec::new();
        let mut started = false;
        for sample in state.samples.iter() {
            if sample.sequence <= seq {
                continue;
            }
            if !started {
                if !sample.is_keyframe {
                    continue;
                }
                started = true;
            }
            out.push(sample.clone());
            if out.len() >= max {
                break;
            }
        }
        out
    }

    pub fn register_consumer(&self, id: &str) {
        let mut state = self.state.write();
        state.consumers.entry(id.to_string()).or_insert(0);
    }

    pub fn unregister_consumer(&self, id: &str) {
        self.state.write().consumers.remove(id);
    }

    /// Record that consumer `id` has read up to and including `seq`.
    pub fn update_consumer(&self, id: &str, seq: u64) {
        let mut state = self.state.write();
        if let Some(pos) = state.consumers.get_mut(id) {
            if seq > *pos {
                *pos = seq;
            }
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.state.read().consumers.len()
    }

    /// Sequence range currently retained, `None` when empty.
    pub fn retained_range(&self) -> Option<(u64, u64)> {
        let state = self.state.read();
        match (state.samples.front(), state.samples.back()) {
            (Some(f), Some(b)) => Some((f.sequence, b.sequence)),
            _ => None,
        }
    }

    pub fn evicted_count(&self) -> u64 {
        self.state.read().evicted
    }
}
