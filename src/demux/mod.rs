//! MPEG-TS demultiplexer
//!
//! Byte stream in, elementary samples out. The demuxer owns the PAT/PMT
//! state machine, per-PID PES assembly and the codec-specific access unit
//! emit paths. Parse failures on individual packets are counted and logged;
//! the stream continues.

pub mod adts;
pub mod annexb;
pub mod pes;
pub mod psi;

use bytes::Bytes;
use std::sync::Arc;

use crate::buffer::{CodecVariant, SharedEsBuffer, VariantKey};
use crate::error::Result;

use annexb::VideoCodec;

pub const TS_PACKET_SIZE: usize = 188;

/// 90 kHz frame durations used to synthesize PTS when one PES carries
/// several access units under a single timestamp.
fn frame_duration(codec: &str, sample_rate: u32) -> i64 {
    match codec {
        "aac" => 1024 * 90_000 / sample_rate as i64,
        "mp3" => 2160,
        "opus" => 1800,
        "ac3" | "eac3" => 1536 * 90_000 / sample_rate as i64,
        _ => 1920,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DemuxStats {
    pub packets: u64,
    pub parse_errors: u64,
    pub video_samples: u64,
    pub audio_samples: u64,
}

struct EsPipe {
    pid: u16,
    codec: String,
    /// Whether samples are emitted; a probe-overridden unknown codec is
    /// declared on the track but its samples are not demuxable.
    emit: bool,
    pes_buf: Vec<u8>,
    collecting: bool,
    last_pts: Option<i64>,
    sample_rate: u32,
    init_published: bool,
}

impl EsPipe {
    fn new(pid: u16, codec: &str, emit: bool) -> Self {
        Self {
            pid,
            codec: codec.to_string(),
            emit,
            pes_buf: Vec::new(),
            collecting: false,
            last_pts: None,
            sample_rate: 48_000,
            init_published: false,
        }
    }

    /// First access unit of a batch takes the container PTS when it moves
    /// forward; later ones advance by the codec frame duration.
    fn next_pts(&mut self, container_pts: Option<i64>, first_of_batch: bool) -> i64 {
        let dur = frame_duration(&self.codec, self.sample_rate);
        let pts = match (container_pts, self.last_pts) {
            (Some(p), Some(last)) if first_of_batch && p > last => p,
            (Some(p), None) => p,
            (_, Some(last)) => last + dur,
            (None, None) => 0,
        };
        self.last_pts = Some(pts);
        pts
    }
}

/// Streaming MPEG-TS to elementary-sample demultiplexer. The default
/// target is the source variant; transcoder workers pipe their TS output
/// through a dedicated demuxer targeting the derived variant instead.
pub struct TsDemuxer {
    buffer: Arc<SharedEsBuffer>,
    target: VariantKey,
    probe_override_audio_codec: Option<String>,
    partial: Vec<u8>,
    pmt_pid: Option<u16>,
    video: Option<EsPipe>,
    audio: Option<EsPipe>,
    initialized: bool,
    stats: DemuxStats,
}

impl TsDemuxer {
    pub fn new(buffer: Arc<SharedEsBuffer>, probe_override_audio_codec: Option<String>) -> Self {
        Self::with_target(buffer, VariantKey::Copy, probe_override_audio_codec)
    }

    /// Demux into a specific variant instead of the source.
    pub fn with_target(
        buffer: Arc<SharedEsBuffer>,
        target: VariantKey,
        probe_override_audio_codec: Option<String>,
    ) -> Self {
        Self {
            buffer,
            target,
            probe_override_audio_codec,
            partial: Vec::new(),
            pmt_pid: None,
            video: None,
            audio: None,
            initialized: false,
            stats: DemuxStats::default(),
        }
    }

    /// True once PAT and PMT have been parsed and codecs published.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats
    }

    /// Streaming write. Never blocks on demux progress; partial packets are
    /// carried over to the next call.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.partial.extend_from_slice(bytes);
        let mut offset = 0;
        while self.partial.len() - offset >= TS_PACKET_SIZE {
            if self.partial[offset] != 0x47 {
                // Lost sync: skip to the next sync byte.
                self.stats.parse_errors += 1;
                match self.partial[offset + 1..].iter().position(|&b| b == 0x47) {
                    Some(skip) => {
                        offset += skip + 1;
                        continue;
                    }
                    None => {
                        offset = self.partial.len();
                        break;
                    }
                }
            }
            let packet: Vec<u8> = self.partial[offset..offset + TS_PACKET_SIZE].to_vec();
            offset += TS_PACKET_SIZE;
            self.handle_packet(&packet);
        }
        self.partial.drain(..offset);
        Ok(())
    }

    /// Flush pending PES buffers at end of input.
    pub fn finish(&mut self) {
        for kind in [true, false] {
            let pending = {
                let pipe = if kind { self.video.as_mut() } else { self.audio.as_mut() };
                match pipe {
                    Some(p) if p.collecting && !p.pes_buf.is_empty() => {
                        p.collecting = false;
                        Some(std::mem::take(&mut p.pes_buf))
                    }
                    _ => None,
                }
            };
            if let Some(buf) = pending {
                self.process_pes(kind, buf);
            }
        }
        tracing::debug!(
            packets = self.stats.packets,
            parse_errors = self.stats.parse_errors,
            video_samples = self.stats.video_samples,
            audio_samples = self.stats.audio_samples,
            "demuxer drained"
        );
    }

    fn handle_packet(&mut self, packet: &[u8]) {
        self.stats.packets += 1;
        let pid = u16::from_be_bytes([packet[1] & 0x1F, packet[2]]);
        let pusi = packet[1] & 0x40 != 0;
        let afc = (packet[3] >> 4) & 0x03;
        let mut payload_start = 4;
        if afc & 0x02 != 0 {
            let af_len = packet[4] as usize;
            payload_start += 1 + af_len;
        }
        if afc & 0x01 == 0 || payload_start >= packet.len() {
            return;
        }
        let payload = &packet[payload_start..];

        if pid == 0 {
            if pusi {
                match psi::parse_pat(payload) {
                    Ok(pat) => self.pmt_pid = Some(pat.pmt_pid),
                    Err(e) => {
                        self.stats.parse_errors += 1;
                        tracing::debug!(error = %e, "PAT parse failed");
                    }
                }
            }
            return;
        }
        if Some(pid) == self.pmt_pid {
            if pusi && self.video.is_none() && self.audio.is_none() {
                match psi::parse_pmt(payload) {
                    Ok(pmt) => self.on_pmt(&pmt),
                    Err(e) => {
                        self.stats.parse_errors += 1;
                        tracing::debug!(error = %e, "PMT parse failed");
                    }
                }
            }
            return;
        }

        let is_video = self.video.as_ref().map(|p| p.pid) == Some(pid);
        let is_audio = self.audio.as_ref().map(|p| p.pid) == Some(pid);
        if !is_video && !is_audio {
            return;
        }
        let completed = {
            let pipe = if is_video {
                self.video.as_mut().unwrap()
            } else {
                self.audio.as_mut().unwrap()
            };
            let mut completed = None;
            if pusi {
                if pipe.collecting && !pipe.pes_buf.is_empty() {
                    completed = Some(std::mem::take(&mut pipe.pes_buf));
                }
                pipe.collecting = true;
            }
            if pipe.collecting {
                pipe.pes_buf.extend_from_slice(payload);
            }
            completed
        };
        if let Some(buf) = completed {
            self.process_pes(is_video, buf);
        }
    }

    fn on_pmt(&mut self, pmt: &psi::Pmt) {
        let mut video_codec = None;
        let mut audio_codec = None;
        for stream in &pmt.streams {
            match psi::codec_for_stream(stream) {
                Some(codec) if psi::is_video_codec(codec) => {
                    if self.video.is_none() {
                        self.video = Some(EsPipe::new(stream.pid, codec, true));
                        video_codec = Some(codec.to_string());
                    }
                }
                Some(codec) => {
                    if self.audio.is_none() {
                        self.audio = Some(EsPipe::new(stream.pid, codec, true));
                        audio_codec = Some(codec.to_string());
                    }
                }
                None => {
                    // Unknown audio codec with external probe data: declare
                    // the track but do not emit samples.
                    if self.audio.is_none() {
                        if let Some(name) = self.probe_override_audio_codec.clone() {
                            self.audio = Some(EsPipe::new(stream.pid, &name, false));
                            audio_codec = Some(name);
                        }
                    }
                }
            }
        }
        tracing::info!(
            video = video_codec.as_deref().unwrap_or("none"),
            audio = audio_codec.as_deref().unwrap_or("none"),
            "stream initialized from PMT"
        );
        if self.target == VariantKey::Copy {
            self.buffer
                .publish_source_codecs(video_codec.as_deref(), audio_codec.as_deref());
        }
        self.initialized = true;
    }

    fn process_pes(&mut self, is_video: bool, mut buf: Vec<u8>) {
        let header = match pes::parse_pes(&buf) {
            Ok(h) => h,
            Err(e) => {
                self.stats.parse_errors += 1;
                tracing::debug!(error = %e, "PES parse failed");
                return;
            }
        };
        // Honour an explicit PES_packet_length so stuffing never leaks into
        // the access unit.
        let pes_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if pes_len > 0 && 6 + pes_len < buf.len() {
            buf.truncate(6 + pes_len);
        }
        if buf.len() <= header.payload_offset {
            return;
        }
        let payload = buf.split_off(header.payload_offset);
        if is_video {
            self.handle_video(&header, payload);
        } else {
            self.handle_audio(&header, payload);
        }
    }

    fn handle_video(&mut self, header: &pes::PesHeader, payload: Vec<u8>) {
        let pipe = self.video.as_mut().expect("video pipe");
        let codec = match pipe.codec.as_str() {
            "h264" => VideoCodec::H264,
            "h265" => VideoCodec::H265,
            _ => return,
        };
        let keyframe = annexb::is_keyframe(codec, &payload);
        let au = annexb::reorder_access_unit(codec, &payload);
        if au.is_empty() {
            self.stats.parse_errors += 1;
            return;
        }
        let pts = match (header.pts, pipe.last_pts) {
            (Some(p), _) => p,
            (None, Some(last)) => last,
            (None, None) => 0,
        };
        pipe.last_pts = Some(pts);
        let dts = header.dts.unwrap_or(pts);

        if keyframe && !pipe.init_published {
            let params = annexb::extract_param_sets(codec, &au);
            if params.is_complete(codec) {
                let mut blob = Vec::new();
                for nal in [&params.vps, &params.sps, &params.pps].into_iter().flatten() {
                    blob.extend_from_slice(&[0, 0, 0, 1]);
                    blob.extend_from_slice(nal);
                }
                if let Some(variant) = target_variant(&self.buffer, &self.target) {
                    variant.video().set_init_data(Bytes::from(blob));
                    pipe.init_published = true;
                }
            }
        }

        let target = self.target.clone();
        self.buffer.write_video_to_variant(&target, pts, dts, au, keyframe);
        self.stats.video_samples += 1;
    }

    fn handle_audio(&mut self, header: &pes::PesHeader, payload: Vec<u8>) {
        let pipe = self.audio.as_mut().expect("audio pipe");
        if !pipe.emit {
            return;
        }
        match pipe.codec.as_str() {
            "aac" => {
                let frames = adts::split_frames(&payload);
                if frames.is_empty() {
                    self.stats.parse_errors += 1;
                    return;
                }
                if !pipe.init_published {
                    let (adts_header, raw) = frames[0];
                    pipe.sample_rate = adts_header.sample_rate;
                    let channels = if adts_header.channel_config == 0 {
                        // A zero channel config defers to the PCE in the
                        // first raw frame; stereo when unresolvable.
                        adts::channels_from_pce(raw).unwrap_or(2)
                    } else {
                        adts_header.channel_config
                    };
                    let asc = adts::build_asc(adts_header.object_type, adts_header.sample_rate, channels);
                    if let Some(variant) = target_variant(&self.buffer, &self.target) {
                        variant.audio().set_init_data(Bytes::copy_from_slice(&asc));
                        pipe.init_published = true;
                    }
                }
                let target = self.target.clone();
                for (i, (_, raw)) in frames.iter().enumerate() {
                    let pts = pipe.next_pts(header.pts, i == 0);
                    self.buffer
                        .write_audio_to_variant(&target, pts, Bytes::copy_from_slice(raw));
                    self.stats.audio_samples += 1;
                }
            }
            "opus" => {
                let target = self.target.clone();
                let frames = split_opus_units(&payload);
                for (i, frame) in frames.iter().enumerate() {
                    let pts = pipe.next_pts(header.pts, i == 0);
                    self.buffer
                        .write_audio_to_variant(&target, pts, Bytes::copy_from_slice(frame));
                    self.stats.audio_samples += 1;
                }
            }
            _ => {
                // MP3, AC-3 and E-AC-3 arrive one access unit per PES here.
                let target = self.target.clone();
                let pts = pipe.next_pts(header.pts, true);
                self.buffer
                    .write_audio_to_variant(&target, pts, Bytes::from(payload));
                self.stats.audio_samples += 1;
            }
        }
    }
}

/// Resolve the demuxer's write target to a live variant.
fn target_variant(buffer: &SharedEsBuffer, target: &VariantKey) -> Option<Arc<CodecVariant>> {
    match target {
        VariantKey::Copy => Some(buffer.source()),
        key => key.canonical().and_then(|k| buffer.variant(&k)),
    }
}

/// Split DVB-TS Opus control-header framing into raw Opus packets.
/// Falls back to the whole payload when the framing is absent.
fn split_opus_units(data: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut rest = data;
    while rest.len() >= 2 && rest[0] == 0x7F && rest[1] & 0xE0 == 0xE0 {
        let start_trim = rest[1] & 0x10 != 0;
        let end_trim = rest[1] & 0x08 != 0;
        let control_ext = rest[1] & 0x04 != 0;
        let mut i = 2;
        let mut size = 0usize;
        loop {
            let Some(&b) = rest.get(i) else { return fallback(data, out) };
            size += b as usize;
            i += 1;
            if b != 0xFF {
                break;
            }
        }
        if start_trim {
            i += 2;
        }
        if end_trim {
            i += 2;
        }
        if control_ext {
            let Some(&len) = rest.get(i) else { return fallback(data, out) };
            i += 1 + len as usize;
        }
        let Some(payload) = rest.get(i..i + size) else {
            return fallback(data, out);
        };
        out.push(payload);
        rest = &rest[i + size..];
    }
    fallback(data, out)
}

fn fallback<'a>(data: &'a [u8], out: Vec<&'a [u8]>) -> Vec<&'a [u8]> {
    if out.is_empty() && !data.is_empty() {
        vec![data]
    } else {
        out
    }
}
