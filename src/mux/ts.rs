//! MPEG-TS muxer
//!
//! A persistent packetizer: continuity counters survive segment boundaries,
//! the byte sink is swapped per segment, and PAT/PMT are re-emitted on
//! demand. Video PES packets carry PCR on keyframes and set the
//! random-access indicator so downstream keyframe gating works without
//! reparsing the elementary stream.

use bytes::Bytes;

use crate::demux::adts::{self, AdtsHeader};
use crate::demux::psi::crc32_mpeg;
use crate::demux::TS_PACKET_SIZE;
use crate::error::{RelayError, Result};

const PMT_PID: u16 = 0x1000;
const VIDEO_PID: u16 = 0x0100;
const AUDIO_PID: u16 = 0x0101;
const PROGRAM_NUMBER: u16 = 1;

fn stream_type_for(codec: &str) -> Option<u8> {
    match codec {
        "h264" => Some(0x1B),
        "h265" => Some(0x24),
        "aac" => Some(0x0F),
        "mp3" => Some(0x03),
        "ac3" => Some(0x81),
        "eac3" => Some(0x87),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Continuity {
    pat: u8,
    pmt: u8,
    video: u8,
    audio: u8,
}

/// Persistent MPEG-TS muxer writing into a swappable byte sink.
pub struct TsMuxer {
    video_codec: Option<String>,
    audio_codec: Option<String>,
    /// AAC AudioSpecificConfig used to rebuild ADTS headers
    audio_asc: Option<(u8, u32, u8)>,
    continuity: Continuity,
    out: Vec<u8>,
    packets: u64,
}

impl TsMuxer {
    pub fn new() -> Self {
        Self {
            video_codec: None,
            audio_codec: None,
            audio_asc: None,
            continuity: Continuity::default(),
            out: Vec::new(),
            packets: 0,
        }
    }

    /// Declare the elementary streams. Must be called before muxing; the
    /// audio init data is the AAC AudioSpecificConfig when applicable.
    pub fn set_streams(
        &mut self,
        video_codec: Option<&str>,
        audio_codec: Option<&str>,
        audio_init: Option<&Bytes>,
    ) -> Result<()> {
        if let Some(codec) = video_codec {
            if stream_type_for(codec).is_none() {
                return Err(RelayError::Mux(format!("codec {} not carriable in TS", codec)));
            }
            self.video_codec = Some(codec.to_string());
        }
        if let Some(codec) = audio_codec {
            if stream_type_for(codec).is_none() {
                return Err(RelayError::Mux(format!("codec {} not carriable in TS", codec)));
            }
            self.audio_codec = Some(codec.to_string());
            if codec == "aac" {
                // Missing init data degrades to 48 kHz stereo AAC-LC.
                self.audio_asc = audio_init
                    .and_then(|b| adts::parse_asc(b))
                    .or(Some((2, 48_000, 2)));
            }
        }
        Ok(())
    }

    pub fn has_streams(&self) -> bool {
        self.video_codec.is_some() || self.audio_codec.is_some()
    }

    /// Swap out everything muxed since the last take.
    pub fn take_output(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.out))
    }

    pub fn pending_len(&self) -> usize {
        self.out.len()
    }

    pub fn packets_muxed(&self) -> u64 {
        self.packets
    }

    /// Emit PAT and PMT. Called at init, at each segment start and
    /// periodically on the continuous path.
    pub fn write_psi(&mut self) {
        let pat = self.build_pat();
        let pmt = self.build_pmt();
        self.out.extend_from_slice(&pat);
        self.out.extend_from_slice(&pmt);
        self.packets += 2;
    }

    /// Mux one video access unit (Annex-B). Keyframes carry PCR and the
    /// random-access indicator in the leading adaptation field.
    pub fn mux_video(&mut self, pts: i64, dts: i64, au: &[u8], keyframe: bool) -> Result<()> {
        if self.video_codec.is_none() {
            return Err(RelayError::Mux("no video stream declared".into()));
        }
        let pes = build_pes(0xE0, Some(pts), Some(dts).filter(|d| *d != pts), au, true);
        let pcr = if keyframe { Some(dts as u64) } else { None };
        self.packetize(VIDEO_PID, &pes, keyframe, pcr, true);
        Ok(())
    }

    /// Mux one audio access unit (raw form; ADTS is rebuilt for AAC).
    pub fn mux_audio(&mut self, pts: i64, au: &[u8]) -> Result<()> {
        let Some(codec) = self.audio_codec.clone() else {
            return Err(RelayError::Mux("no audio stream declared".into()));
        };
        let framed;
        let payload: &[u8] = if codec == "aac" {
            let (object_type, sample_rate, channels) = self.audio_asc.unwrap_or((2, 48_000, 2));
            let header = AdtsHeader::build(object_type, sample_rate, channels, au.len());
            let mut buf = Vec::with_capacity(7 + au.len());
            buf.extend_from_slice(&header);
            buf.extend_from_slice(au);
            framed = buf;
            &framed
        } else {
            au
        };
        let pes = build_pes(0xC0, Some(pts), None, payload, false);
        self.packetize(AUDIO_PID, &pes, false, None, false);
        Ok(())
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let slot = match pid {
            0 => &mut self.continuity.pat,
            PMT_PID => &mut self.continuity.pmt,
            VIDEO_PID => &mut self.continuity.video,
            _ => &mut self.continuity.audio,
        };
        let cc = *slot;
        *slot = (*slot + 1) & 0x0F;
        cc
    }

    /// Fragment a PES packet into TS packets with adaptation-field stuffing.
    fn packetize(&mut self, pid: u16, pes: &[u8], rai: bool, pcr: Option<u64>, _video: bool) {
        let mut offset = 0;
        let mut first = true;
        while offset < pes.len() {
            let remaining = pes.len() - offset;

            // Flags and PCR only ride the first packet of the PES.
            let mut head_af: Vec<u8> = Vec::new();
            if first && (rai || pcr.is_some()) {
                let mut flags = 0u8;
                if rai {
                    flags |= 0x40;
                }
                if pcr.is_some() {
                    flags |= 0x10;
                }
                head_af.push(flags);
                if let Some(base) = pcr {
                    let base = base & 0x1_FFFF_FFFF;
                    head_af.push((base >> 25) as u8);
                    head_af.push((base >> 17) as u8);
                    head_af.push((base >> 9) as u8);
                    head_af.push((base >> 1) as u8);
                    head_af.push((((base & 1) as u8) << 7) | 0x7E);
                    head_af.push(0x00);
                }
            }
            let af_cost = if head_af.is_empty() { 0 } else { 1 + head_af.len() };
            let chunk = remaining.min(184 - af_cost);
            let af_total = 184 - chunk;

            let mut packet = Vec::with_capacity(TS_PACKET_SIZE);
            packet.push(0x47);
            let pusi = if first { 0x40 } else { 0x00 };
            packet.push(pusi | ((pid >> 8) as u8 & 0x1F));
            packet.push(pid as u8);
            let cc = self.next_cc(pid);
            let afc = if af_total > 0 { 0x30 } else { 0x10 };
            packet.push(afc | cc);
            if af_total > 0 {
                let af_len = af_total - 1;
                packet.push(af_len as u8);
                if af_len > 0 {
                    let mut body = head_af.clone();
                    if body.is_empty() {
                        body.push(0x00);
                    }
                    body.resize(af_len, 0xFF);
                    packet.extend_from_slice(&body);
                }
            }
            packet.extend_from_slice(&pes[offset..offset + chunk]);
            debug_assert_eq!(packet.len(), TS_PACKET_SIZE);
            self.out.extend_from_slice(&packet);
            self.packets += 1;
            offset += chunk;
            first = false;
        }
    }

    fn psi_packet(&mut self, pid: u16, section: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(TS_PACKET_SIZE);
        packet.push(0x47);
        packet.push(0x40 | ((pid >> 8) as u8 & 0x1F));
        packet.push(pid as u8);
        let cc = self.next_cc(pid);
        packet.push(0x10 | cc);
        packet.push(0x00); // pointer field
        packet.extend_from_slice(section);
        packet.resize(TS_PACKET_SIZE, 0xFF);
        packet
    }

    fn build_section(table_id: u8, fixed: &[u8; 5], body: &[u8]) -> Vec<u8> {
        let section_length = 5 + body.len() + 4;
        let mut section = vec![
            table_id,
            0xB0 | ((section_length >> 8) as u8 & 0x0F),
            (section_length & 0xFF) as u8,
        ];
        section.extend_from_slice(fixed);
        section.extend_from_slice(body);
        let crc = crc32_mpeg(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    fn build_pat(&mut self) -> Vec<u8> {
        let body = [
            (PROGRAM_NUMBER >> 8) as u8,
            PROGRAM_NUMBER as u8,
            0xE0 | ((PMT_PID >> 8) as u8 & 0x1F),
            PMT_PID as u8,
        ];
        let section = Self::build_section(0x00, &[0x00, 0x01, 0xC1, 0x00, 0x00], &body);
        self.psi_packet(0, &section)
    }

    fn build_pmt(&mut self) -> Vec<u8> {
        let pcr_pid = if self.video_codec.is_some() { VIDEO_PID } else { AUDIO_PID };
        let mut body = vec![
            0xE0 | ((pcr_pid >> 8) as u8 & 0x1F),
            pcr_pid as u8,
            0xF0,
            0x00, // no program descriptors
        ];
        if let Some(codec) = &self.video_codec {
            let ty = stream_type_for(codec).expect("validated in set_streams");
            body.extend_from_slice(&[
                ty,
                0xE0 | ((VIDEO_PID >> 8) as u8 & 0x1F),
                VIDEO_PID as u8,
                0xF0,
                0x00,
            ]);
        }
        if let Some(codec) = &self.audio_codec {
            let ty = stream_type_for(codec).expect("validated in set_streams");
            body.extend_from_slice(&[
                ty,
                0xE0 | ((AUDIO_PID >> 8) as u8 & 0x1F),
                AUDIO_PID as u8,
                0xF0,
                0x00,
            ]);
        }
        let section = Self::build_section(
            0x02,
            &[
                (PROGRAM_NUMBER >> 8) as u8,
                PROGRAM_NUMBER as u8,
                0xC1,
                0x00,
                0x00,
            ],
            &body,
        );
        self.psi_packet(PMT_PID, &section)
    }
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a PES packet. Video uses an unbounded length field (0) as the spec
/// allows; audio carries the exact length.
fn build_pes(stream_id: u8, pts: Option<i64>, dts: Option<i64>, payload: &[u8], unbounded: bool) -> Vec<u8> {
    use crate::demux::pes::write_timestamp;

    let mut header_data = Vec::new();
    let flags = match (pts, dts) {
        (Some(p), Some(d)) => {
            write_timestamp(&mut header_data, 0x03, p);
            write_timestamp(&mut header_data, 0x01, d);
            0xC0
        }
        (Some(p), None) => {
            write_timestamp(&mut header_data, 0x02, p);
            0x80
        }
        _ => 0x00,
    };

    let mut pes = vec![0, 0, 1, stream_id];
    let body_len = 3 + header_data.len() + payload.len();
    if unbounded || body_len > u16::MAX as usize {
        pes.extend_from_slice(&[0, 0]);
    } else {
        pes.extend_from_slice(&(body_len as u16).to_be_bytes());
    }
    pes.push(0x80); // marker + no scrambling
    pes.push(flags);
    pes.push(header_data.len() as u8);
    pes.extend_from_slice(&header_data);
    pes.extend_from_slice(payload);
    pes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn muxer_with_av() -> TsMuxer {
        let mut muxer = TsMuxer::new();
        muxer
            .set_streams(Some("h264"), Some("aac"), None)
            .unwrap();
        muxer
    }

    #[test]
    fn test_all_packets_are_188_bytes() {
        let mut muxer = muxer_with_av();
        muxer.write_psi();
        muxer.mux_video(90_000, 90_000, &vec![0xAB; 500], true).unwrap();
        muxer.mux_audio(90_000, &vec![0xCD; 300]).unwrap();
        let out = muxer.take_output();
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        for packet in out.chunks(TS_PACKET_SIZE) {
            assert_eq!(packet[0], 0x47);
        }
    }

    #[test]
    fn test_continuity_survives_take_output() {
        let mut muxer = muxer_with_av();
        muxer.mux_audio(0, &[0u8; 10]).unwrap();
        let first = muxer.take_output();
        muxer.mux_audio(1920, &[0u8; 10]).unwrap();
        let second = muxer.take_output();
        let cc = |bytes: &Bytes| bytes[3] & 0x0F;
        assert_eq!(cc(&first), 0);
        assert_eq!(cc(&second), 1);
    }

    #[test]
    fn test_psi_sections_have_valid_crc() {
        let mut muxer = muxer_with_av();
        muxer.write_psi();
        let out = muxer.take_output();
        let packets: Vec<&[u8]> = out.chunks(TS_PACKET_SIZE).collect();
        assert_eq!(packets.len(), 2);
        let pat = crate::demux::psi::parse_pat(&packets[0][4..]).unwrap();
        assert_eq!(pat.pmt_pid, PMT_PID);
        let pmt = crate::demux::psi::parse_pmt(&packets[1][4..]).unwrap();
        assert_eq!(pmt.pcr_pid, VIDEO_PID);
        assert_eq!(pmt.streams.len(), 2);
        assert_eq!(pmt.streams[0].stream_type, 0x1B);
        assert_eq!(pmt.streams[1].stream_type, 0x0F);
    }

    #[test]
    fn test_keyframe_sets_random_access_indicator() {
        let mut muxer = muxer_with_av();
        muxer.mux_video(0, 0, &vec![0u8; 100], true).unwrap();
        let out = muxer.take_output();
        let first = &out[..TS_PACKET_SIZE];
        assert_eq!(first[3] & 0x20, 0x20, "adaptation field present");
        assert_eq!(first[5] & 0x40, 0x40, "random access indicator set");
        assert_eq!(first[5] & 0x10, 0x10, "PCR flag set");

        let mut muxer = muxer_with_av();
        muxer.mux_video(0, 0, &vec![0u8; 100], false).unwrap();
        let out = muxer.take_output();
        let first = &out[..TS_PACKET_SIZE];
        if first[3] & 0x20 != 0 {
            assert_eq!(first[5] & 0x40, 0, "no RAI on non-keyframe");
        }
    }

    #[test]
    fn test_aac_gets_adts_header() {
        let mut muxer = TsMuxer::new();
        let asc = Bytes::copy_from_slice(&crate::demux::adts::build_asc(2, 44_100, 2));
        muxer.set_streams(None, Some("aac"), Some(&asc)).unwrap();
        muxer.mux_audio(0, &[0xAA; 50]).unwrap();
        let out = muxer.take_output();
        // Step over the stuffing adaptation field and the PES header to
        // reach the ADTS frame.
        assert_eq!(out[3] & 0x20, 0x20, "stuffing adaptation field expected");
        let af_len = out[4] as usize;
        let pes_start = 5 + af_len;
        assert_eq!(&out[pes_start..pes_start + 3], &[0, 0, 1]);
        let header_data_len = out[pes_start + 8] as usize;
        let adts_start = pes_start + 9 + header_data_len;
        let header = AdtsHeader::parse(&out[adts_start..]).unwrap();
        assert_eq!(header.sample_rate, 44_100);
        assert_eq!(header.frame_length, 57);
    }

    #[test]
    fn test_rejects_ts_incompatible_codec() {
        let mut muxer = TsMuxer::new();
        assert!(muxer.set_streams(Some("vp9"), None, None).is_err());
        assert!(muxer.set_streams(None, Some("opus"), None).is_err());
    }
}
