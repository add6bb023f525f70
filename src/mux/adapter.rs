//! Sample adaptation for the fMP4 writer
//!
//! Converts Annex-B video access units and raw audio frames into the form
//! the writer expects, and harvests codec parameters (SPS/PPS/VPS, AAC
//! AudioSpecificConfig) from the stream until an init segment can be built.

use bytes::{BufMut, Bytes, BytesMut};

use crate::buffer::Sample;
use crate::demux::adts;
use crate::demux::annexb::{self, VideoCodec};

/// Reader over RBSP bits with emulation prevention bytes removed.
struct BitReader {
    data: Vec<u8>,
    pos: usize,
}

impl BitReader {
    fn new(nal: &[u8]) -> Self {
        let mut data = Vec::with_capacity(nal.len());
        let mut zeros = 0;
        for &b in nal {
            if zeros >= 2 && b == 3 {
                zeros = 0;
                continue;
            }
            zeros = if b == 0 { zeros + 1 } else { 0 };
            data.push(b);
        }
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    fn bits(&mut self, n: usize) -> Option<u32> {
        let mut v = 0;
        for _ in 0..n {
            v = (v << 1) | self.bit()?;
        }
        Some(v)
    }

    fn ue(&mut self) -> Option<u32> {
        let mut zeros = 0;
        while self.bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        let rest = if zeros == 0 { 0 } else { self.bits(zeros)? };
        Some((1 << zeros) - 1 + rest)
    }

    fn se(&mut self) -> Option<i32> {
        let k = self.ue()? as i64;
        Some(if k % 2 == 0 { -(k as i32) / 2 } else { ((k + 1) / 2) as i32 })
    }
}

/// Video codec parameters harvested from the bitstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoParams {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
    pub vps: Option<Bytes>,
    /// profile_idc, constraint flags, level_idc (H.264)
    pub profile: u8,
    pub constraint: u8,
    pub level: u8,
}

impl VideoParams {
    pub fn is_complete(&self) -> bool {
        match self.codec.as_str() {
            "h264" => self.sps.is_some() && self.pps.is_some(),
            "h265" => self.vps.is_some() && self.sps.is_some() && self.pps.is_some(),
            // VP9/AV1 keyframes are self-describing.
            "vp9" | "av1" => true,
            _ => false,
        }
    }

    /// RFC 6381 codec string for manifests.
    pub fn codec_string(&self) -> String {
        match self.codec.as_str() {
            "h264" => format!("avc1.{:02x}{:02x}{:02x}", self.profile, self.constraint, self.level),
            "h265" => "hev1.1.6.L93.B0".to_string(),
            "vp9" => "vp09.00.10.08".to_string(),
            "av1" => "av01.0.04M.08".to_string(),
            other => other.to_string(),
        }
    }
}

/// Audio codec parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioParams {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// AAC AudioSpecificConfig when applicable
    pub asc: Option<Bytes>,
    pub object_type: u8,
}

impl AudioParams {
    pub fn is_complete(&self) -> bool {
        match self.codec.as_str() {
            "aac" => self.asc.is_some(),
            "" => false,
            _ => true,
        }
    }

    pub fn codec_string(&self) -> String {
        match self.codec.as_str() {
            "aac" => format!("mp4a.40.{}", self.object_type.max(2)),
            "mp3" => "mp4a.40.34".to_string(),
            "ac3" => "ac-3".to_string(),
            "eac3" => "ec-3".to_string(),
            "opus" => "opus".to_string(),
            other => other.to_string(),
        }
    }
}

/// Parse profile/level/dimensions from an H.264 SPS NAL (header byte included).
pub fn parse_h264_sps(sps: &[u8]) -> Option<(u8, u8, u8, u32, u32)> {
    if sps.len() < 4 {
        return None;
    }
    let profile = sps[1];
    let constraint = sps[2];
    let level = sps[3];
    let mut r = BitReader::new(&sps[4..]);
    r.ue()?; // seq_parameter_set_id
    let chroma_format_idc = if matches!(profile, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128) {
        let chroma = r.ue()?;
        if chroma == 3 {
            r.bit()?; // separate_colour_plane
        }
        r.ue()?; // bit_depth_luma_minus8
        r.ue()?; // bit_depth_chroma_minus8
        r.bit()?; // qpprime_y_zero_transform_bypass
        if r.bit()? == 1 {
            // seq_scaling_matrix_present: skip the scaling lists
            for i in 0..if chroma != 3 { 8 } else { 12 } {
                if r.bit()? == 1 {
                    let size = if i < 6 { 16 } else { 64 };
                    let mut last = 8i32;
                    let mut next = 8i32;
                    for _ in 0..size {
                        if next != 0 {
                            next = (last + r.se()? + 256) % 256;
                        }
                        if next != 0 {
                            last = next;
                        }
                    }
                }
            }
        }
        chroma
    } else {
        1
    };
    r.ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.ue()?;
    if pic_order_cnt_type == 0 {
        r.ue()?;
    } else if pic_order_cnt_type == 1 {
        r.bit()?;
        r.se()?;
        r.se()?;
        let n = r.ue()?;
        for _ in 0..n {
            r.se()?;
        }
    }
    r.ue()?; // max_num_ref_frames
    r.bit()?; // gaps_in_frame_num_value_allowed
    let pic_width_in_mbs = r.ue()? + 1;
    let pic_height_in_map_units = r.ue()? + 1;
    let frame_mbs_only = r.bit()?;
    if frame_mbs_only == 0 {
        r.bit()?; // mb_adaptive_frame_field
    }
    r.bit()?; // direct_8x8_inference
    let mut width = pic_width_in_mbs * 16;
    let mut height = pic_height_in_map_units * 16 * (2 - frame_mbs_only);
    if r.bit()? == 1 {
        // frame cropping
        let (crop_x, crop_y) = match chroma_format_idc {
            0 => (1, 2 - frame_mbs_only),
            1 => (2, 2 * (2 - frame_mbs_only)),
            2 => (2, 2 - frame_mbs_only),
            _ => (1, 2 - frame_mbs_only),
        };
        let left = r.ue()?;
        let right = r.ue()?;
        let top = r.ue()?;
        let bottom = r.ue()?;
        width = width.saturating_sub((left + right) * crop_x);
        height = height.saturating_sub((top + bottom) * crop_y);
    }
    Some((profile, constraint, level, width, height))
}

/// Best-effort width/height from an H.265 SPS NAL (2-byte header).
pub fn parse_h265_sps(sps: &[u8]) -> Option<(u32, u32)> {
    if sps.len() < 3 {
        return None;
    }
    let mut r = BitReader::new(&sps[2..]);
    r.bits(4)?; // sps_video_parameter_set_id
    let max_sub_layers = r.bits(3)?;
    r.bit()?; // temporal_id_nesting
    // profile_tier_level: 12 bytes general + per-sublayer flags
    r.bits(32)?;
    r.bits(32)?;
    r.bits(32)?;
    if max_sub_layers > 0 {
        let mut present = Vec::new();
        for _ in 0..max_sub_layers {
            let p = r.bit()?;
            let l = r.bit()?;
            present.push((p, l));
        }
        if max_sub_layers < 8 {
            r.bits(2 * (8 - max_sub_layers as usize))?;
        }
        for (p, l) in present {
            if p == 1 {
                r.bits(32)?;
                r.bits(32)?;
                r.bits(24)?;
            }
            if l == 1 {
                r.bits(8)?;
            }
        }
    }
    r.ue()?; // sps_seq_parameter_set_id
    let chroma_format_idc = r.ue()?;
    if chroma_format_idc == 3 {
        r.bit()?;
    }
    let width = r.ue()?;
    let height = r.ue()?;
    Some((width, height))
}

/// Convert an Annex-B access unit into 4-byte length-prefixed form,
/// dropping AUD and parameter set NALs (those live in the sample entry).
pub fn to_length_prefixed(codec: VideoCodec, au: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(au.len() + 16);
    for nal in annexb::split_nals(au) {
        let ty = annexb::nal_type(codec, nal);
        let drop = match codec {
            VideoCodec::H264 => matches!(ty, 7 | 8 | 9),
            VideoCodec::H265 => matches!(ty, 32 | 33 | 34 | 35),
        };
        if drop {
            continue;
        }
        out.put_u32(nal.len() as u32);
        out.put_slice(nal);
    }
    out.freeze()
}

/// Build an AVCDecoderConfigurationRecord (avcC box payload).
pub fn build_avcc(params: &VideoParams) -> Option<Bytes> {
    let sps = params.sps.as_ref()?;
    let pps = params.pps.as_ref()?;
    let mut out = BytesMut::new();
    out.put_u8(1); // configurationVersion
    out.put_u8(params.profile);
    out.put_u8(params.constraint);
    out.put_u8(params.level);
    out.put_u8(0xFF); // 4-byte NAL lengths
    out.put_u8(0xE1); // one SPS
    out.put_u16(sps.len() as u16);
    out.put_slice(sps);
    out.put_u8(1); // one PPS
    out.put_u16(pps.len() as u16);
    out.put_slice(pps);
    Some(out.freeze())
}

/// Build an HEVCDecoderConfigurationRecord (hvcC box payload).
pub fn build_hvcc(params: &VideoParams) -> Option<Bytes> {
    let vps = params.vps.as_ref()?;
    let sps = params.sps.as_ref()?;
    let pps = params.pps.as_ref()?;
    let mut out = BytesMut::new();
    out.put_u8(1); // configurationVersion
    // general profile space/tier/idc: Main profile defaults
    out.put_u8(0x01);
    out.put_u32(0x6000_0000); // profile compatibility
    out.put_slice(&[0x90, 0, 0, 0, 0, 0]); // constraint indicator flags
    out.put_u8(93); // general_level_idc (3.1)
    out.put_u16(0xF000); // min_spatial_segmentation_idc
    out.put_u8(0xFC); // parallelismType
    out.put_u8(0xFD); // chromaFormat 4:2:0
    out.put_u8(0xF8); // bitDepthLumaMinus8
    out.put_u8(0xF8); // bitDepthChromaMinus8
    out.put_u16(0); // avgFrameRate
    out.put_u8(0x0F); // lengthSizeMinusOne 3, no temporal layering
    out.put_u8(3); // numOfArrays
    for (ty, nal) in [(32u8, vps), (33, sps), (34, pps)] {
        out.put_u8(ty); // array_completeness 0
        out.put_u16(1);
        out.put_u16(nal.len() as u16);
        out.put_slice(nal);
    }
    Some(out.freeze())
}

/// Build an ESDS box payload for AAC or MP3.
pub fn build_esds(params: &AudioParams) -> Bytes {
    let (object_type_indication, dec_specific): (u8, Option<&Bytes>) = match params.codec.as_str() {
        "mp3" => (0x6B, None),
        _ => (0x40, params.asc.as_ref()),
    };

    fn descriptor(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        // Expandable size, single byte is enough for our payloads.
        out.push(body.len() as u8);
        out.extend_from_slice(body);
        out
    }

    let mut dec_config = vec![object_type_indication, 0x15]; // AudioStream
    dec_config.extend_from_slice(&[0x00, 0x00, 0x00]); // bufferSizeDB
    dec_config.extend_from_slice(&0u32.to_be_bytes()); // maxBitrate
    dec_config.extend_from_slice(&0u32.to_be_bytes()); // avgBitrate
    if let Some(asc) = dec_specific {
        dec_config.extend_from_slice(&descriptor(0x05, asc));
    }

    let mut es_body = vec![0x00, 0x01, 0x00]; // ES_ID 1, no flags
    es_body.extend_from_slice(&descriptor(0x04, &dec_config));
    es_body.extend_from_slice(&descriptor(0x06, &[0x02])); // SLConfig

    let mut out = BytesMut::new();
    out.put_u32(0); // FullBox version/flags
    out.put_slice(&descriptor(0x03, &es_body));
    out.freeze()
}

/// Build a dOps box payload (OpusSpecificBox).
pub fn build_dops(params: &AudioParams) -> Bytes {
    let mut out = BytesMut::new();
    out.put_u8(0); // Version
    out.put_u8(params.channels.max(1));
    out.put_u16(3840); // PreSkip
    out.put_u32(params.sample_rate.max(48_000));
    out.put_u16(0); // OutputGain
    out.put_u8(0); // ChannelMappingFamily
    out.freeze()
}

/// Build a dec3/dac3 style payload with conservative defaults.
pub fn build_dac3(params: &AudioParams) -> Bytes {
    let mut out = BytesMut::new();
    if params.codec == "eac3" {
        // dec3: data_rate 13 bits + num_ind_sub, then one substream entry.
        out.put_u16(0x0800); // 256 kbit/s, one independent substream
        out.put_slice(&[0x20, 0x0F, 0x00]);
    } else {
        // dac3: fscod/bsid/bsmod/acmod/lfeon/bit_rate_code packed
        out.put_slice(&[0x10, 0x3D, 0xC0]);
    }
    out.freeze()
}

/// Collects codec parameters and converts samples for the fMP4 writer.
pub struct Fmp4Adapter {
    video: VideoParams,
    audio: AudioParams,
    video_expected: bool,
    audio_expected: bool,
}

impl Fmp4Adapter {
    pub fn new(video_codec: Option<&str>, audio_codec: Option<&str>) -> Self {
        Self {
            video: VideoParams {
                codec: video_codec.unwrap_or_default().to_string(),
                ..Default::default()
            },
            audio: AudioParams {
                codec: audio_codec.unwrap_or_default().to_string(),
                ..Default::default()
            },
            video_expected: video_codec.is_some(),
            audio_expected: audio_codec.is_some(),
        }
    }

    pub fn video_params(&self) -> &VideoParams {
        &self.video
    }

    pub fn audio_params(&self) -> &AudioParams {
        &self.audio
    }

    pub fn video_expected(&self) -> bool {
        self.video_expected
    }

    pub fn audio_expected(&self) -> bool {
        self.audio_expected
    }

    /// True once every *expected* track has complete parameters. Init
    /// generation defers only while this is false.
    pub fn params_ready(&self) -> bool {
        (!self.video_expected || self.video.is_complete())
            && (!self.audio_expected || self.audio.is_complete())
    }

    fn video_codec(&self) -> Option<VideoCodec> {
        match self.video.codec.as_str() {
            "h264" => Some(VideoCodec::H264),
            "h265" => Some(VideoCodec::H265),
            _ => None,
        }
    }

    /// Inspect a video sample for parameter sets, then convert it to the
    /// writer's length-prefixed form. Non-H.26x payloads pass through.
    pub fn adapt_video(&mut self, sample: &Sample) -> Bytes {
        let Some(codec) = self.video_codec() else {
            return sample.data.clone();
        };
        if !self.video.is_complete() {
            let found = annexb::extract_param_sets(codec, &sample.data);
            if self.video.sps.is_none() {
                if let Some(sps) = &found.sps {
                    match codec {
                        VideoCodec::H264 => {
                            if let Some((profile, constraint, level, w, h)) = parse_h264_sps(sps) {
                                self.video.profile = profile;
                                self.video.constraint = constraint;
                                self.video.level = level;
                                self.video.width = w;
                                self.video.height = h;
                            }
                        }
                        VideoCodec::H265 => {
                            if let Some((w, h)) = parse_h265_sps(sps) {
                                self.video.width = w;
                                self.video.height = h;
                            }
                        }
                    }
                }
            }
            self.video.vps = self.video.vps.take().or(found.vps);
            self.video.sps = self.video.sps.take().or(found.sps);
            self.video.pps = self.video.pps.take().or(found.pps);
        }
        to_length_prefixed(codec, &sample.data)
    }

    /// Inspect an audio sample; raw frames pass through unchanged.
    pub fn adapt_audio(&mut self, sample: &Sample, init_data: Option<&Bytes>) -> Bytes {
        if !self.audio.is_complete() {
            if self.audio.codec == "aac" {
                if let Some(asc) = init_data {
                    if let Some((object_type, sample_rate, channels)) = adts::parse_asc(asc) {
                        self.audio.object_type = object_type;
                        self.audio.sample_rate = sample_rate;
                        self.audio.channels = channels;
                        self.audio.asc = Some(asc.clone());
                    }
                }
            } else if self.audio.sample_rate == 0 {
                self.audio.sample_rate = 48_000;
                self.audio.channels = 2;
            }
        }
        sample.data.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1280x720 High profile SPS as produced by x264.
    const SPS_720P: [u8; 26] = [
        0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9, 0x40, 0x50, 0x05, 0xBB, 0x01, 0x10, 0x00, 0x00,
        0x03, 0x00, 0x10, 0x00, 0x00, 0x03, 0x03, 0x20, 0xF1, 0x83, 0x19, 0x60,
    ];

    #[test]
    fn test_parse_h264_sps_dimensions() {
        let (profile, constraint, level, width, height) = parse_h264_sps(&SPS_720P).unwrap();
        assert_eq!(profile, 100);
        assert_eq!(constraint, 0x00);
        assert_eq!(level, 31);
        assert_eq!(width, 1280);
        assert_eq!(height, 720);
    }

    #[test]
    fn test_codec_strings() {
        let video = VideoParams {
            codec: "h264".into(),
            profile: 0x64,
            constraint: 0x00,
            level: 0x28,
            ..Default::default()
        };
        assert_eq!(video.codec_string(), "avc1.640028");
        let video = VideoParams {
            codec: "h265".into(),
            ..Default::default()
        };
        assert_eq!(video.codec_string(), "hev1.1.6.L93.B0");

        let audio = AudioParams {
            codec: "aac".into(),
            object_type: 2,
            ..Default::default()
        };
        assert_eq!(audio.codec_string(), "mp4a.40.2");
        let audio = AudioParams {
            codec: "eac3".into(),
            ..Default::default()
        };
        assert_eq!(audio.codec_string(), "ec-3");
    }

    #[test]
    fn test_to_length_prefixed_strips_param_sets() {
        let mut au = Vec::new();
        for nal in [&[0x67u8, 0xAA][..], &[0x68, 0xBB], &[0x65, 0x01, 0x02]] {
            au.extend_from_slice(&[0, 0, 0, 1]);
            au.extend_from_slice(nal);
        }
        let out = to_length_prefixed(VideoCodec::H264, &au);
        assert_eq!(&out[..], &[0, 0, 0, 3, 0x65, 0x01, 0x02]);
    }

    #[test]
    fn test_avcc_layout() {
        let params = VideoParams {
            codec: "h264".into(),
            profile: 66,
            constraint: 0xC0,
            level: 31,
            sps: Some(Bytes::copy_from_slice(&SPS_720P)),
            pps: Some(Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80])),
            ..Default::default()
        };
        let avcc = build_avcc(&params).unwrap();
        assert_eq!(avcc[0], 1);
        assert_eq!(avcc[1], 66);
        assert_eq!(avcc[3], 31);
        assert_eq!(avcc[4], 0xFF);
        assert_eq!(avcc[5], 0xE1);
        let sps_len = u16::from_be_bytes([avcc[6], avcc[7]]) as usize;
        assert_eq!(sps_len, SPS_720P.len());
    }

    #[test]
    fn test_params_ready_gates_on_expected_tracks() {
        let mut adapter = Fmp4Adapter::new(Some("h264"), Some("aac"));
        assert!(!adapter.params_ready());

        // Video keyframe with SPS+PPS resolves the video side.
        let mut au = Vec::new();
        for nal in [&SPS_720P[..], &[0x68, 0xCE, 0x3C, 0x80], &[0x65, 0x00]] {
            au.extend_from_slice(&[0, 0, 0, 1]);
            au.extend_from_slice(nal);
        }
        let sample = Sample {
            sequence: 1,
            pts: 0,
            dts: 0,
            data: Bytes::from(au),
            is_keyframe: true,
            duration: None,
        };
        adapter.adapt_video(&sample);
        assert!(!adapter.params_ready(), "audio ASC still missing");

        let asc = Bytes::copy_from_slice(&adts::build_asc(2, 48_000, 2));
        let audio_sample = Sample {
            sequence: 1,
            pts: 0,
            dts: 0,
            data: Bytes::from_static(&[0u8; 4]),
            is_keyframe: false,
            duration: None,
        };
        adapter.adapt_audio(&audio_sample, Some(&asc));
        assert!(adapter.params_ready());
        assert_eq!(adapter.audio_params().sample_rate, 48_000);
        assert_eq!(adapter.video_params().width, 1280);
    }

    #[test]
    fn test_audio_only_adapter() {
        let mut adapter = Fmp4Adapter::new(None, Some("mp3"));
        let sample = Sample {
            sequence: 1,
            pts: 0,
            dts: 0,
            data: Bytes::from_static(&[0xFF, 0xFB, 0x90, 0x00]),
            is_keyframe: false,
            duration: None,
        };
        adapter.adapt_audio(&sample, None);
        assert!(adapter.params_ready(), "non-AAC audio needs no init data");
    }
}
