//! AAC ADTS framing and AudioSpecificConfig handling

use crate::error::{RelayError, Result};

/// Sampling frequencies by ADTS/ASC index.
pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

pub fn sample_rate_index(rate: u32) -> Option<u8> {
    SAMPLE_RATES.iter().position(|&r| r == rate).map(|i| i as u8)
}

/// Parsed fixed part of an ADTS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// MPEG-4 audio object type (profile + 1); 2 = AAC-LC
    pub object_type: u8,
    pub sample_rate: u32,
    pub channel_config: u8,
    /// Whole frame length including the header
    pub frame_length: usize,
    /// 7 without CRC, 9 with
    pub header_length: usize,
}

impl AdtsHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 7 {
            return Err(RelayError::Demux("ADTS header truncated".into()));
        }
        if data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
            return Err(RelayError::Demux("bad ADTS sync word".into()));
        }
        let protection_absent = data[1] & 0x01 != 0;
        let profile = (data[2] >> 6) & 0x03;
        let sr_index = ((data[2] >> 2) & 0x0F) as usize;
        let sample_rate = *SAMPLE_RATES
            .get(sr_index)
            .ok_or_else(|| RelayError::Demux(format!("bad ADTS sample rate index {}", sr_index)))?;
        let channel_config = ((data[2] & 0x01) << 2) | (data[3] >> 6);
        let frame_length =
            (((data[3] & 0x03) as usize) << 11) | ((data[4] as usize) << 3) | ((data[5] >> 5) as usize);
        if frame_length < 7 {
            return Err(RelayError::Demux("ADTS frame length too small".into()));
        }
        Ok(Self {
            object_type: profile + 1,
            sample_rate,
            channel_config,
            frame_length,
            header_length: if protection_absent { 7 } else { 9 },
        })
    }

    /// Build a 7-byte protection-absent header for `payload_len` raw bytes.
    pub fn build(object_type: u8, sample_rate: u32, channels: u8, payload_len: usize) -> [u8; 7] {
        let sr_index = sample_rate_index(sample_rate).unwrap_or(3); // 48 kHz fallback
        let frame_len = payload_len + 7;
        [
            0xFF,
            0xF1,
            ((object_type.saturating_sub(1) & 0x03) << 6) | (sr_index << 2) | ((channels >> 2) & 0x01),
            ((channels & 0x03) << 6) | ((frame_len >> 11) as u8 & 0x03),
            (frame_len >> 3) as u8,
            (((frame_len as u8) & 0x07) << 5) | 0x1F,
            0xFC,
        ]
    }
}

/// Split a PES payload into (header, raw frame) pairs. Truncated or corrupt
/// tails are dropped; the caller counts them.
pub fn split_frames(data: &[u8]) -> Vec<(AdtsHeader, &[u8])> {
    let mut out = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let Ok(header) = AdtsHeader::parse(rest) else {
            break;
        };
        if rest.len() < header.frame_length {
            break;
        }
        out.push((header, &rest[header.header_length..header.frame_length]));
        rest = &rest[header.frame_length..];
    }
    out
}

/// Two-byte AudioSpecificConfig for the common object types.
pub fn build_asc(object_type: u8, sample_rate: u32, channels: u8) -> [u8; 2] {
    let sr_index = sample_rate_index(sample_rate).unwrap_or(3);
    [
        (object_type << 3) | (sr_index >> 1),
        ((sr_index & 0x01) << 7) | ((channels & 0x0F) << 3),
    ]
}

/// Parse (object_type, sample_rate, channel_config) out of an ASC.
pub fn parse_asc(asc: &[u8]) -> Option<(u8, u32, u8)> {
    if asc.len() < 2 {
        return None;
    }
    let object_type = asc[0] >> 3;
    let sr_index = (((asc[0] & 0x07) << 1) | (asc[1] >> 7)) as usize;
    let sample_rate = *SAMPLE_RATES.get(sr_index)?;
    let channels = (asc[1] >> 3) & 0x0F;
    Some((object_type, sample_rate, channels))
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read(&mut self, bits: usize) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..bits {
            let byte = *self.data.get(self.pos / 8)?;
            let bit = (byte >> (7 - (self.pos % 8))) & 1;
            value = (value << 1) | bit as u32;
            self.pos += 1;
        }
        Some(value)
    }
}

/// Resolve the channel count from a Program Config Element at the start of a
/// raw AAC frame. Used when the ADTS header reports `channel_config = 0`.
/// Returns `None` when the first element is not a PCE or the frame is short.
pub fn channels_from_pce(raw_frame: &[u8]) -> Option<u8> {
    let mut reader = BitReader::new(raw_frame);
    let element_id = reader.read(3)?;
    if element_id != 0x05 {
        return None;
    }
    reader.read(4)?; // element_instance_tag
    reader.read(2)?; // object_type
    reader.read(4)?; // sampling_frequency_index
    let num_front = reader.read(4)?;
    let num_side = reader.read(4)?;
    let num_back = reader.read(4)?;
    let num_lfe = reader.read(2)?;
    let num_assoc_data = reader.read(3)?;
    let num_valid_cc = reader.read(4)?;
    if reader.read(1)? == 1 {
        reader.read(4)?; // mono_mixdown_element_number
    }
    if reader.read(1)? == 1 {
        reader.read(4)?; // stereo_mixdown_element_number
    }
    if reader.read(1)? == 1 {
        reader.read(3)?; // matrix_mixdown_idx + pseudo_surround
    }

    let mut channels = 0u8;
    for _ in 0..num_front + num_side + num_back {
        let is_cpe = reader.read(1)?;
        reader.read(4)?; // element tag
        channels += if is_cpe == 1 { 2 } else { 1 };
    }
    for _ in 0..num_lfe {
        reader.read(4)?;
        channels += 1;
    }
    // Associated data and coupling channels do not add output channels.
    let _ = (num_assoc_data, num_valid_cc);
    Some(channels)
}
