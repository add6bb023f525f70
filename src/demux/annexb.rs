//! Annex-B access unit handling
//!
//! NAL splitting, keyframe detection and the canonical reordering
//! `[AUD, VPS, SPS, PPS, SEI.., slices..]` that some upstreams violate by
//! sending SEI ahead of the parameter sets.

use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

/// Split an Annex-B byte stream into NAL units (start codes stripped).
pub fn split_nals(data: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut i = 0;
    let mut start: Option<usize> = None;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                out.push(&data[s..code_start]);
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        if s <= data.len() {
            out.push(&data[s..]);
        }
    }
    out
}

pub fn nal_type(codec: VideoCodec, nal: &[u8]) -> u8 {
    match codec {
        VideoCodec::H264 => nal.first().map(|b| b & 0x1F).unwrap_or(0),
        VideoCodec::H265 => nal.first().map(|b| (b >> 1) & 0x3F).unwrap_or(0),
    }
}

/// True if an H.264 SEI NAL carries a recovery point message (type 6).
fn h264_sei_has_recovery_point(nal: &[u8]) -> bool {
    let mut i = 1;
    while i < nal.len() {
        let mut payload_type = 0usize;
        while i < nal.len() && nal[i] == 0xFF {
            payload_type += 255;
            i += 1;
        }
        if i >= nal.len() {
            return false;
        }
        payload_type += nal[i] as usize;
        i += 1;
        let mut payload_size = 0usize;
        while i < nal.len() && nal[i] == 0xFF {
            payload_size += 255;
            i += 1;
        }
        if i >= nal.len() {
            return false;
        }
        payload_size += nal[i] as usize;
        i += 1;
        if payload_type == 6 {
            return true;
        }
        i += payload_size;
    }
    false
}

/// Keyframe detection over a whole access unit.
///
/// H.264: an IDR slice (type 5) or a recovery-point SEI.
/// H.265: any IRAP NAL (BLA/IDR/CRA, types 16..=21).
pub fn is_keyframe(codec: VideoCodec, au: &[u8]) -> bool {
    for nal in split_nals(au) {
        match codec {
            VideoCodec::H264 => match nal_type(codec, nal) {
                5 => return true,
                6 if h264_sei_has_recovery_point(nal) => return true,
                _ => {}
            },
            VideoCodec::H265 => {
                if (16..=21).contains(&nal_type(codec, nal)) {
                    return true;
                }
            }
        }
    }
    false
}

fn order_class(codec: VideoCodec, ty: u8) -> u8 {
    match codec {
        VideoCodec::H264 => match ty {
            9 => 0,  // AUD
            7 => 2,  // SPS
            8 => 3,  // PPS
            6 => 4,  // SEI
            _ => 5,
        },
        VideoCodec::H265 => match ty {
            35 => 0, // AUD
            32 => 1, // VPS
            33 => 2, // SPS
            34 => 3, // PPS
            39 | 40 => 4, // prefix/suffix SEI
            _ => 5,
        },
    }
}

/// Rebuild an access unit with NALs in canonical order, 4-byte start codes.
/// The relative order within each class is preserved.
pub fn reorder_access_unit(codec: VideoCodec, au: &[u8]) -> Bytes {
    let nals = split_nals(au);
    let mut indexed: Vec<(u8, &[u8])> = nals
        .iter()
        .map(|nal| (order_class(codec, nal_type(codec, nal)), *nal))
        .collect();
    // Stable sort keeps slice order and SEI order intact.
    indexed.sort_by_key(|(class, _)| *class);

    let total: usize = indexed.iter().map(|(_, n)| n.len() + 4).sum();
    let mut out = BytesMut::with_capacity(total);
    for (_, nal) in indexed {
        out.put_slice(&[0, 0, 0, 1]);
        out.put_slice(nal);
    }
    out.freeze()
}

/// Parameter sets found in an access unit, in Annex-B form per NAL.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParamSets {
    pub vps: Option<Bytes>,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl ParamSets {
    pub fn is_complete(&self, codec: VideoCodec) -> bool {
        match codec {
            VideoCodec::H264 => self.sps.is_some() && self.pps.is_some(),
            VideoCodec::H265 => self.vps.is_some() && self.sps.is_some() && self.pps.is_some(),
        }
    }
}

/// Extract VPS/SPS/PPS from an access unit. Missing sets stay `None`.
pub fn extract_param_sets(codec: VideoCodec, au: &[u8]) -> ParamSets {
    let mut params = ParamSets::default();
    for nal in split_nals(au) {
        let ty = nal_type(codec, nal);
        let slot = match (codec, ty) {
            (VideoCodec::H264, 7) => &mut params.sps,
            (VideoCodec::H264, 8) => &mut params.pps,
            (VideoCodec::H265, 32) => &mut params.vps,
            (VideoCodec::H265, 33) => &mut params.sps,
            (VideoCodec::H265, 34) => &mut params.pps,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(Bytes::copy_from_slice(nal));
        }
    }
    params
}
