//! PES packet header parsing

use crate::error::{RelayError, Result};

/// Parsed PES header; `payload_offset` is where the elementary data starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PesHeader {
    pub stream_id: u8,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub payload_offset: usize,
}

fn read_timestamp(bytes: &[u8]) -> i64 {
    let a = ((bytes[0] >> 1) & 0x07) as i64;
    let b = ((bytes[1] as i64) << 7) | ((bytes[2] >> 1) as i64);
    let c = ((bytes[3] as i64) << 7) | ((bytes[4] >> 1) as i64);
    (a << 30) | (b << 15) | c
}

/// Parse a PES header from the start of an assembled PES packet.
pub fn parse_pes(data: &[u8]) -> Result<PesHeader> {
    if data.len() < 9 || data[0] != 0 || data[1] != 0 || data[2] != 1 {
        return Err(RelayError::Demux("bad PES start code".into()));
    }
    let stream_id = data[3];
    let flags = data[7];
    let header_data_length = data[8] as usize;
    let payload_offset = 9 + header_data_length;
    if data.len() < payload_offset {
        return Err(RelayError::Demux("PES header truncated".into()));
    }

    let mut pts = None;
    let mut dts = None;
    match flags >> 6 {
        0b10 => {
            if header_data_length < 5 {
                return Err(RelayError::Demux("PTS flagged but missing".into()));
            }
            pts = Some(read_timestamp(&data[9..14]));
        }
        0b11 => {
            if header_data_length < 10 {
                return Err(RelayError::Demux("PTS+DTS flagged but missing".into()));
            }
            pts = Some(read_timestamp(&data[9..14]));
            dts = Some(read_timestamp(&data[14..19]));
        }
        _ => {}
    }

    Ok(PesHeader {
        stream_id,
        pts,
        dts,
        payload_offset,
    })
}

/// Encode a 33-bit timestamp into the 5-byte PES form.
pub fn write_timestamp(out: &mut Vec<u8>, prefix: u8, ts: i64) {
    let ts = (ts as u64) & 0x1_FFFF_FFFF;
    out.push((prefix << 4) | (((ts >> 29) as u8) & 0x0E) | 0x01);
    out.push((ts >> 22) as u8);
    out.push((((ts >> 14) as u8) & 0xFE) | 0x01);
    out.push((ts >> 7) as u8);
    out.push((((ts << 1) as u8) & 0xFE) | 0x01);
}
