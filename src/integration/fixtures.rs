//! Synthetic stream fixtures

use bytes::Bytes;

use crate::demux::adts;
use crate::mux::TsMuxer;

/// 1280x720 High profile SPS as produced by x264.
pub const SPS: [u8; 26] = [
    0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9, 0x40, 0x50, 0x05, 0xBB, 0x01, 0x10, 0x00, 0x00, 0x03,
    0x00, 0x10, 0x00, 0x00, 0x03, 0x03, 0x20, 0xF1, 0x83, 0x19, 0x60,
];
pub const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

/// 90 kHz ticks per video frame (25 fps).
pub const FRAME_TICKS: i64 = 3600;
/// 90 kHz ticks per AAC frame at 48 kHz.
pub const AAC_TICKS: i64 = 1920;

fn annexb(nals: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nals {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nal);
    }
    out
}

/// IDR access unit including parameter sets.
pub fn keyframe_au() -> Vec<u8> {
    annexb(&[&SPS, &PPS, &[0x65, 0x88, 0x84, 0x21, 0xA0]])
}

/// Non-IDR slice.
pub fn plain_au(i: usize) -> Vec<u8> {
    annexb(&[&[0x41, 0x9A, (i & 0xFF) as u8, 0x10]])
}

/// A raw AAC frame payload (content is opaque to the pipeline).
pub fn aac_frame(i: usize) -> Vec<u8> {
    vec![0x21, 0x1A, (i & 0xFF) as u8, 0x00, 0x5A]
}

/// Build a self-contained MPEG-TS stream: H.264 video with a keyframe
/// every `gop` frames and one AAC frame per video frame, 25 fps.
pub fn build_av_ts(frames: usize, gop: usize) -> Bytes {
    let asc = Bytes::copy_from_slice(&adts::build_asc(2, 48_000, 2));
    let mut muxer = TsMuxer::new();
    muxer
        .set_streams(Some("h264"), Some("aac"), Some(&asc))
        .expect("h264/aac are TS codecs");
    muxer.write_psi();
    for i in 0..frames {
        let pts = 90_000 + i as i64 * FRAME_TICKS;
        let keyframe = i % gop == 0;
        let au = if keyframe { keyframe_au() } else { plain_au(i) };
        muxer.mux_video(pts, pts, &au, keyframe).expect("mux video");
        muxer
            .mux_audio(90_000 + i as i64 * AAC_TICKS, &aac_frame(i))
            .expect("mux audio");
        if i % 20 == 19 {
            muxer.write_psi();
        }
    }
    muxer.take_output()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::TS_PACKET_SIZE;

    #[test]
    fn test_fixture_stream_is_packet_aligned() {
        let ts = build_av_ts(10, 5);
        assert!(ts.len() > TS_PACKET_SIZE * 10);
        assert_eq!(ts.len() % TS_PACKET_SIZE, 0);
        for packet in ts.chunks(TS_PACKET_SIZE) {
            assert_eq!(packet[0], 0x47);
        }
    }
}
