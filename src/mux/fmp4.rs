//! Fragmented MP4 writer
//!
//! Builds the `ftyp+moov` init segment once per processor and a
//! `moof+mdat` pair per media segment. Both tracks run on the 90 kHz
//! timescale; the video track is id 1 and audio id 2.

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::error::{RelayError, Result};

use super::adapter::{build_avcc, build_dac3, build_dops, build_esds, build_hvcc, AudioParams, VideoParams};

pub const TIMESCALE: u32 = 90_000;
pub const VIDEO_TRACK_ID: u32 = 1;
pub const AUDIO_TRACK_ID: u32 = 2;

const SYNC_FLAGS: u32 = 0x0200_0000;
const NON_SYNC_FLAGS: u32 = 0x0101_0000;

/// Write a size-prefixed box; the body is produced by the closure.
macro_rules! write_box {
    ($buf:expr, $fourcc:expr, $body:block) => {{
        let start = $buf.len();
        $buf.put_u32(0);
        $buf.put_slice($fourcc);
        $body
        let size = ($buf.len() - start) as u32;
        $buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
    }};
}

/// Generated init segment plus the metadata manifests need.
#[derive(Debug, Clone)]
pub struct InitSegment {
    pub data: Bytes,
    /// First 8 bytes of the SHA-256 of the init bytes, hex encoded
    pub etag: String,
    pub has_video: bool,
    pub has_audio: bool,
    pub video_codec_string: Option<String>,
    pub audio_codec_string: Option<String>,
    pub width: u32,
    pub height: u32,
    pub audio_sample_rate: u32,
    pub timescale: u32,
}

/// One media sample prepared for a fragment.
#[derive(Debug, Clone)]
pub struct FragSample {
    pub data: Bytes,
    /// 90 kHz ticks
    pub duration: u32,
    /// pts - dts, 90 kHz
    pub composition_offset: i32,
    pub keyframe: bool,
}

fn put_matrix(buf: &mut BytesMut) {
    for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        buf.put_u32(v);
    }
}

fn write_mvhd(buf: &mut BytesMut, next_track_id: u32) {
    write_box!(buf, b"mvhd", {
        buf.put_u32(0); // version 0, flags 0
        buf.put_u32(0); // creation_time
        buf.put_u32(0); // modification_time
        buf.put_u32(TIMESCALE);
        buf.put_u32(0); // duration (live)
        buf.put_u32(0x0001_0000); // rate
        buf.put_u16(0x0100); // volume
        buf.put_u16(0);
        buf.put_u64(0);
        put_matrix(buf);
        for _ in 0..6 {
            buf.put_u32(0);
        }
        buf.put_u32(next_track_id);
    });
}

fn write_tkhd(buf: &mut BytesMut, track_id: u32, width: u32, height: u32, audio: bool) {
    write_box!(buf, b"tkhd", {
        buf.put_u32(0x0000_0003); // version 0, enabled + in movie
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(track_id);
        buf.put_u32(0);
        buf.put_u32(0); // duration
        buf.put_u64(0);
        buf.put_u16(0); // layer
        buf.put_u16(0); // alternate group
        buf.put_u16(if audio { 0x0100 } else { 0 }); // volume
        buf.put_u16(0);
        put_matrix(buf);
        buf.put_u32(width << 16);
        buf.put_u32(height << 16);
    });
}

fn write_mdhd(buf: &mut BytesMut) {
    write_box!(buf, b"mdhd", {
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(TIMESCALE);
        buf.put_u32(0); // duration
        buf.put_u16(0x55C4); // und
        buf.put_u16(0);
    });
}

fn write_hdlr(buf: &mut BytesMut, handler: &[u8; 4], name: &[u8]) {
    write_box!(buf, b"hdlr", {
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_slice(handler);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_slice(name);
        buf.put_u8(0);
    });
}

fn write_dinf(buf: &mut BytesMut) {
    write_box!(buf, b"dinf", {
        write_box!(buf, b"dref", {
            buf.put_u32(0);
            buf.put_u32(1);
            write_box!(buf, b"url ", {
                buf.put_u32(1); // self-contained
            });
        });
    });
}

fn write_empty_sample_tables(buf: &mut BytesMut) {
    write_box!(buf, b"stts", {
        buf.put_u32(0);
        buf.put_u32(0);
    });
    write_box!(buf, b"stsc", {
        buf.put_u32(0);
        buf.put_u32(0);
    });
    write_box!(buf, b"stsz", {
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0);
    });
    write_box!(buf, b"stco", {
        buf.put_u32(0);
        buf.put_u32(0);
    });
}

fn write_visual_sample_entry(buf: &mut BytesMut, params: &VideoParams) -> Result<()> {
    let (fourcc, config_fourcc, config): (&[u8; 4], &[u8; 4], Bytes) = match params.codec.as_str() {
        "h264" => (
            b"avc1",
            b"avcC",
            build_avcc(params).ok_or_else(|| RelayError::Mux("missing SPS/PPS".into()))?,
        ),
        "h265" => (
            b"hvc1",
            b"hvcC",
            build_hvcc(params).ok_or_else(|| RelayError::Mux("missing VPS/SPS/PPS".into()))?,
        ),
        other => {
            return Err(RelayError::Mux(format!(
                "no fMP4 sample entry for video codec {}",
                other
            )))
        }
    };
    write_box!(buf, fourcc, {
        buf.put_slice(&[0u8; 6]);
        buf.put_u16(1); // data reference index
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u16(params.width as u16);
        buf.put_u16(params.height as u16);
        buf.put_u32(0x0048_0000); // 72 dpi
        buf.put_u32(0x0048_0000);
        buf.put_u32(0);
        buf.put_u16(1); // frame count
        buf.put_slice(&[0u8; 32]); // compressor name
        buf.put_u16(0x0018); // depth
        buf.put_i16(-1);
        write_box!(buf, config_fourcc, {
            buf.put_slice(&config);
        });
    });
    Ok(())
}

fn write_audio_sample_entry(buf: &mut BytesMut, params: &AudioParams) -> Result<()> {
    let (fourcc, config_fourcc, config): (&[u8; 4], &[u8; 4], Bytes) = match params.codec.as_str() {
        "aac" | "mp3" => (b"mp4a", b"esds", build_esds(params)),
        "ac3" => (b"ac-3", b"dac3", build_dac3(params)),
        "eac3" => (b"ec-3", b"dec3", build_dac3(params)),
        "opus" => (b"Opus", b"dOps", build_dops(params)),
        other => {
            return Err(RelayError::Mux(format!(
                "no fMP4 sample entry for audio codec {}",
                other
            )))
        }
    };
    write_box!(buf, fourcc, {
        buf.put_slice(&[0u8; 6]);
        buf.put_u16(1); // data reference index
        buf.put_u64(0);
        buf.put_u16(params.channels.max(2) as u16);
        buf.put_u16(16); // sample size
        buf.put_u32(0);
        buf.put_u32(params.sample_rate.max(48_000) << 16);
        write_box!(buf, config_fourcc, {
            buf.put_slice(&config);
        });
    });
    Ok(())
}

fn write_trak(buf: &mut BytesMut, video: Option<&VideoParams>, audio: Option<&AudioParams>) -> Result<()> {
    let is_video = video.is_some();
    let (track_id, width, height) = match video {
        Some(v) => (VIDEO_TRACK_ID, v.width, v.height),
        None => (AUDIO_TRACK_ID, 0, 0),
    };
    write_box!(buf, b"trak", {
        write_tkhd(buf, track_id, width, height, !is_video);
        write_box!(buf, b"mdia", {
            write_mdhd(buf);
            if is_video {
                write_hdlr(buf, b"vide", b"VideoHandler");
            } else {
                write_hdlr(buf, b"soun", b"SoundHandler");
            }
            write_box!(buf, b"minf", {
                if is_video {
                    write_box!(buf, b"vmhd", {
                        buf.put_u32(1);
                        buf.put_u64(0);
                    });
                } else {
                    write_box!(buf, b"smhd", {
                        buf.put_u32(0);
                        buf.put_u32(0);
                    });
                }
                write_dinf(buf);
                write_box!(buf, b"stbl", {
                    write_box!(buf, b"stsd", {
                        buf.put_u32(0);
                        buf.put_u32(1);
                        if let Some(v) = video {
                            write_visual_sample_entry(buf, v)?;
                        } else if let Some(a) = audio {
                            write_audio_sample_entry(buf, a)?;
                        }
                    });
                    write_empty_sample_tables(buf);
                });
            });
        });
    });
    Ok(())
}

fn write_trex(buf: &mut BytesMut, track_id: u32) {
    write_box!(buf, b"trex", {
        buf.put_u32(0);
        buf.put_u32(track_id);
        buf.put_u32(1); // default sample description index
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(NON_SYNC_FLAGS);
    });
}

/// Build the init segment from resolved codec parameters. At least one
/// track must be present and complete.
pub fn build_init(video: Option<&VideoParams>, audio: Option<&AudioParams>) -> Result<InitSegment> {
    if video.is_none() && audio.is_none() {
        return Err(RelayError::Mux("init segment needs at least one track".into()));
    }
    let mut buf = BytesMut::with_capacity(1024);
    write_box!(&mut buf, b"ftyp", {
        buf.put_slice(b"iso5");
        buf.put_u32(0x0000_0200);
        buf.put_slice(b"iso5");
        buf.put_slice(b"iso6");
        buf.put_slice(b"mp41");
    });
    write_box!(&mut buf, b"moov", {
        write_mvhd(&mut buf, 3);
        if let Some(v) = video {
            write_trak(&mut buf, Some(v), None)?;
        }
        if let Some(a) = audio {
            write_trak(&mut buf, None, Some(a))?;
        }
        write_box!(&mut buf, b"mvex", {
            if video.is_some() {
                write_trex(&mut buf, VIDEO_TRACK_ID);
            }
            if audio.is_some() {
                write_trex(&mut buf, AUDIO_TRACK_ID);
            }
        });
    });

    let data = buf.freeze();
    let digest = Sha256::digest(&data);
    let etag = hex_prefix(&digest);
    Ok(InitSegment {
        etag,
        has_video: video.is_some(),
        has_audio: audio.is_some(),
        video_codec_string: video.map(|v| v.codec_string()),
        audio_codec_string: audio.map(|a| a.codec_string()),
        width: video.map(|v| v.width).unwrap_or(0),
        height: video.map(|v| v.height).unwrap_or(0),
        audio_sample_rate: audio.map(|a| a.sample_rate.max(48_000)).unwrap_or(0),
        timescale: TIMESCALE,
        data,
    })
}

fn hex_prefix(digest: &[u8]) -> String {
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

fn write_traf(
    buf: &mut BytesMut,
    track_id: u32,
    base_decode_time: u64,
    samples: &[FragSample],
    with_cts: bool,
) -> usize {
    let mut data_offset_pos = 0;
    write_box!(buf, b"traf", {
        write_box!(buf, b"tfhd", {
            buf.put_u32(0x0002_0000); // default-base-is-moof
            buf.put_u32(track_id);
        });
        write_box!(buf, b"tfdt", {
            buf.put_u32(1 << 24);
            buf.put_u64(base_decode_time);
        });
        write_box!(buf, b"trun", {
            let mut flags: u32 = 0x000001 | 0x000100 | 0x000200 | 0x000400;
            if with_cts {
                flags |= 0x000800;
            }
            buf.put_u32((1 << 24) | flags); // version 1 for signed cts
            buf.put_u32(samples.len() as u32);
            data_offset_pos = buf.len();
            buf.put_i32(0); // patched later
            for sample in samples {
                buf.put_u32(sample.duration);
                buf.put_u32(sample.data.len() as u32);
                buf.put_u32(if sample.keyframe { SYNC_FLAGS } else { NON_SYNC_FLAGS });
                if with_cts {
                    buf.put_i32(sample.composition_offset);
                }
            }
        });
    });
    data_offset_pos
}

/// Build one `moof+mdat` media segment. `video_base`/`audio_base` are the
/// tfdt decode times in 90 kHz ticks.
pub fn build_fragment(
    sequence: u32,
    video: &[FragSample],
    video_base: u64,
    audio: &[FragSample],
    audio_base: u64,
) -> Bytes {
    let mut moof = BytesMut::with_capacity(1024);
    let mut video_offset_pos = None;
    let mut audio_offset_pos = None;
    write_box!(&mut moof, b"moof", {
        write_box!(&mut moof, b"mfhd", {
            moof.put_u32(0);
            moof.put_u32(sequence);
        });
        if !video.is_empty() {
            video_offset_pos = Some(write_traf(&mut moof, VIDEO_TRACK_ID, video_base, video, true));
        }
        if !audio.is_empty() {
            audio_offset_pos = Some(write_traf(&mut moof, AUDIO_TRACK_ID, audio_base, audio, false));
        }
    });

    let video_len: usize = video.iter().map(|s| s.data.len()).sum();
    let audio_len: usize = audio.iter().map(|s| s.data.len()).sum();

    // Data offsets are relative to the start of the moof.
    let base = moof.len() as i32 + 8;
    if let Some(pos) = video_offset_pos {
        moof[pos..pos + 4].copy_from_slice(&base.to_be_bytes());
    }
    if let Some(pos) = audio_offset_pos {
        let off = base + video_len as i32;
        moof[pos..pos + 4].copy_from_slice(&off.to_be_bytes());
    }

    let mut out = BytesMut::with_capacity(moof.len() + 8 + video_len + audio_len);
    out.put_slice(&moof);
    out.put_u32((8 + video_len + audio_len) as u32);
    out.put_slice(b"mdat");
    for sample in video {
        out.put_slice(&sample.data);
    }
    for sample in audio {
        out.put_slice(&sample.data);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk_boxes(data: &[u8]) -> Vec<(String, usize)> {
        let mut out = Vec::new();
        let mut i = 0;
        while i + 8 <= data.len() {
            let size = u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]) as usize;
            let name = String::from_utf8_lossy(&data[i + 4..i + 8]).to_string();
            out.push((name, size));
            if size < 8 {
                break;
            }
            i += size;
        }
        out
    }

    fn h264_params() -> VideoParams {
        VideoParams {
            codec: "h264".into(),
            width: 1280,
            height: 720,
            sps: Some(Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F])),
            pps: Some(Bytes::from_static(&[0x68, 0xCE])),
            profile: 100,
            constraint: 0,
            level: 31,
            ..Default::default()
        }
    }

    fn aac_params() -> AudioParams {
        AudioParams {
            codec: "aac".into(),
            sample_rate: 48_000,
            channels: 2,
            asc: Some(Bytes::from_static(&[0x11, 0x90])),
            object_type: 2,
        }
    }

    #[test]
    fn test_init_top_level_boxes() {
        let init = build_init(Some(&h264_params()), Some(&aac_params())).unwrap();
        let boxes = walk_boxes(&init.data);
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].0, "ftyp");
        assert_eq!(boxes[1].0, "moov");
        assert!(init.has_video && init.has_audio);
        assert_eq!(init.video_codec_string.as_deref(), Some("avc1.64001f"));
        assert_eq!(init.audio_codec_string.as_deref(), Some("mp4a.40.2"));
    }

    #[test]
    fn test_init_etag_is_stable_and_content_addressed() {
        let a = build_init(Some(&h264_params()), Some(&aac_params())).unwrap();
        let b = build_init(Some(&h264_params()), Some(&aac_params())).unwrap();
        assert_eq!(a.etag, b.etag);
        assert_eq!(a.etag.len(), 16);
        let mut other = h264_params();
        other.width = 1920;
        let c = build_init(Some(&other), Some(&aac_params())).unwrap();
        assert_ne!(a.etag, c.etag);
    }

    #[test]
    fn test_init_requires_a_track() {
        assert!(build_init(None, None).is_err());
        let audio_only = build_init(None, Some(&aac_params())).unwrap();
        assert!(!audio_only.has_video);
        assert!(audio_only.has_audio);
    }

    #[test]
    fn test_fragment_layout_and_data_offsets() {
        let video = vec![
            FragSample {
                data: Bytes::from_static(b"vvvv"),
                duration: 3000,
                composition_offset: 0,
                keyframe: true,
            },
            FragSample {
                data: Bytes::from_static(b"ww"),
                duration: 3000,
                composition_offset: 1500,
                keyframe: false,
            },
        ];
        let audio = vec![FragSample {
            data: Bytes::from_static(b"aaa"),
            duration: 1920,
            composition_offset: 0,
            keyframe: false,
        }];
        let frag = build_fragment(7, &video, 90_000, &audio, 90_000);
        let boxes = walk_boxes(&frag);
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].0, "moof");
        assert_eq!(boxes[1].0, "mdat");
        let moof_len = boxes[0].1;
        // mdat payload is video bytes then audio bytes.
        assert_eq!(&frag[moof_len + 8..moof_len + 12], b"vvvv");
        assert_eq!(&frag[frag.len() - 3..], b"aaa");

        // The video trun data offset points at the first video byte.
        let trun_pos = frag
            .windows(4)
            .position(|w| w == b"trun")
            .expect("trun present");
        // version/flags (4) + sample_count (4), then data_offset.
        let off_pos = trun_pos + 4 + 8;
        let data_offset =
            i32::from_be_bytes([frag[off_pos], frag[off_pos + 1], frag[off_pos + 2], frag[off_pos + 3]]);
        assert_eq!(data_offset as usize, moof_len + 8);
    }

    #[test]
    fn test_fragment_audio_only() {
        let audio = vec![FragSample {
            data: Bytes::from_static(b"xyz"),
            duration: 1920,
            composition_offset: 0,
            keyframe: false,
        }];
        let frag = build_fragment(1, &[], 0, &audio, 0);
        let boxes = walk_boxes(&frag);
        assert_eq!(boxes[0].0, "moof");
        assert_eq!(&frag[frag.len() - 3..], b"xyz");
    }
}
