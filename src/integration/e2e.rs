//! End-to-end tests over in-process sessions

use std::sync::Arc;
use std::time::Duration;

use crate::config::{RelayConfig, SegmentConfig, SessionConfig};
use crate::demux::TS_PACKET_SIZE;
use crate::processor::FormatProcessor;
use crate::routing::{decide, validate_and_fix, ClientCapabilities, ClientFormat, RouteDecision, RoutePath};
use crate::session::{Session, SessionManager};
use crate::upstream::UpstreamSource;

use super::fixtures::build_av_ts;

fn fast_config() -> RelayConfig {
    RelayConfig {
        segment: SegmentConfig {
            target_duration_secs: 0.2,
            max_segments: 10,
            playlist_segments: 5,
            ..Default::default()
        },
        session: SessionConfig {
            max_sessions: 4,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn session_with_stream(
    frames: usize,
    gop: usize,
) -> (Arc<SessionManager>, Arc<Session>, tokio::sync::mpsc::Sender<bytes::Bytes>) {
    let manager = SessionManager::new(fast_config());
    let (tx, source) = UpstreamSource::pipe(8);
    let session = manager
        .create_with_source("ch1", "http://upstream/live.ts", Default::default(), source)
        .await
        .unwrap();
    tx.send(build_av_ts(frames, gop)).await.unwrap();

    // Wait for the demuxer to resolve the source codec pair.
    for _ in 0..200 {
        if session.buffer().source_key().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (manager, session, tx)
}

fn decision_for(format: ClientFormat) -> RouteDecision {
    let caps = ClientCapabilities {
        preferred_format: Some(format),
        supports_fmp4: true,
        supports_mpegts: true,
        player: None,
    };
    validate_and_fix(decide(
        crate::routing::SourceFormat::Mpegts,
        &[],
        &caps,
        &Default::default(),
    ))
}

#[tokio::test]
async fn test_demux_populates_source_variant() {
    let (manager, session, _tx) = session_with_stream(50, 5).await;
    assert_eq!(session.buffer().source_key(), Some("h264/aac".to_string()));
    let source = session.buffer().source();
    assert!(source.video().count() > 0);
    assert!(source.audio().count() > 0);
    assert!(source.video().init_data().is_some(), "SPS/PPS harvested");
    assert!(source.audio().init_data().is_some(), "AAC ASC harvested");
    manager.shutdown().await;
}

#[tokio::test]
async fn test_hls_ts_playlist_and_segments() {
    let (manager, session, _tx) = session_with_stream(100, 5).await;
    let decision = decision_for(ClientFormat::HlsTs);
    assert_eq!(decision.path, RoutePath::Repackage);
    let FormatProcessor::HlsTs(processor) = session.processor_for(&decision).await.unwrap() else {
        panic!("expected the HLS-TS processor");
    };

    let playlist = tokio::time::timeout(Duration::from_secs(10), processor.playlist())
        .await
        .unwrap()
        .unwrap();
    assert!(playlist.starts_with("#EXTM3U"));
    assert!(playlist.contains("#EXT-X-VERSION:3"));

    // Every referenced segment is retrievable and packet aligned.
    let refs: Vec<u64> = playlist
        .lines()
        .filter_map(|l| l.strip_prefix("segment"))
        .filter_map(|l| l.strip_suffix(".ts"))
        .map(|n| n.parse().unwrap())
        .collect();
    assert!(!refs.is_empty());
    for sequence in refs {
        let segment = processor.segment(sequence).unwrap();
        assert!(!segment.data.is_empty());
        assert_eq!(segment.data.len() % TS_PACKET_SIZE, 0);
        assert_eq!(segment.data[0], 0x47);
        assert!(segment.is_keyframe_start);
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn test_hls_fmp4_init_and_playlist() {
    let (manager, session, _tx) = session_with_stream(100, 5).await;
    let decision = decision_for(ClientFormat::HlsFmp4);
    let FormatProcessor::HlsFmp4(processor) = session.processor_for(&decision).await.unwrap() else {
        panic!("expected the HLS-fMP4 processor");
    };

    let playlist = tokio::time::timeout(Duration::from_secs(10), processor.playlist())
        .await
        .unwrap()
        .unwrap();
    assert!(playlist.contains("#EXT-X-VERSION:7"));
    assert!(playlist.contains("#EXT-X-MAP:URI=\"init.mp4\""));
    assert!(playlist.contains(".m4s"));

    // Init ETag is stable across requests and content addressed.
    let first = processor.init_segment().unwrap();
    let second = processor.init_segment().unwrap();
    assert_eq!(first.etag, second.etag);
    assert_eq!(first.etag.len(), 16);
    assert!(first.has_video && first.has_audio);
    assert_eq!(&first.data[4..8], b"ftyp");
    assert_eq!(first.width, 1280);
    assert_eq!(first.height, 720);

    // Segments reference the same init bytes for the whole window.
    let sequence: u64 = {
        let refs: Vec<u64> = playlist
            .lines()
            .filter_map(|l| l.strip_prefix("segment"))
            .filter_map(|l| l.strip_suffix(".m4s"))
            .map(|n| n.parse().unwrap())
            .collect();
        refs[0]
    };
    let segment = processor.segment(sequence).unwrap();
    assert_eq!(&segment.data[4..8], b"moof");
    manager.shutdown().await;
}

#[tokio::test]
async fn test_dash_manifest() {
    let (manager, session, _tx) = session_with_stream(100, 5).await;
    let decision = decision_for(ClientFormat::Dash);
    let FormatProcessor::Dash(processor) = session.processor_for(&decision).await.unwrap() else {
        panic!("expected the DASH processor");
    };
    let mpd = tokio::time::timeout(Duration::from_secs(10), processor.manifest())
        .await
        .unwrap()
        .unwrap();
    assert!(mpd.contains("type=\"dynamic\""));
    assert!(mpd.contains("codecs=\"avc1.64001f\""));
    assert!(mpd.contains("codecs=\"mp4a.40.2\""));
    assert!(mpd.contains("SegmentTimeline"));

    // availabilityStartTime stays constant across manifests.
    let availability = |m: &str| {
        let start = m.find("availabilityStartTime=\"").unwrap() + 23;
        m[start..start + 24].to_string()
    };
    let mpd2 = processor.manifest().await.unwrap();
    assert_eq!(availability(&mpd), availability(&mpd2));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_mpegts_late_join_header_and_keyframe_gate() {
    let (manager, session, tx) = session_with_stream(20, 5).await;
    let decision = decision_for(ClientFormat::Mpegts);
    assert_eq!(decision.path, RoutePath::Passthrough);
    let FormatProcessor::Mpegts(processor) = session.processor_for(&decision).await.unwrap() else {
        panic!("expected the MPEG-TS processor");
    };

    // Let the broadcast loop initialize and capture the header.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let record = crate::processor::ClientRecord::new("late", "127.0.0.1:1", "test", ClientFormat::Mpegts);
    let (_client, mut rx) = processor.register_client(record).unwrap();

    // Keep the stream rolling so the late joiner sees fresh keyframes.
    let feeder = tokio::spawn(async move {
        for _ in 0..20 {
            if tx.send(build_av_ts(10, 5)).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    let header = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .expect("header chunk");
    // PAT/PMT blob first: sync byte, PID 0, payload start indicator.
    assert_eq!(header[0], 0x47);
    assert_eq!(header[1] & 0x1F, 0);
    assert_eq!(header[1] & 0x40, 0x40);
    assert_eq!(header.len() % TS_PACKET_SIZE, 0);

    // First payload chunk begins at a keyframe: adaptation field with the
    // random access indicator on the first packet.
    let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .expect("payload chunk");
    assert_eq!(payload[0], 0x47);
    assert_eq!(payload[3] & 0x20, 0x20, "adaptation field present");
    assert_eq!(payload[5] & 0x40, 0x40, "random access indicator set");

    assert_eq!(processor.client_count(), 1);
    drop(rx);
    feeder.abort();
    manager.shutdown().await;
}

#[tokio::test]
async fn test_session_close_stops_processors_once() {
    let (manager, session, _tx) = session_with_stream(30, 5).await;
    let decision = decision_for(ClientFormat::HlsTs);
    session.processor_for(&decision).await.unwrap();
    session.close().await;
    session.close().await;
    assert!(session.is_closed());
    assert_eq!(session.total_clients(), 0);
    manager.shutdown().await;
}
