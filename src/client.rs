//! Client capability detection
//!
//! Turns request hints into [`ClientCapabilities`] for the routing
//! decider. Precedence: `format` query parameter, then the
//! `X-Tvarr-Player` identifier, then `Accept`, then `User-Agent`, then a
//! permissive default.

use regex::Regex;
use std::sync::OnceLock;

use crate::routing::{ClientCapabilities, ClientFormat};

fn ts_player_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(vlc|mpv|lavf|libmpv|kodi|ffmpeg)\b").unwrap())
}

fn hls_player_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(applecoremedia|avplayer|safari|iphone|ipad)").unwrap())
}

fn fmp4_player_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(exoplayer|hls\.js|videojs)").unwrap())
}

fn dash_player_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(shaka|dash\.js|dashjs)").unwrap())
}

fn format_from_player(player: &str) -> Option<ClientFormat> {
    // The custom header may carry a format name outright or a player id.
    if let Some(format) = ClientFormat::parse(player) {
        return Some(format);
    }
    if ts_player_re().is_match(player) {
        return Some(ClientFormat::Mpegts);
    }
    if dash_player_re().is_match(player) {
        return Some(ClientFormat::Dash);
    }
    if fmp4_player_re().is_match(player) {
        return Some(ClientFormat::HlsFmp4);
    }
    if hls_player_re().is_match(player) {
        return Some(ClientFormat::HlsTs);
    }
    None
}

fn format_from_accept(accept: &str) -> Option<ClientFormat> {
    let accept = accept.to_ascii_lowercase();
    if accept.contains("application/vnd.apple.mpegurl") || accept.contains("application/x-mpegurl") {
        Some(ClientFormat::HlsTs)
    } else if accept.contains("application/dash+xml") {
        Some(ClientFormat::Dash)
    } else if accept.contains("video/mp2t") {
        Some(ClientFormat::Mpegts)
    } else if accept.contains("video/mp4") {
        Some(ClientFormat::HlsFmp4)
    } else {
        None
    }
}

/// Detect what a client wants and can play.
pub fn detect_capabilities(
    query_format: Option<&str>,
    player_header: Option<&str>,
    accept: Option<&str>,
    user_agent: Option<&str>,
) -> ClientCapabilities {
    let mut caps = ClientCapabilities {
        preferred_format: None,
        // Without contrary evidence both fMP4 and MPEG-TS are supported.
        supports_fmp4: true,
        supports_mpegts: true,
        player: player_header.map(|p| p.to_string()),
    };

    if let Some(format) = query_format.and_then(ClientFormat::parse) {
        caps.preferred_format = Some(format);
        return caps;
    }
    if let Some(format) = player_header.and_then(format_from_player) {
        caps.preferred_format = Some(format);
        return caps;
    }
    if let Some(format) = accept.and_then(format_from_accept) {
        caps.preferred_format = Some(format);
        return caps;
    }
    if let Some(ua) = user_agent {
        caps.player.get_or_insert_with(|| ua.to_string());
        if let Some(format) = format_from_player(ua) {
            caps.preferred_format = Some(format);
            return caps;
        }
    }
    caps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_format_wins() {
        let caps = detect_capabilities(
            Some("dash"),
            Some("vlc"),
            Some("application/vnd.apple.mpegurl"),
            Some("VLC/3.0.18"),
        );
        assert_eq!(caps.preferred_format, Some(ClientFormat::Dash));
    }

    #[test]
    fn test_player_header_over_accept() {
        let caps = detect_capabilities(
            None,
            Some("exoplayer"),
            Some("application/vnd.apple.mpegurl"),
            None,
        );
        assert_eq!(caps.preferred_format, Some(ClientFormat::HlsFmp4));
        assert_eq!(caps.player.as_deref(), Some("exoplayer"));
    }

    #[test]
    fn test_player_header_may_name_format() {
        let caps = detect_capabilities(None, Some("hls-fmp4"), None, None);
        assert_eq!(caps.preferred_format, Some(ClientFormat::HlsFmp4));
    }

    #[test]
    fn test_accept_header() {
        let caps = detect_capabilities(None, None, Some("application/vnd.apple.mpegurl"), None);
        assert_eq!(caps.preferred_format, Some(ClientFormat::HlsTs));
        let caps = detect_capabilities(None, None, Some("application/dash+xml,*/*"), None);
        assert_eq!(caps.preferred_format, Some(ClientFormat::Dash));
    }

    #[test]
    fn test_user_agent_fallback() {
        let caps = detect_capabilities(None, None, None, Some("VLC/3.0.18 LibVLC/3.0.18"));
        assert_eq!(caps.preferred_format, Some(ClientFormat::Mpegts));
        let caps = detect_capabilities(None, None, None, Some("AppleCoreMedia/1.0.0.16G130"));
        assert_eq!(caps.preferred_format, Some(ClientFormat::HlsTs));
    }

    #[test]
    fn test_default_is_permissive() {
        let caps = detect_capabilities(None, None, Some("*/*"), Some("curl/8.0"));
        assert_eq!(caps.preferred_format, None);
        assert!(caps.supports_fmp4);
        assert!(caps.supports_mpegts);
    }
}
