//! Delivery path routing
//!
//! Given the source format, the client's capabilities and the channel
//! profile, pick passthrough, repackage or transcode, and the packaging
//! the client receives. Pure functions; the session manager acts on the
//! decision.

use serde::Serialize;

use crate::config::ProfileConfig;

/// Classified upstream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceFormat {
    Hls,
    Dash,
    Mpegts,
    RawTs,
    Unknown,
}

impl SourceFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "hls" => SourceFormat::Hls,
            "dash" => SourceFormat::Dash,
            "mpegts" | "ts" => SourceFormat::Mpegts,
            "raw-ts" | "rawts" => SourceFormat::RawTs,
            _ => SourceFormat::Unknown,
        }
    }

    /// Segmented sources can be repackaged; a raw TS pipe needs the
    /// relay to originate segmentation itself.
    pub fn is_segmented(&self) -> bool {
        matches!(self, SourceFormat::Hls | SourceFormat::Dash)
    }
}

/// Packaging served to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientFormat {
    Mpegts,
    HlsTs,
    HlsFmp4,
    Dash,
}

impl ClientFormat {
    /// Accepts every query value the HTTP surface documents.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mpegts" | "ts" => Some(ClientFormat::Mpegts),
            "hls" | "hls-ts" => Some(ClientFormat::HlsTs),
            "hls-fmp4" | "fmp4" | "cmaf" => Some(ClientFormat::HlsFmp4),
            "dash" => Some(ClientFormat::Dash),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientFormat::Mpegts => "mpegts",
            ClientFormat::HlsTs => "hls",
            ClientFormat::HlsFmp4 => "hls-fmp4",
            ClientFormat::Dash => "dash",
        }
    }

    /// True when TS is the segment/stream container.
    fn is_ts_container(&self) -> bool {
        matches!(self, ClientFormat::Mpegts | ClientFormat::HlsTs)
    }
}

/// What the HTTP layer learned about a client.
#[derive(Debug, Clone, Default)]
pub struct ClientCapabilities {
    pub preferred_format: Option<ClientFormat>,
    pub supports_fmp4: bool,
    pub supports_mpegts: bool,
    pub player: Option<String>,
}

/// The three delivery paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoutePath {
    Passthrough,
    Repackage,
    Transcode,
}

/// Routing outcome handed to the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub path: RoutePath,
    pub client_format: ClientFormat,
    pub video_codec: String,
    pub audio_codec: String,
    pub reasons: Vec<String>,
}

/// Collapse codec aliases to the canonical names used everywhere else.
/// The base codec is whatever precedes the first `.` (so `avc1.64001f`
/// normalises like `avc1`).
pub fn normalize_codec(name: &str) -> String {
    let base = name.split('.').next().unwrap_or(name).to_ascii_lowercase();
    match base.as_str() {
        "avc" | "avc1" | "avc3" => "h264".to_string(),
        "hevc" | "hvc1" | "hev1" => "h265".to_string(),
        "mp4a" => "aac".to_string(),
        "ec3" | "ec-3" => "eac3".to_string(),
        "ac-3" => "ac3".to_string(),
        "vp09" => "vp9".to_string(),
        "av01" => "av1".to_string(),
        other => other.to_string(),
    }
}

/// Codecs a TS container (continuous or HLS segments) can carry.
fn ts_carriable(codec: &str) -> bool {
    matches!(
        normalize_codec(codec).as_str(),
        "h264" | "h265" | "aac" | "mp3" | "ac3" | "eac3"
    )
}

fn format_from_profile(profile: &ProfileConfig) -> Option<ClientFormat> {
    if profile.detection_mode.eq_ignore_ascii_case("auto") {
        if profile.container.eq_ignore_ascii_case("auto") {
            None
        } else {
            ClientFormat::parse(&profile.container)
        }
    } else {
        ClientFormat::parse(&profile.detection_mode).or_else(|| ClientFormat::parse(&profile.container))
    }
}

/// Decide the delivery path. Deterministic: equal inputs yield equal
/// decisions.
pub fn decide(
    source_format: SourceFormat,
    source_codecs: &[String],
    caps: &ClientCapabilities,
    profile: &ProfileConfig,
) -> RouteDecision {
    let mut reasons = Vec::new();
    let forced = !profile.detection_mode.eq_ignore_ascii_case("auto");

    let client_format = if forced {
        let format = format_from_profile(profile).unwrap_or(ClientFormat::Mpegts);
        reasons.push(format!(
            "profile forces detection_mode={} -> {}",
            profile.detection_mode,
            format.as_str()
        ));
        format
    } else if let Some(preferred) = caps.preferred_format {
        reasons.push(format!("client prefers {}", preferred.as_str()));
        preferred
    } else if let Some(format) = format_from_profile(profile) {
        reasons.push(format!("profile container {}", format.as_str()));
        format
    } else if caps.supports_fmp4 {
        reasons.push("client supports fMP4".to_string());
        ClientFormat::HlsFmp4
    } else {
        reasons.push("fallback to MPEG-TS".to_string());
        ClientFormat::Mpegts
    };

    if !profile.is_copy() {
        reasons.push(format!(
            "profile targets {}/{}",
            profile.video_codec, profile.audio_codec
        ));
        return RouteDecision {
            path: RoutePath::Transcode,
            client_format,
            video_codec: normalize_codec(&profile.video_codec),
            audio_codec: normalize_codec(&profile.audio_codec),
            reasons,
        };
    }

    if !source_format.is_segmented() && source_format != SourceFormat::Mpegts {
        reasons.push("source is not segmented, transcoder originates segmentation".to_string());
        return RouteDecision {
            path: RoutePath::Transcode,
            client_format,
            video_codec: "copy".to_string(),
            audio_codec: "copy".to_string(),
            reasons,
        };
    }

    let same_family = matches!(
        (source_format, client_format),
        (SourceFormat::Hls, ClientFormat::HlsTs)
            | (SourceFormat::Dash, ClientFormat::Dash)
            | (SourceFormat::Mpegts, ClientFormat::Mpegts)
    );
    if same_family {
        reasons.push("source and client share a container family".to_string());
        return RouteDecision {
            path: RoutePath::Passthrough,
            client_format,
            video_codec: "copy".to_string(),
            audio_codec: "copy".to_string(),
            reasons,
        };
    }

    let compatible = if client_format.is_ts_container() {
        source_codecs.iter().all(|c| ts_carriable(c))
    } else {
        // fMP4 and DASH targets accept every codec the relay lists.
        true
    };
    if compatible {
        reasons.push(format!(
            "codecs fit the {} container, repackaging",
            client_format.as_str()
        ));
        RouteDecision {
            path: RoutePath::Repackage,
            client_format,
            video_codec: "copy".to_string(),
            audio_codec: "copy".to_string(),
            reasons,
        }
    } else {
        reasons.push("source codecs incompatible with the target container".to_string());
        RouteDecision {
            path: RoutePath::Transcode,
            client_format,
            video_codec: "copy".to_string(),
            audio_codec: "copy".to_string(),
            reasons,
        }
    }
}

/// Container each codec may be packaged into.
fn codec_allows_container(codec: &str, format: ClientFormat) -> bool {
    match normalize_codec(codec).as_str() {
        "copy" => true,
        "av1" | "vp9" | "opus" => !format.is_ts_container(),
        "h264" | "h265" | "aac" | "ac3" | "eac3" | "mp3" => true,
        // Unknown codecs only fit the forgiving containers.
        _ => !format.is_ts_container(),
    }
}

/// Normalise codec names and downgrade the container when the chosen
/// codec cannot be carried in it. Idempotent.
pub fn validate_and_fix(mut decision: RouteDecision) -> RouteDecision {
    decision.video_codec = normalize_codec(&decision.video_codec);
    decision.audio_codec = normalize_codec(&decision.audio_codec);

    let fits = codec_allows_container(&decision.video_codec, decision.client_format)
        && codec_allows_container(&decision.audio_codec, decision.client_format);
    if !fits {
        let fixed = match decision.client_format {
            ClientFormat::HlsTs => ClientFormat::HlsFmp4,
            ClientFormat::Mpegts => ClientFormat::HlsFmp4,
            other => other,
        };
        if fixed != decision.client_format {
            decision.reasons.push(format!(
                "container downgraded {} -> {} for codec compatibility",
                decision.client_format.as_str(),
                fixed.as_str()
            ));
            decision.client_format = fixed;
        }
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy_profile() -> ProfileConfig {
        ProfileConfig::default()
    }

    fn caps_fmp4() -> ClientCapabilities {
        ClientCapabilities {
            supports_fmp4: true,
            supports_mpegts: true,
            ..Default::default()
        }
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_passthrough_same_family() {
        let caps = ClientCapabilities {
            preferred_format: Some(ClientFormat::HlsTs),
            ..Default::default()
        };
        let decision = decide(
            SourceFormat::Hls,
            &strings(&["h264", "aac"]),
            &caps,
            &copy_profile(),
        );
        assert_eq!(decision.path, RoutePath::Passthrough);
        assert_eq!(decision.client_format, ClientFormat::HlsTs);
    }

    #[test]
    fn test_repackage_hls_to_mpegts() {
        let caps = ClientCapabilities {
            preferred_format: Some(ClientFormat::Mpegts),
            ..Default::default()
        };
        let decision = decide(
            SourceFormat::Hls,
            &strings(&["h265", "eac3"]),
            &caps,
            &copy_profile(),
        );
        assert_eq!(decision.path, RoutePath::Repackage);
        assert_eq!(decision.client_format, ClientFormat::Mpegts);
    }

    #[test]
    fn test_transcode_forced_by_profile_codecs() {
        let profile = ProfileConfig {
            video_codec: "h264".into(),
            audio_codec: "aac".into(),
            container: "hls-fmp4".into(),
            ..Default::default()
        };
        let decision = decide(
            SourceFormat::Hls,
            &strings(&["vp9", "opus"]),
            &caps_fmp4(),
            &profile,
        );
        assert_eq!(decision.path, RoutePath::Transcode);
        assert_eq!(decision.client_format, ClientFormat::HlsFmp4);
        assert_eq!(decision.video_codec, "h264");
    }

    #[test]
    fn test_transcode_for_unsegmented_source() {
        let decision = decide(
            SourceFormat::RawTs,
            &strings(&["h264", "aac"]),
            &caps_fmp4(),
            &copy_profile(),
        );
        assert_eq!(decision.path, RoutePath::Transcode);
    }

    #[test]
    fn test_transcode_when_codecs_do_not_fit_ts() {
        let caps = ClientCapabilities {
            preferred_format: Some(ClientFormat::Mpegts),
            ..Default::default()
        };
        let decision = decide(
            SourceFormat::Hls,
            &strings(&["vp9", "opus"]),
            &caps,
            &copy_profile(),
        );
        assert_eq!(decision.path, RoutePath::Transcode);
    }

    #[test]
    fn test_default_format_by_capability() {
        let decision = decide(
            SourceFormat::Hls,
            &strings(&["h264", "aac"]),
            &caps_fmp4(),
            &copy_profile(),
        );
        assert_eq!(decision.client_format, ClientFormat::HlsFmp4);

        let no_fmp4 = ClientCapabilities {
            supports_mpegts: true,
            ..Default::default()
        };
        let decision = decide(
            SourceFormat::Hls,
            &strings(&["h264", "aac"]),
            &no_fmp4,
            &copy_profile(),
        );
        assert_eq!(decision.client_format, ClientFormat::Mpegts);
    }

    #[test]
    fn test_forced_detection_mode_ignores_client() {
        let profile = ProfileConfig {
            detection_mode: "hls".into(),
            ..Default::default()
        };
        let caps = ClientCapabilities {
            preferred_format: Some(ClientFormat::Dash),
            ..Default::default()
        };
        let decision = decide(
            SourceFormat::Hls,
            &strings(&["h264", "aac"]),
            &caps,
            &profile,
        );
        assert_eq!(decision.client_format, ClientFormat::HlsTs);
    }

    #[test]
    fn test_decide_is_idempotent() {
        let caps = caps_fmp4();
        let codecs = strings(&["h265", "aac"]);
        let a = decide(SourceFormat::Mpegts, &codecs, &caps, &copy_profile());
        let b = decide(SourceFormat::Mpegts, &codecs, &caps, &copy_profile());
        assert_eq!(a, b);
    }

    #[test]
    fn test_normalize_codec_aliases() {
        assert_eq!(normalize_codec("AVC1"), "h264");
        assert_eq!(normalize_codec("avc1.64001f"), "h264");
        assert_eq!(normalize_codec("hev1"), "h265");
        assert_eq!(normalize_codec("mp4a.40.2"), "aac");
        assert_eq!(normalize_codec("ec3"), "eac3");
        assert_eq!(normalize_codec("opus"), "opus");
    }

    #[test]
    fn test_validate_and_fix_downgrades_ts_for_opus() {
        let decision = RouteDecision {
            path: RoutePath::Transcode,
            client_format: ClientFormat::HlsTs,
            video_codec: "h264".into(),
            audio_codec: "opus".into(),
            reasons: Vec::new(),
        };
        let fixed = validate_and_fix(decision);
        assert_eq!(fixed.client_format, ClientFormat::HlsFmp4);

        let decision = RouteDecision {
            path: RoutePath::Transcode,
            client_format: ClientFormat::Mpegts,
            video_codec: "vp9".into(),
            audio_codec: "aac".into(),
            reasons: Vec::new(),
        };
        let fixed = validate_and_fix(decision);
        assert_eq!(fixed.client_format, ClientFormat::HlsFmp4);
    }

    #[test]
    fn test_validate_and_fix_is_idempotent() {
        let decision = RouteDecision {
            path: RoutePath::Repackage,
            client_format: ClientFormat::HlsTs,
            video_codec: "hvc1".into(),
            audio_codec: "ec-3".into(),
            reasons: Vec::new(),
        };
        let once = validate_and_fix(decision);
        let twice = validate_and_fix(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once.video_codec, "h265");
        assert_eq!(once.audio_codec, "eac3");
        assert_eq!(once.client_format, ClientFormat::HlsTs);
    }
}
