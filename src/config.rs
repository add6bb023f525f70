//! Server configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Shared ES buffer bounds, applied per track of a variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Maximum retained samples per track
    pub max_samples: usize,

    /// Maximum retained bytes per track
    pub max_bytes: usize,

    /// Seconds without a consumer read before a derived variant is torn down
    pub variant_idle_secs: u64,

    /// Seconds to wait for the source variant to resolve its codec pair
    pub resolve_timeout_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_samples: 2048,
            max_bytes: 64 * 1024 * 1024,
            variant_idle_secs: 60,
            resolve_timeout_secs: 2,
        }
    }
}

impl BufferConfig {
    pub fn variant_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.variant_idle_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }
}

/// Segmentation parameters shared by the HLS and DASH processors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Target segment duration in seconds
    pub target_duration_secs: f64,

    /// Segments retained per processor window
    pub max_segments: usize,

    /// Segments referenced by a served playlist (last N of the window)
    pub playlist_segments: usize,

    /// Seconds a manifest request may wait for the first segment
    pub manifest_wait_secs: u64,

    /// Minimum buffer advertised to DASH clients in seconds
    pub min_buffer_secs: f64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            target_duration_secs: 4.0,
            max_segments: 10,
            playlist_segments: 5,
            manifest_wait_secs: 15,
            min_buffer_secs: 2.0,
        }
    }
}

impl SegmentConfig {
    pub fn manifest_wait(&self) -> Duration {
        Duration::from_secs(self.manifest_wait_secs)
    }
}

/// Session lifecycle parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum concurrent sessions across all channels
    pub max_sessions: usize,

    /// Seconds between cleanup sweeps
    pub cleanup_interval_secs: u64,

    /// Seconds a clientless session is kept before teardown
    pub session_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            cleanup_interval_secs: 30,
            session_timeout_secs: 300,
        }
    }
}

impl SessionConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

/// Per-client delivery parameters for the continuous MPEG-TS path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Bounded write queue depth, in chunks, per MPEG-TS client
    pub write_queue_chunks: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            // ~13 KB chunks; 64 of them is under a megabyte of backlog
            write_queue_chunks: 64,
        }
    }
}

/// Transcoding profile attached to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// `auto` honours client capabilities; anything else forces a format
    #[serde(default = "default_auto")]
    pub detection_mode: String,

    /// Target video codec, or `copy`
    #[serde(default = "default_copy")]
    pub video_codec: String,

    /// Target audio codec, or `copy`
    #[serde(default = "default_copy")]
    pub audio_codec: String,

    /// Target container, or `auto`
    #[serde(default = "default_auto")]
    pub container: String,
}

fn default_auto() -> String {
    "auto".to_string()
}

fn default_copy() -> String {
    "copy".to_string()
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            detection_mode: "auto".to_string(),
            video_codec: "copy".to_string(),
            audio_codec: "copy".to_string(),
            container: "auto".to_string(),
        }
    }
}

impl ProfileConfig {
    /// True when neither codec forces a transcode.
    pub fn is_copy(&self) -> bool {
        self.video_codec.eq_ignore_ascii_case("copy") && self.audio_codec.eq_ignore_ascii_case("copy")
    }
}

/// A configured channel: upstream URL plus optional profile override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Upstream URL for this channel
    pub url: String,

    /// Profile override; the default profile applies when absent
    #[serde(default)]
    pub profile: Option<ProfileConfig>,
}

/// Top-level relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub segment: SegmentConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Default profile applied when a channel has none
    #[serde(default)]
    pub profile: ProfileConfig,

    /// Channel id to upstream mapping
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_true() -> bool {
    true
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: true,
            buffer: BufferConfig::default(),
            segment: SegmentConfig::default(),
            session: SessionConfig::default(),
            delivery: DeliveryConfig::default(),
            profile: ProfileConfig::default(),
            channels: HashMap::new(),
        }
    }
}

impl RelayConfig {
    /// Get the socket address string
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::RelayError::Config(e.to_string()))
    }

    /// Effective profile for a channel (override or default).
    pub fn profile_for(&self, channel_id: &str) -> ProfileConfig {
        self.channels
            .get(channel_id)
            .and_then(|c| c.profile.clone())
            .unwrap_or_else(|| self.profile.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.segment.target_duration_secs, 4.0);
        assert_eq!(config.delivery.write_queue_chunks, 64);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
            host = "127.0.0.1"
            port = 8080

            [channels.one]
            url = "http://example.com/stream.ts"
        "#;
        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.socket_addr(), "127.0.0.1:8080");
        assert_eq!(config.buffer.max_samples, 2048);
        assert_eq!(config.segment.playlist_segments, 5);
        assert!(config.channels.contains_key("one"));
        assert!(config.profile_for("one").is_copy());
    }

    #[test]
    fn test_profile_override() {
        let toml = r#"
            [channels.two]
            url = "http://example.com/two.ts"

            [channels.two.profile]
            detection_mode = "auto"
            video_codec = "h264"
            audio_codec = "aac"
            container = "hls-fmp4"
        "#;
        let config: RelayConfig = toml::from_str(toml).unwrap();
        let profile = config.profile_for("two");
        assert!(!profile.is_copy());
        assert_eq!(profile.container, "hls-fmp4");
        // Unknown channels fall back to the default profile.
        assert!(config.profile_for("missing").is_copy());
    }

    #[test]
    fn test_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "port = 9999").unwrap();
        let config = RelayConfig::from_file(f.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port, 9999);
    }
}
