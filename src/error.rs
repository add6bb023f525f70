use std::time::Duration;
use thiserror::Error;

/// Main error type for the relay core.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("upstream failed: {0}")]
    UpstreamFailed(String),

    #[error("upstream completed")]
    UpstreamCompleted,

    #[error("upstream unparseable: {0}")]
    UpstreamUnparseable(String),

    #[error("operation on a stopping processor or session")]
    Stopping,

    #[error("source variant unresolved after {0:?}")]
    SourceUnresolved(Duration),

    #[error("segment not found: seq={sequence}")]
    SegmentNotFound { sequence: u64 },

    #[error("init segment not ready")]
    InitSegmentNotReady,

    #[error("No segments available yet")]
    NoSegments,

    #[error("slow client evicted: {0}")]
    SlowClient(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("maximum sessions reached")]
    MaxSessions,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("channel not configured: {0}")]
    ChannelNotFound(String),

    #[error("variant failed: {0}")]
    VariantFailed(String),

    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("demux error: {0}")]
    Demux(String),

    #[error("mux error: {0}")]
    Mux(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// True for faults that should trip the per-URL circuit breaker.
    pub fn is_upstream_fault(&self) -> bool {
        matches!(
            self,
            RelayError::UpstreamFailed(_) | RelayError::UpstreamUnparseable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_fault_classification() {
        assert!(RelayError::UpstreamFailed("refused".into()).is_upstream_fault());
        assert!(RelayError::UpstreamUnparseable("no PAT".into()).is_upstream_fault());
        assert!(!RelayError::Stopping.is_upstream_fault());
        assert!(!RelayError::InitSegmentNotReady.is_upstream_fault());
    }

    #[test]
    fn test_display() {
        let err = RelayError::SegmentNotFound { sequence: 17 };
        assert_eq!(err.to_string(), "segment not found: seq=17");
    }
}
