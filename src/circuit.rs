//! Per-URL circuit breakers
//!
//! Failing upstreams are cut off quickly instead of being re-dialled on
//! every client request. A breaker opens after a run of failures, stays
//! open for a cooldown and then lets one probe request through.

use dashmap::DashMap;
use std::time::{Duration, Instant};

const FAILURE_THRESHOLD: u32 = 3;
const COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            opened_at: None,
        }
    }
}

/// Registry of breakers keyed by upstream URL.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Breaker>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a connection attempt to `url` may proceed right now.
    pub fn allow(&self, url: &str) -> bool {
        let mut entry = self.breakers.entry(url.to_string()).or_insert_with(Breaker::new);
        match entry.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let cooled = entry
                    .opened_at
                    .map(|at| at.elapsed() >= COOLDOWN)
                    .unwrap_or(true);
                if cooled {
                    entry.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, url: &str) {
        if let Some(mut entry) = self.breakers.get_mut(url) {
            entry.state = BreakerState::Closed;
            entry.failures = 0;
            entry.opened_at = None;
        }
    }

    pub fn record_failure(&self, url: &str) {
        let mut entry = self.breakers.entry(url.to_string()).or_insert_with(Breaker::new);
        entry.failures += 1;
        if entry.failures >= FAILURE_THRESHOLD || entry.state == BreakerState::HalfOpen {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(Instant::now());
            tracing::warn!(url, failures = entry.failures, "circuit breaker opened");
        }
    }
}
