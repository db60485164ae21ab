//! Circuit breaker for external provider calls
//!
//! Shared by the speech and generative clients: after a run of consecutive
//! failures against one provider, stop sending traffic for a cool-down
//! instead of queueing more doomed calls behind their timeouts.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, calls allowed
    Closed,
    /// Too many failures, calls rejected immediately
    Open,
    /// Cool-down elapsed, one probe call allowed
    HalfOpen,
}

/// Per-provider circuit breaker.
///
/// ```
/// use spar_core::breaker::CircuitBreaker;
///
/// let breaker = CircuitBreaker::new(3, 60_000);
/// breaker.record_failure();
/// breaker.record_failure();
/// breaker.record_failure();
/// assert!(!breaker.can_execute());
/// ```
pub struct CircuitBreaker {
    failures: AtomicU32,
    last_failure_ms: AtomicU64,
    threshold: u32,
    cooldown_ms: u64,
}

impl CircuitBreaker {
    /// `threshold` consecutive failures open the circuit; after
    /// `cooldown_ms` it allows one probe (half-open).
    pub fn new(threshold: u32, cooldown_ms: u64) -> Self {
        Self {
            failures: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            threshold: threshold.max(1),
            cooldown_ms,
        }
    }

    pub fn state(&self) -> BreakerState {
        let failures = self.failures.load(Ordering::Relaxed);
        if failures < self.threshold {
            return BreakerState::Closed;
        }

        let last = self.last_failure_ms.load(Ordering::Relaxed);
        let elapsed = now_ms().saturating_sub(last);
        if elapsed >= self.cooldown_ms {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    /// Resets the failure run.
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// `true` while closed or half-open (probe allowed).
    pub fn can_execute(&self) -> bool {
        self.state() != BreakerState::Open
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Milliseconds until the next probe is allowed; 0 unless open.
    pub fn retry_after_ms(&self) -> u64 {
        match self.state() {
            BreakerState::Open => {
                let last = self.last_failure_ms.load(Ordering::Relaxed);
                let elapsed = now_ms().saturating_sub(last);
                self.cooldown_ms.saturating_sub(elapsed)
            }
            _ => 0,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
