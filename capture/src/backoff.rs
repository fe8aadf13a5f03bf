//! Reconnect backoff
//!
//! Consecutive capture failures are counted; each one below the bound earns a
//! reconnect attempt after an exponentially growing delay. Reaching the bound
//! is fatal for the capture loop.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnection configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Base delay for exponential backoff
    pub base_delay_ms: u64,
    /// Maximum delay cap
    pub max_delay_ms: u64,
    /// Consecutive failures that end the capture loop
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 32_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.base_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);

        2u32.checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| base.checked_mul(factor))
            .unwrap_or(max)
            .min(max)
    }
}

/// Outcome of recording one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait `delay`, then reconnect
    Retry { attempt: u32, delay: Duration },
    /// The bound was reached; no further recovery
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ReconnectAttemptCounter {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectAttemptCounter {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn record_failure(&mut self) -> Backoff {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.policy.max_attempts {
            Backoff::Exhausted {
                attempts: self.attempts,
            }
        } else {
            Backoff::Retry {
                attempt: self.attempts,
                delay: self.policy.delay_for(self.attempts),
            }
        }
    }

    /// Called after every successful frame
    pub fn reset(&mut self) {
        if self.attempts > 0 {
            tracing::debug!("Reconnect counter reset after {} failures", self.attempts);
        }
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 32, 32]);
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
    }

    #[test]
    fn test_delays_monotonic_and_capped() {
        let policy = ReconnectPolicy {
            base_delay_ms: 300,
            max_delay_ms: 5_000,
            max_attempts: 40,
        };
        let mut prev = Duration::ZERO;
        for n in 1..=40 {
            let d = policy.delay_for(n);
            assert!(d >= prev);
            assert!(d <= Duration::from_millis(5_000));
            prev = d;
        }
    }

    #[test]
    fn test_counter_exhausts_on_bound() {
        let mut counter = ReconnectAttemptCounter::new(ReconnectPolicy::default());
        for n in 1..=4 {
            assert_eq!(
                counter.record_failure(),
                Backoff::Retry {
                    attempt: n,
                    delay: Duration::from_secs(1 << n)
                }
            );
        }
        assert_eq!(counter.record_failure(), Backoff::Exhausted { attempts: 5 });
    }

    #[test]
    fn test_counter_resets() {
        let mut counter = ReconnectAttemptCounter::new(ReconnectPolicy::default());
        counter.record_failure();
        counter.record_failure();
        counter.reset();
        assert_eq!(counter.attempts(), 0);
        assert!(matches!(counter.record_failure(), Backoff::Retry { attempt: 1, .. }));
    }
}
