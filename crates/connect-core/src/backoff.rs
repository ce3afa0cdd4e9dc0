//! Reconnect backoff policy
//!
//! Maps a relay disconnect code to a human readable reason and a randomized
//! retry delay. The policy is pure: the only input besides the code is the
//! random source used for jitter.
//!
//! | code     | meaning                          | retry      |
//! |----------|----------------------------------|------------|
//! | 5, 6     | local side disconnected itself   | 10s – 60s  |
//! | 12       | relay restarting                 | 10s – 60s  |
//! | 401      | credential rejected              | none       |
//! | 426      | protocol/version too old         | none       |
//! | 429      | rate limited                     | 15s – 45s  |
//! | 500, 503 | relay error / unreachable        | 45s – 75s  |
//! | other    | unspecified                      | 45s – 75s  |

use rand::Rng;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Credential rejected by the relay
pub const CODE_UNAUTHORIZED: u16 = 401;

/// Software version rejected by the relay
pub const CODE_UPGRADE_REQUIRED: u16 = 426;

/// Code used when a transport failure carries no relay code
pub const CODE_UNKNOWN: u16 = 0;

const LOCAL_RESTART_MS: RangeInclusive<u64> = 10_000..=60_000;
const RATE_LIMITED_MS: RangeInclusive<u64> = 15_000..=45_000;
const RELAY_FAILURE_MS: RangeInclusive<u64> = 45_000..=75_000;

/// Outcome of a backoff decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffDecision {
    /// Human readable reason for the disconnect
    pub reason: String,
    /// Delay before reconnecting; `None` means do not reconnect
    pub retry_after: Option<Duration>,
}

impl BackoffDecision {
    /// Whether a reconnect should be scheduled
    pub fn should_retry(&self) -> bool {
        self.retry_after.is_some()
    }
}

/// Disconnect-code keyed backoff policy
#[derive(Debug, Clone, Copy, Default)]
pub struct BackoffPolicy;

impl BackoffPolicy {
    /// Create the policy
    pub fn new() -> Self {
        Self
    }

    /// Decide how to react to a disconnect, using the thread RNG for jitter
    pub fn decide(&self, code: u16, reason: &str) -> BackoffDecision {
        self.decide_with(code, reason, &mut rand::thread_rng())
    }

    /// Decide how to react to a disconnect with an explicit random source
    pub fn decide_with<R: Rng>(
        &self,
        code: u16,
        reason: &str,
        rng: &mut R,
    ) -> BackoffDecision {
        let (label, window) = match code {
            // 5 and 6 are reported identically by the relay
            5 | 6 => ("Connection closed by this agent", Some(LOCAL_RESTART_MS)),
            12 => ("Relay is restarting", Some(LOCAL_RESTART_MS)),
            CODE_UNAUTHORIZED => ("API key rejected by relay", None),
            CODE_UPGRADE_REQUIRED => (
                "Agent version is too old for the relay; update and restart",
                None,
            ),
            429 => ("Rate limited by relay", Some(RATE_LIMITED_MS)),
            500 => ("Relay internal error", Some(RELAY_FAILURE_MS)),
            503 => ("Relay unreachable", Some(RELAY_FAILURE_MS)),
            _ => ("Unexpected disconnect", Some(RELAY_FAILURE_MS)),
        };

        let reason = if reason.trim().is_empty() {
            label.to_string()
        } else {
            format!("{}: {}", label, reason.trim())
        };

        BackoffDecision {
            reason,
            retry_after: window.map(|ms| Duration::from_millis(rng.gen_range(ms))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn assert_window(code: u16, min_ms: u64, max_ms: u64) {
        let policy = BackoffPolicy::new();
        let mut rng = StdRng::seed_from_u64(u64::from(code));
        for _ in 0..500 {
            let decision = policy.decide_with(code, "", &mut rng);
            let delay = decision
                .retry_after
                .unwrap_or_else(|| panic!("code {} should retry", code));
            let ms = delay.as_millis() as u64;
            assert!(
                (min_ms..=max_ms).contains(&ms),
                "code {} produced {}ms outside {}..={}",
                code,
                ms,
                min_ms,
                max_ms
            );
        }
    }

    #[test]
    fn local_and_restart_codes_use_short_window() {
        assert_window(5, 10_000, 60_000);
        assert_window(6, 10_000, 60_000);
        assert_window(12, 10_000, 60_000);
    }

    #[test]
    fn rate_limit_window() {
        assert_window(429, 15_000, 45_000);
    }

    #[test]
    fn relay_failures_and_unknown_codes_use_long_window() {
        assert_window(500, 45_000, 75_000);
        assert_window(503, 45_000, 75_000);
        assert_window(CODE_UNKNOWN, 45_000, 75_000);
        assert_window(1006, 45_000, 75_000);
    }

    #[test]
    fn auth_and_version_codes_never_retry() {
        let policy = BackoffPolicy::new();
        assert!(!policy.decide(CODE_UNAUTHORIZED, "").should_retry());
        assert!(!policy.decide(CODE_UPGRADE_REQUIRED, "").should_retry());
    }

    #[test]
    fn codes_5_and_6_share_reason() {
        let policy = BackoffPolicy::new();
        assert_eq!(policy.decide(5, "").reason, policy.decide(6, "").reason);
    }

    #[test]
    fn relay_reason_is_appended() {
        let decision = BackoffPolicy::new().decide(503, "maintenance");
        assert_eq!(decision.reason, "Relay unreachable: maintenance");
    }

    #[test]
    fn jitter_spreads_delays() {
        let policy = BackoffPolicy::new();
        let mut rng = StdRng::seed_from_u64(7);
        let delays: std::collections::HashSet<_> = (0..20)
            .map(|_| policy.decide_with(429, "", &mut rng).retry_after)
            .collect();
        assert!(delays.len() > 1);
    }
}
