//! Scheduling arithmetic for crawl tasks.
//!
//! Two pure functions decide when a task runs next: one after success, scaled by
//! demand, one after failure, growing exponentially up to a cap.

use chrono::Duration;

use crate::config::{BackoffConfig, SuccessTier, MAX_DELAY_MINUTES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Sorted by `min_priority`, highest first
    tiers: Vec<SuccessTier>,
    idle_minutes: u64,
    base_minutes: u64,
    cap_minutes: u64,
    rate_limited_cap_minutes: u64,
}

impl BackoffPolicy {
    pub fn from_config(config: &BackoffConfig) -> Self {
        let mut tiers = config.success_tiers.clone();
        tiers.sort_by(|a, b| b.min_priority.cmp(&a.min_priority));

        Self {
            tiers,
            idle_minutes: config.idle_minutes,
            base_minutes: config.base_minutes,
            cap_minutes: config.cap_minutes,
            rate_limited_cap_minutes: config.rate_limited_cap_minutes.max(config.cap_minutes),
        }
    }

    /// Delay before re-running a task that just succeeded.
    pub fn success_interval(&self, priority: u32) -> Duration {
        let minutes = self
            .tiers
            .iter()
            .find(|tier| priority >= tier.min_priority)
            .map(|tier| tier.minutes)
            .unwrap_or(self.idle_minutes);
        minutes_to_duration(minutes)
    }

    /// `min(base * 2^failures, cap)` minutes.
    pub fn backoff_interval(&self, failures: u32) -> Duration {
        minutes_to_duration(exponential(self.base_minutes, failures, self.cap_minutes))
    }

    /// Throttled sites get one extra doubling and a wider cap.
    pub fn rate_limited_interval(&self, failures: u32) -> Duration {
        minutes_to_duration(exponential(
            self.base_minutes,
            failures.saturating_add(1),
            self.rate_limited_cap_minutes,
        ))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

fn exponential(base: u64, exponent: u32, cap: u64) -> u64 {
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    base.saturating_mul(factor).min(cap)
}

fn minutes_to_duration(minutes: u64) -> Duration {
    let minutes = minutes.min(MAX_DELAY_MINUTES);
    Duration::minutes(i64::try_from(minutes).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_tiers() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.success_interval(12), Duration::minutes(15));
        assert_eq!(policy.success_interval(10), Duration::minutes(15));
        assert_eq!(policy.success_interval(6), Duration::minutes(30));
        assert_eq!(policy.success_interval(5), Duration::minutes(30));
        assert_eq!(policy.success_interval(3), Duration::minutes(60));
        assert_eq!(policy.success_interval(2), Duration::minutes(60));
        assert_eq!(policy.success_interval(1), Duration::minutes(120));
        assert_eq!(policy.success_interval(0), Duration::minutes(120));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy::default();
        let delays: Vec<i64> = (1..=6)
            .map(|n| policy.backoff_interval(n).num_minutes())
            .collect();

        assert_eq!(delays, vec![10, 20, 40, 80, 120, 120]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|&d| d <= 120));
    }

    #[test]
    fn backoff_survives_huge_failure_counts() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.backoff_interval(64), Duration::minutes(120));
        assert_eq!(policy.backoff_interval(u32::MAX), Duration::minutes(120));
    }

    #[test]
    fn rate_limited_backoff_is_wider() {
        let policy = BackoffPolicy::default();
        for n in 1..=8 {
            assert!(policy.rate_limited_interval(n) >= policy.backoff_interval(n));
        }
        assert_eq!(policy.rate_limited_interval(1), Duration::minutes(20));
        assert_eq!(policy.rate_limited_interval(10), Duration::minutes(240));
    }

    #[test]
    fn oversized_config_cannot_overflow_timestamps() {
        let config = BackoffConfig {
            success_tiers: vec![SuccessTier { min_priority: 0, minutes: u64::MAX }],
            idle_minutes: u64::MAX,
            base_minutes: u64::MAX,
            cap_minutes: u64::MAX,
            rate_limited_cap_minutes: u64::MAX,
        };
        let policy = BackoffPolicy::from_config(&config);
        let now = chrono::Utc::now();

        let longest = Duration::minutes(MAX_DELAY_MINUTES as i64);
        assert_eq!(policy.success_interval(0), longest);
        assert_eq!(policy.backoff_interval(3), longest);
        assert!(now.checked_add_signed(policy.rate_limited_interval(u32::MAX)).is_some());
    }

    #[test]
    fn tiers_are_sorted_regardless_of_config_order() {
        let config = BackoffConfig {
            success_tiers: vec![
                SuccessTier { min_priority: 2, minutes: 60 },
                SuccessTier { min_priority: 10, minutes: 15 },
            ],
            ..BackoffConfig::default()
        };
        let policy = BackoffPolicy::from_config(&config);
        assert_eq!(policy.success_interval(11), Duration::minutes(15));
        assert_eq!(policy.success_interval(4), Duration::minutes(60));
    }
}
