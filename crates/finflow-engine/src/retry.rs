use std::time::Duration;

use finflow_core::definition::RetryPolicy;

/// Delay to wait after failed attempt `attempt` (1-based) before the next one.
///
/// `base * multiplier^(attempt - 1)`, clamped to the policy's cap if it has
/// one, then scaled by 0.8x..1.2x when jitter is on.
pub fn calculate_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let mut ms = policy.backoff_base_ms as f64 * policy.backoff_multiplier.powi(exponent);
    if let Some(cap) = policy.max_backoff_ms {
        ms = ms.min(cap as f64);
    }
    if !ms.is_finite() {
        ms = u64::MAX as f64;
    }
    if policy.jitter {
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        ms *= jitter;
    }
    Duration::from_millis(ms.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_geometrically() {
        let policy = RetryPolicy::new(5)
            .with_backoff(Duration::from_millis(100), 2.0)
            .with_max_backoff(None);
        assert_eq!(calculate_backoff(&policy, 1), Duration::from_millis(100));
        assert_eq!(calculate_backoff(&policy, 2), Duration::from_millis(200));
        assert_eq!(calculate_backoff(&policy, 3), Duration::from_millis(400));
        assert_eq!(calculate_backoff(&policy, 4), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(10)
            .with_backoff(Duration::from_millis(1000), 3.0)
            .with_max_backoff(Some(Duration::from_millis(5000)));
        assert_eq!(calculate_backoff(&policy, 2), Duration::from_millis(3000));
        assert_eq!(calculate_backoff(&policy, 3), Duration::from_millis(5000));
        assert_eq!(calculate_backoff(&policy, 9), Duration::from_millis(5000));
    }

    #[test]
    fn test_default_policy_delays_strictly_increase() {
        let policy = RetryPolicy::new(12);
        let delays: Vec<Duration> = (1..policy.max_attempts)
            .map(|attempt| calculate_backoff(&policy, attempt))
            .collect();
        assert_eq!(delays[0], Duration::from_millis(1000));
        for pair in delays.windows(2) {
            assert!(pair[1] > pair[0], "delays stopped growing: {delays:?}");
        }
    }

    #[test]
    fn test_constant_backoff_with_unit_multiplier() {
        let policy = RetryPolicy::new(4).with_backoff(Duration::from_millis(50), 1.0);
        for attempt in 1..4 {
            assert_eq!(calculate_backoff(&policy, attempt), Duration::from_millis(50));
        }
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(3)
            .with_backoff(Duration::from_millis(1000), 2.0)
            .with_jitter(true);
        for _ in 0..50 {
            let ms = calculate_backoff(&policy, 1).as_millis();
            assert!((800..=1200).contains(&ms), "jittered backoff {ms} out of range");
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::new(u32::MAX).with_max_backoff(None);
        let _ = calculate_backoff(&policy, u32::MAX);
    }
}
