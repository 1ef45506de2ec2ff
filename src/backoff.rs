//! Per-pod retry backoff.
//!
//! A pod that failed to answer is left out of the following cycles until its
//! delay elapses. The delay doubles with each consecutive failure, starting at
//! five seconds and capped at the configured maximum.
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

const BASE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct Entry {
    failures: u32,
    retry_at: Instant,
}

#[derive(Debug)]
pub struct PodBackoff {
    max_delay: Duration,
    entries: HashMap<i64, Entry>,
}

impl PodBackoff {
    /// A zero `max_delay` disables backoff.
    pub fn new(max_delay: Duration) -> Self {
        Self {
            max_delay,
            entries: HashMap::new(),
        }
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(10);
        (BASE_DELAY * (1_u32 << exp)).min(self.max_delay)
    }

    /// Records a failed dispatch and returns the delay before the next try.
    pub fn record_failure(&mut self, pod_id: i64, now: Instant) -> Duration {
        if self.max_delay.is_zero() {
            return Duration::ZERO;
        }
        let failures = self
            .entries
            .get(&pod_id)
            .map_or(1, |e| e.failures.saturating_add(1));
        let delay = self.delay_for(failures);
        self.entries.insert(
            pod_id,
            Entry {
                failures,
                retry_at: now + delay,
            },
        );
        delay
    }

    pub fn record_success(&mut self, pod_id: i64) {
        self.entries.remove(&pod_id);
    }

    /// Pods that must not be contacted at `now`, sorted.
    pub fn blocked(&self, now: Instant) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.retry_at > now)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn failures(&self, pod_id: i64) -> u32 {
        self.entries.get(&pod_id).map_or(0, |e| e.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        let backoff = PodBackoff::new(Duration::from_secs(60));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(40));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn failure_blocks_until_delay_elapsed() {
        let mut backoff = PodBackoff::new(Duration::from_secs(3600));
        let now = Instant::now();
        assert_eq!(backoff.record_failure(7, now), Duration::from_secs(5));
        assert_eq!(backoff.record_failure(7, now), Duration::from_secs(10));
        assert_eq!(backoff.failures(7), 2);

        assert_eq!(backoff.blocked(now), vec![7]);
        assert!(backoff.blocked(now + Duration::from_secs(10)).is_empty());

        backoff.record_success(7);
        assert_eq!(backoff.failures(7), 0);
        assert!(backoff.blocked(now).is_empty());
    }

    #[test]
    fn zero_max_delay_disables_backoff() {
        let mut backoff = PodBackoff::new(Duration::ZERO);
        let now = Instant::now();
        assert_eq!(backoff.record_failure(1, now), Duration::ZERO);
        assert!(backoff.blocked(now).is_empty());
    }
}
