//! Runtime configuration of the scheduler and the workers.
//!
//! The binary fills these from the command line and the environment; the
//! library only sees the resolved values.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Largest number of objects in one task.
    pub max_batch_size: usize,
    /// Attempts a task gets before it fails permanently.
    pub max_task_attempts: u32,
    /// Attempts at resolving candidates before a job fails.
    pub max_dispatch_attempts: u32,
    pub dispatch_backoff_base: Duration,
    pub dispatch_backoff_cap: Duration,
    /// How often queued jobs are looked at.
    pub dispatch_interval: Duration,
    /// How often expired leases are reclaimed.
    pub sweep_interval: Duration,
    /// Longest blocking wait on the report queue.
    pub report_wait: Duration,
    /// Failed applications of one report before it is dropped and the task
    /// is left to lease expiry.
    pub max_report_deliveries: u32,
    pub report_retry_base: Duration,
    /// Jobs an owner may submit per day, 0 for unlimited.
    pub owner_quota: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            max_task_attempts: 3,
            max_dispatch_attempts: 5,
            dispatch_backoff_base: Duration::from_millis(150),
            dispatch_backoff_cap: Duration::from_secs(30),
            dispatch_interval: Duration::from_millis(250),
            sweep_interval: Duration::from_secs(1),
            report_wait: Duration::from_secs(1),
            max_report_deliveries: 5,
            report_retry_base: Duration::from_millis(150),
            owner_quota: 0,
        }
    }
}

impl SchedulerConfig {
    /// Delay before dispatch attempt `attempt + 1`, given `attempt` failures.
    ///
    /// Doubles from the base up to the cap; the caller adds jitter.
    pub fn dispatch_backoff(&self, attempt: u32) -> Duration {
        doubling(self.dispatch_backoff_base, self.dispatch_backoff_cap, attempt)
    }

    /// Delay before a report that failed to apply `deliveries` times goes
    /// back on the report queue.
    pub fn report_retry_backoff(&self, deliveries: u32) -> Duration {
        doubling(self.report_retry_base, self.dispatch_backoff_cap, deliveries)
    }
}

fn doubling(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Independent lease loops per worker process.
    pub concurrency: usize,
    pub lease_timeout: Duration,
    /// Longest blocking wait for a task to appear.
    pub lease_wait: Duration,
    /// Compiled queries kept before the cache is cleared.
    pub compiled_cache_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            lease_timeout: Duration::from_secs(30),
            lease_wait: Duration::from_secs(2),
            compiled_cache_size: 32,
        }
    }
}

impl WorkerConfig {
    /// Interval of the lease renewal sidecar.
    pub fn renew_interval(&self) -> Duration {
        (self.lease_timeout / 3).max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_backoff_doubles_up_to_cap() {
        let config = SchedulerConfig::default();

        assert_eq!(config.dispatch_backoff(1), Duration::from_millis(150));
        assert_eq!(config.dispatch_backoff(2), Duration::from_millis(300));
        assert_eq!(config.dispatch_backoff(3), Duration::from_millis(600));
        assert_eq!(config.dispatch_backoff(10), Duration::from_secs(30));
        assert_eq!(config.dispatch_backoff(64), Duration::from_secs(30));
    }

    #[test]
    fn test_renew_interval_is_a_third_of_the_lease() {
        let config = WorkerConfig::default();

        assert_eq!(config.renew_interval(), Duration::from_secs(10));
    }
}
