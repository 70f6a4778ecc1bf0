use std::time::Duration;

use nola_core::rfc3339_from_now;

/// Retry timing policy, applied identically on every failure path —
/// explicit `fail` calls and reaper-driven timeout reclaims.
///
/// The attempt ceiling itself is per task (`max_attempts`, fixed at
/// enqueue) and is enforced inside the store's single failure transition;
/// the policy only decides *when* a requeued task becomes eligible again.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    /// Delay before a requeued task is claimable again. None = immediately
    /// eligible (the default).
    pub retry_delay: Option<Duration>,
}

impl RetryPolicy {
    /// Requeued tasks are immediately eligible.
    pub fn immediate() -> Self {
        Self { retry_delay: None }
    }

    /// Requeued tasks wait `delay` before becoming eligible.
    pub fn delayed(delay: Duration) -> Self {
        Self {
            retry_delay: Some(delay),
        }
    }

    /// The `not_before` value for a requeue happening now.
    pub fn next_not_before(&self) -> Option<String> {
        self.retry_delay
            .map(|d| rfc3339_from_now(d.as_secs() as i64))
    }
}
