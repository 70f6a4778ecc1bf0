use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use nola_core::{ListResult, ServiceError, new_id, now_rfc3339, rfc3339_from_now};

use crate::model::{Task, TaskListQuery, TaskStatus};
use crate::retry::RetryPolicy;
use crate::store::{FailOutcome, TaskStore};

/// Allowed priority range for enqueue.
pub const MIN_PRIORITY: i64 = -100;
pub const MAX_PRIORITY: i64 = 100;

/// Allowed max_attempts range for enqueue.
pub const MIN_ATTEMPTS: i64 = 1;
pub const MAX_ATTEMPTS: i64 = 100;

/// Queue engine configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Attempt ceiling applied when enqueue does not specify one.
    pub default_max_attempts: i64,
    /// Retry timing policy applied on every requeue.
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            retry: RetryPolicy::immediate(),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskQueue — the queue engine
// ---------------------------------------------------------------------------

/// The core queue engine.
///
/// This is a **state machine**, not an executor. It:
/// - Persists the task lifecycle in SQL.
/// - Grants claims atomically (at most one active worker per task).
/// - Tracks claim liveness through heartbeats.
/// - Applies the retry/poison-pill policy on every failure path.
/// - Wakes idle workers when tasks become claimable.
///
/// The engine never retries its own calls: every mutation is a conditional
/// single statement that either applies or affects nothing, so a transient
/// storage error can simply be retried by the caller.
pub struct TaskQueue {
    store: Arc<TaskStore>,
    config: QueueConfig,
    /// Notified when a task becomes claimable (enqueue or requeue).
    notify: Arc<Notify>,
}

impl TaskQueue {
    /// Create a new engine backed by the given store.
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self::with_config(store, QueueConfig::default())
    }

    /// Create with explicit configuration.
    pub fn with_config(store: Arc<TaskStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Notify handle — workers wait on this while the queue is empty.
    pub fn notify(&self) -> &Arc<Notify> {
        &self.notify
    }

    // =======================================================================
    // Producer-facing
    // =======================================================================

    /// Enqueue a new transcription task.
    ///
    /// `options` is opaque to the queue. `priority` and `max_attempts`
    /// fall back to defaults when unspecified; out-of-range values are
    /// rejected before anything is persisted. A `file_id` with no file
    /// record is rejected by the store's referential check.
    pub fn enqueue(
        &self,
        file_id: &str,
        options: serde_json::Value,
        priority: Option<i64>,
        max_attempts: Option<i64>,
    ) -> Result<Task, ServiceError> {
        let priority = priority.unwrap_or(0);
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(ServiceError::Validation(format!(
                "priority {priority} out of range [{MIN_PRIORITY}, {MAX_PRIORITY}]"
            )));
        }

        let max_attempts = max_attempts.unwrap_or(self.config.default_max_attempts);
        if !(MIN_ATTEMPTS..=MAX_ATTEMPTS).contains(&max_attempts) {
            return Err(ServiceError::Validation(format!(
                "max_attempts {max_attempts} out of range [{MIN_ATTEMPTS}, {MAX_ATTEMPTS}]"
            )));
        }

        let now = now_rfc3339();
        let task = Task {
            id: new_id(),
            file_id: file_id.to_string(),
            options,
            priority,
            status: TaskStatus::Pending,
            attempt_count: 0,
            max_attempts,
            claimed_by: None,
            heartbeat_at: None,
            not_before: None,
            progress: 0.0,
            result: None,
            error: None,
            created_at: now.clone(),
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        self.store.insert(&task)?;
        info!(task_id = %task.id, file_id = %file_id, priority, "task enqueued");

        self.notify.notify_one();
        Ok(task)
    }

    // =======================================================================
    // Worker-facing
    // =======================================================================

    /// Claim the next eligible task for `worker_id`.
    ///
    /// Atomic: under concurrent callers each pending task is granted to at
    /// most one of them. Returns None when nothing is eligible — losing a
    /// race is not an error.
    pub fn claim(&self, worker_id: &str) -> Result<Option<Task>, ServiceError> {
        let now = now_rfc3339();
        let claimed = self.store.claim_next(worker_id, &now)?;
        if let Some(task) = &claimed {
            info!(
                task_id = %task.id,
                worker_id = %worker_id,
                attempt = task.attempt_count,
                "task claimed"
            );
        } else {
            debug!(worker_id = %worker_id, "no eligible task");
        }
        Ok(claimed)
    }

    /// Refresh the claim's heartbeat, optionally reporting progress.
    ///
    /// Returns false if the claim was already lost (e.g. reclaimed by the
    /// reaper). The worker must treat false as "stop working, the claim is
    /// void" — not as something to retry.
    pub fn heartbeat(
        &self,
        task_id: &str,
        worker_id: &str,
        progress: Option<f64>,
    ) -> Result<bool, ServiceError> {
        let now = now_rfc3339();
        let alive = self.store.heartbeat(task_id, worker_id, progress, &now)?;
        if !alive {
            debug!(task_id = %task_id, worker_id = %worker_id, "heartbeat on lost claim");
        }
        Ok(alive)
    }

    /// Report success, storing the engine result.
    ///
    /// Valid only from a claim held by `worker_id`; otherwise the call
    /// changes nothing and surfaces a stale-claim error so the caller
    /// knows its work may already be discarded.
    pub fn complete(
        &self,
        task_id: &str,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Task, ServiceError> {
        let now = now_rfc3339();
        if !self.store.complete(task_id, worker_id, &result, &now)? {
            return Err(ServiceError::StaleClaim(format!(
                "task {task_id} is not claimed by {worker_id}"
            )));
        }
        info!(task_id = %task_id, worker_id = %worker_id, "task completed");
        self.store.get(task_id)
    }

    /// Report failure, applying the retry policy.
    ///
    /// Requeues the task if attempts remain, dead-letters it otherwise.
    /// Stale claims surface as an error and change nothing.
    pub fn fail(
        &self,
        task_id: &str,
        worker_id: &str,
        error: &str,
    ) -> Result<Task, ServiceError> {
        let now = now_rfc3339();
        let not_before = self.config.retry.next_not_before();
        let outcome =
            self.store
                .fail_task(task_id, worker_id, None, error, not_before.as_deref(), &now)?;

        match outcome {
            FailOutcome::Requeued => {
                info!(task_id = %task_id, worker_id = %worker_id, error, "task requeued");
                self.notify.notify_one();
            }
            FailOutcome::Dead => {
                warn!(task_id = %task_id, worker_id = %worker_id, error, "task dead-lettered");
            }
            FailOutcome::Stale => {
                return Err(ServiceError::StaleClaim(format!(
                    "task {task_id} is not claimed by {worker_id}"
                )));
            }
        }
        self.store.get(task_id)
    }

    /// Report a failure that cannot succeed on retry (e.g. the input file
    /// vanished from disk). Terminal `failed`, bypassing the retry policy.
    pub fn fail_fatal(
        &self,
        task_id: &str,
        worker_id: &str,
        error: &str,
    ) -> Result<Task, ServiceError> {
        let now = now_rfc3339();
        if !self.store.fail_fatal(task_id, worker_id, error, &now)? {
            return Err(ServiceError::StaleClaim(format!(
                "task {task_id} is not claimed by {worker_id}"
            )));
        }
        warn!(task_id = %task_id, worker_id = %worker_id, error, "task failed (non-retryable)");
        self.store.get(task_id)
    }

    // =======================================================================
    // Reaper entry point
    // =======================================================================

    /// Reclaim claimed tasks whose heartbeat is older than
    /// `stale_timeout_secs`. Returns the number of tasks acted on.
    ///
    /// Each reclaim goes through the same retry-policy-guarded transition
    /// as an explicit `fail`, with the heartbeat value the sweep read as
    /// an optimistic guard: a worker that heartbeats between the scan and
    /// the action keeps its claim.
    pub fn reap_stale(&self, stale_timeout_secs: i64) -> Result<u32, ServiceError> {
        let cutoff = rfc3339_from_now(-stale_timeout_secs);
        let stale = self.store.stale_claims(&cutoff)?;
        let mut count = 0u32;

        for task in stale {
            // Both read under the claimed predicate; present unless the
            // row changed since the scan, in which case the guard below
            // misses anyway.
            let (Some(worker_id), Some(heartbeat_at)) = (&task.claimed_by, &task.heartbeat_at)
            else {
                continue;
            };

            let now = now_rfc3339();
            let not_before = self.config.retry.next_not_before();
            let outcome = self.store.fail_task(
                &task.id,
                worker_id,
                Some(heartbeat_at),
                "heartbeat timeout",
                not_before.as_deref(),
                &now,
            )?;

            match outcome {
                FailOutcome::Requeued => {
                    warn!(task_id = %task.id, worker_id = %worker_id, "stale claim requeued");
                    self.notify.notify_one();
                    count += 1;
                }
                FailOutcome::Dead => {
                    warn!(task_id = %task.id, worker_id = %worker_id, "stale claim dead-lettered");
                    count += 1;
                }
                FailOutcome::Stale => {
                    // The worker came back (or the task moved on) between
                    // scan and act. Leave it alone.
                    debug!(task_id = %task.id, "stale candidate recovered, skipped");
                }
            }
        }

        Ok(count)
    }

    // =======================================================================
    // Query
    // =======================================================================

    /// Get a single task by ID.
    pub fn get(&self, task_id: &str) -> Result<Task, ServiceError> {
        self.store.get(task_id)
    }

    /// List tasks with optional filters.
    pub fn list(&self, query: &TaskListQuery) -> Result<ListResult<Task>, ServiceError> {
        self.store.list(query)
    }

    /// Count tasks, optionally by status.
    pub fn count(&self, status: Option<TaskStatus>) -> Result<u64, ServiceError> {
        self.store.count(status)
    }
}
