use std::sync::Arc;

use nola_core::{ListResult, ServiceError};
use nola_sql::{Row, SQLError, SQLStore, Value};

use crate::model::{Task, TaskListQuery, TaskStatus};

/// SQL schema for the tasks table. All task fields are real columns so the
/// claim statement can mutate and return them in one step.
const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS tasks (
    id            TEXT PRIMARY KEY,
    file_id       TEXT NOT NULL,
    options       TEXT NOT NULL,
    priority      INTEGER NOT NULL DEFAULT 0,
    status        TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts  INTEGER NOT NULL DEFAULT 3,
    claimed_by    TEXT,
    heartbeat_at  TEXT,
    not_before    TEXT,
    progress      REAL NOT NULL DEFAULT 0.0,
    result        TEXT,
    error         TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    started_at    TEXT,
    completed_at  TEXT,
    FOREIGN KEY (file_id) REFERENCES files(id)
)";

/// Covering index for the claim scan: eligible tasks in claim order.
const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_queue ON tasks(status, priority DESC, created_at ASC)",
    "CREATE INDEX IF NOT EXISTS idx_worker ON tasks(claimed_by)",
    "CREATE INDEX IF NOT EXISTS idx_heartbeat ON tasks(heartbeat_at)",
];

/// Outcome of the shared failure transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Retries remained; the task is pending again.
    Requeued,
    /// Attempts exhausted; the task is dead-lettered.
    Dead,
    /// The guard did not match — the claim was already lost and nothing
    /// was changed.
    Stale,
}

/// Persistent storage for tasks, backed by SQLStore (SQLite).
///
/// Every mutation is a single conditional statement guarded by the current
/// `status`/`claimed_by`, so concurrent callers either win the row or
/// affect nothing. Nothing here ever deletes a task; terminal states are
/// final and inert.
pub struct TaskStore {
    db: Arc<dyn SQLStore>,
}

impl TaskStore {
    /// Create a new TaskStore and initialise the schema.
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        db.exec(SCHEMA, &[])
            .map_err(|e| ServiceError::Storage(format!("task schema init: {e}")))?;
        for index in INDEXES {
            db.exec(index, &[])
                .map_err(|e| ServiceError::Storage(format!("task schema init: {e}")))?;
        }
        Ok(Self { db })
    }

    // -----------------------------------------------------------------------
    // Insert / read
    // -----------------------------------------------------------------------

    /// Insert a new task. A dangling `file_id` is rejected by the foreign
    /// key and surfaces as a referential error.
    pub fn insert(&self, task: &Task) -> Result<(), ServiceError> {
        let options = serde_json::to_string(&task.options)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        self.db
            .exec(
                "INSERT INTO tasks (id, file_id, options, priority, status, attempt_count, \
                 max_attempts, not_before, progress, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                &[
                    Value::Text(task.id.clone()),
                    Value::Text(task.file_id.clone()),
                    Value::Text(options),
                    Value::Integer(task.priority),
                    Value::Text(task.status.as_str().to_string()),
                    Value::Integer(task.attempt_count),
                    Value::Integer(task.max_attempts),
                    Value::opt_text(task.not_before.as_deref()),
                    Value::Real(task.progress),
                    Value::Text(task.created_at.clone()),
                    Value::Text(task.updated_at.clone()),
                ],
            )
            .map_err(|e| match e {
                SQLError::Constraint(_) => {
                    ServiceError::Referential(format!("file {} does not exist", task.file_id))
                }
                other => ServiceError::Storage(other.to_string()),
            })?;

        Ok(())
    }

    /// Get a task by ID.
    pub fn get(&self, id: &str) -> Result<Task, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT * FROM tasks WHERE id = ?1",
                &[Value::Text(id.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let row = rows
            .first()
            .ok_or_else(|| ServiceError::NotFound(format!("task {id}")))?;

        row_to_task(row)
    }

    // -----------------------------------------------------------------------
    // Claim — the atomic dequeue
    // -----------------------------------------------------------------------

    /// Atomically claim the next eligible task for `worker_id`.
    ///
    /// One statement selects the highest-priority pending task (FIFO by
    /// `created_at` among equals, `not_before` honored), marks it claimed,
    /// increments `attempt_count`, and returns the updated row. Under
    /// concurrent callers each pending task is granted to at most one of
    /// them; losers simply get None.
    pub fn claim_next(&self, worker_id: &str, now: &str) -> Result<Option<Task>, ServiceError> {
        let rows = self
            .db
            .query(
                "UPDATE tasks \
                 SET status = 'claimed', claimed_by = ?1, heartbeat_at = ?2, \
                     started_at = ?2, updated_at = ?2, \
                     attempt_count = attempt_count + 1 \
                 WHERE id IN ( \
                     SELECT id FROM tasks \
                     WHERE status = 'pending' \
                       AND (not_before IS NULL OR not_before <= ?2) \
                     ORDER BY priority DESC, created_at ASC \
                     LIMIT 1 \
                 ) \
                 RETURNING *",
                &[
                    Value::Text(worker_id.to_string()),
                    Value::Text(now.to_string()),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        match rows.first() {
            Some(row) => Ok(Some(row_to_task(row)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Liveness / completion
    // -----------------------------------------------------------------------

    /// Refresh the heartbeat (and optionally progress) for a claim.
    ///
    /// Returns false if the task is no longer claimed by `worker_id` — the
    /// claim is void and the worker must stop.
    pub fn heartbeat(
        &self,
        id: &str,
        worker_id: &str,
        progress: Option<f64>,
        now: &str,
    ) -> Result<bool, ServiceError> {
        let affected = self
            .db
            .exec(
                "UPDATE tasks \
                 SET heartbeat_at = ?1, progress = COALESCE(?2, progress), updated_at = ?1 \
                 WHERE id = ?3 AND status = 'claimed' AND claimed_by = ?4",
                &[
                    Value::Text(now.to_string()),
                    match progress {
                        Some(p) => Value::Real(p),
                        None => Value::Null,
                    },
                    Value::Text(id.to_string()),
                    Value::Text(worker_id.to_string()),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        Ok(affected > 0)
    }

    /// Transition a claim to completed, storing the result. Returns false
    /// if the claim no longer matched (stale).
    pub fn complete(
        &self,
        id: &str,
        worker_id: &str,
        result: &serde_json::Value,
        now: &str,
    ) -> Result<bool, ServiceError> {
        let result = serde_json::to_string(result)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        let affected = self
            .db
            .exec(
                "UPDATE tasks \
                 SET status = 'completed', result = ?1, progress = 100.0, \
                     claimed_by = NULL, heartbeat_at = NULL, \
                     completed_at = ?2, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'claimed' AND claimed_by = ?4",
                &[
                    Value::Text(result),
                    Value::Text(now.to_string()),
                    Value::Text(id.to_string()),
                    Value::Text(worker_id.to_string()),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Failure — the single retry-policy-guarded transition
    // -----------------------------------------------------------------------

    /// Apply a failure to a claim held by `worker_id`.
    ///
    /// This is the one code path for both explicit `fail` calls and
    /// reaper-driven timeout reclaims, so the poison-pill bound is applied
    /// uniformly. Two conditional statements:
    ///
    /// 1. Requeue to pending — only if `attempt_count < max_attempts`.
    /// 2. Otherwise dead-letter — only if the claim still matches.
    ///
    /// `heartbeat_guard` is the optimistic guard for the reaper: the
    /// transition only applies if `heartbeat_at` still equals the value the
    /// sweep read, so a worker that heartbeats between scan and act keeps
    /// its claim.
    pub fn fail_task(
        &self,
        id: &str,
        worker_id: &str,
        heartbeat_guard: Option<&str>,
        error: &str,
        not_before: Option<&str>,
        now: &str,
    ) -> Result<FailOutcome, ServiceError> {
        let guard_sql = match heartbeat_guard {
            Some(_) => " AND heartbeat_at = ?6",
            None => "",
        };

        let mut params = vec![
            Value::opt_text(not_before),
            Value::Text(error.to_string()),
            Value::Text(now.to_string()),
            Value::Text(id.to_string()),
            Value::Text(worker_id.to_string()),
        ];
        if let Some(hb) = heartbeat_guard {
            params.push(Value::Text(hb.to_string()));
        }

        // 1. Requeue if retries remain.
        let requeue_sql = format!(
            "UPDATE tasks \
             SET status = 'pending', claimed_by = NULL, heartbeat_at = NULL, \
                 started_at = NULL, not_before = ?1, error = ?2, updated_at = ?3 \
             WHERE id = ?4 AND status = 'claimed' AND claimed_by = ?5{guard_sql} \
               AND attempt_count < max_attempts"
        );
        let affected = self
            .db
            .exec(&requeue_sql, &params)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        if affected > 0 {
            return Ok(FailOutcome::Requeued);
        }

        // 2. Attempts exhausted (or the requeue guard missed because of
        //    it) — dead-letter under the same claim guard.
        let guard_sql = match heartbeat_guard {
            Some(_) => " AND heartbeat_at = ?5",
            None => "",
        };
        let mut params = vec![
            Value::Text(error.to_string()),
            Value::Text(now.to_string()),
            Value::Text(id.to_string()),
            Value::Text(worker_id.to_string()),
        ];
        if let Some(hb) = heartbeat_guard {
            params.push(Value::Text(hb.to_string()));
        }
        let dead_sql = format!(
            "UPDATE tasks \
             SET status = 'dead', claimed_by = NULL, heartbeat_at = NULL, \
                 error = ?1, completed_at = ?2, updated_at = ?2 \
             WHERE id = ?3 AND status = 'claimed' AND claimed_by = ?4{guard_sql}"
        );
        let affected = self
            .db
            .exec(&dead_sql, &params)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        if affected > 0 {
            return Ok(FailOutcome::Dead);
        }

        Ok(FailOutcome::Stale)
    }

    /// Transition a claim directly to terminal `failed`, bypassing the
    /// retry policy. For failures that cannot succeed on retry (e.g. the
    /// input file vanished from disk). Returns false if stale.
    pub fn fail_fatal(
        &self,
        id: &str,
        worker_id: &str,
        error: &str,
        now: &str,
    ) -> Result<bool, ServiceError> {
        let affected = self
            .db
            .exec(
                "UPDATE tasks \
                 SET status = 'failed', claimed_by = NULL, heartbeat_at = NULL, \
                     error = ?1, completed_at = ?2, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'claimed' AND claimed_by = ?4",
                &[
                    Value::Text(error.to_string()),
                    Value::Text(now.to_string()),
                    Value::Text(id.to_string()),
                    Value::Text(worker_id.to_string()),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Reaper support
    // -----------------------------------------------------------------------

    /// All claimed tasks whose last heartbeat predates `cutoff`.
    pub fn stale_claims(&self, cutoff: &str) -> Result<Vec<Task>, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT * FROM tasks \
                 WHERE status = 'claimed' AND heartbeat_at < ?1",
                &[Value::Text(cutoff.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        rows.iter().map(row_to_task).collect()
    }

    // -----------------------------------------------------------------------
    // List / count
    // -----------------------------------------------------------------------

    /// List tasks, newest first, with optional status filter.
    pub fn list(&self, query: &TaskListQuery) -> Result<ListResult<Task>, ServiceError> {
        let limit = query.limit.unwrap_or(50);
        let offset = query.offset.unwrap_or(0);

        let (where_sql, mut params) = match query.status {
            Some(status) => (
                "WHERE status = ?1".to_string(),
                vec![Value::Text(status.as_str().to_string())],
            ),
            None => (String::new(), Vec::new()),
        };

        let count_sql = format!("SELECT COUNT(*) AS cnt FROM tasks {where_sql}");
        let count_rows = self
            .db
            .query(&count_sql, &params)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let total = count_rows
            .first()
            .and_then(|r| r.get_i64("cnt"))
            .unwrap_or(0) as usize;

        let next = params.len() + 1;
        let select_sql = format!(
            "SELECT * FROM tasks {where_sql} ORDER BY created_at DESC LIMIT ?{next} OFFSET ?{}",
            next + 1
        );
        params.push(Value::Integer(limit as i64));
        params.push(Value::Integer(offset as i64));

        let rows = self
            .db
            .query(&select_sql, &params)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let items = rows
            .iter()
            .map(row_to_task)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ListResult { items, total })
    }

    /// Count tasks, optionally by status.
    pub fn count(&self, status: Option<TaskStatus>) -> Result<u64, ServiceError> {
        let rows = match status {
            Some(status) => self.db.query(
                "SELECT COUNT(*) AS cnt FROM tasks WHERE status = ?1",
                &[Value::Text(status.as_str().to_string())],
            ),
            None => self.db.query("SELECT COUNT(*) AS cnt FROM tasks", &[]),
        }
        .map_err(|e| ServiceError::Storage(e.to_string()))?;

        Ok(rows.first().and_then(|r| r.get_i64("cnt")).unwrap_or(0) as u64)
    }
}

/// Map a row to a Task. Columns come back dynamically typed; required
/// columns missing or mistyped indicate schema drift and surface as
/// storage errors.
fn row_to_task(row: &Row) -> Result<Task, ServiceError> {
    let status_str = require_str(row, "status")?;
    let status = TaskStatus::from_str(&status_str)
        .ok_or_else(|| ServiceError::Storage(format!("unknown task status: {status_str}")))?;

    let options = serde_json::from_str(&require_str(row, "options")?)
        .map_err(|e| ServiceError::Storage(format!("bad options json: {e}")))?;

    let result = match row.get_str("result") {
        Some(s) => Some(
            serde_json::from_str(s)
                .map_err(|e| ServiceError::Storage(format!("bad result json: {e}")))?,
        ),
        None => None,
    };

    Ok(Task {
        id: require_str(row, "id")?,
        file_id: require_str(row, "file_id")?,
        options,
        priority: row.get_i64("priority").unwrap_or(0),
        status,
        attempt_count: row.get_i64("attempt_count").unwrap_or(0),
        max_attempts: row.get_i64("max_attempts").unwrap_or(0),
        claimed_by: row.get_str("claimed_by").map(str::to_string),
        heartbeat_at: row.get_str("heartbeat_at").map(str::to_string),
        not_before: row.get_str("not_before").map(str::to_string),
        progress: row.get_f64("progress").unwrap_or(0.0),
        result,
        error: row.get_str("error").map(str::to_string),
        created_at: require_str(row, "created_at")?,
        updated_at: require_str(row, "updated_at")?,
        started_at: row.get_str("started_at").map(str::to_string),
        completed_at: row.get_str("completed_at").map(str::to_string),
    })
}

fn require_str(row: &Row, name: &str) -> Result<String, ServiceError> {
    row.get_str(name)
        .map(str::to_string)
        .ok_or_else(|| ServiceError::Storage(format!("missing column {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::FileStore;
    use crate::model::FileRecord;
    use nola_core::{new_id, now_rfc3339};
    use nola_sql::SqliteStore;

    fn test_stores() -> (FileStore, TaskStore) {
        let db: Arc<dyn SQLStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let files = FileStore::new(Arc::clone(&db)).unwrap();
        let tasks = TaskStore::new(db).unwrap();
        (files, tasks)
    }

    fn seed_file(files: &FileStore, id: &str) {
        files
            .create(&FileRecord {
                id: id.into(),
                filename: "audio.mp3".into(),
                path: format!("uploads/{id}.mp3"),
                size: 100,
                content_type: None,
                created_at: now_rfc3339(),
            })
            .unwrap();
    }

    fn make_task(file_id: &str, priority: i64, max_attempts: i64) -> Task {
        let now = now_rfc3339();
        Task {
            id: new_id(),
            file_id: file_id.into(),
            options: serde_json::json!({}),
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
        }
    }

    #[test]
    fn insert_and_get() {
        let (files, tasks) = test_stores();
        seed_file(&files, "f1");

        let task = make_task("f1", 0, 3);
        tasks.insert(&task).unwrap();

        let got = tasks.get(&task.id).unwrap();
        assert_eq!(got.status, TaskStatus::Pending);
        assert_eq!(got.file_id, "f1");
        assert_eq!(got.attempt_count, 0);
    }

    #[test]
    fn insert_dangling_file_is_referential_error() {
        let (_files, tasks) = test_stores();
        let task = make_task("nope", 0, 3);
        let err = tasks.insert(&task).unwrap_err();
        assert!(matches!(err, ServiceError::Referential(_)));
    }

    #[test]
    fn claim_next_empty_queue_returns_none() {
        let (_files, tasks) = test_stores();
        assert!(tasks.claim_next("w1", &now_rfc3339()).unwrap().is_none());
    }

    #[test]
    fn claim_marks_and_increments() {
        let (files, tasks) = test_stores();
        seed_file(&files, "f1");
        let task = make_task("f1", 0, 3);
        tasks.insert(&task).unwrap();

        let claimed = tasks.claim_next("w1", &now_rfc3339()).unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.status, TaskStatus::Claimed);
        assert_eq!(claimed.claimed_by.as_deref(), Some("w1"));
        assert_eq!(claimed.attempt_count, 1);
        assert!(claimed.heartbeat_at.is_some());
        assert!(claimed.started_at.is_some());

        // Nothing left to claim.
        assert!(tasks.claim_next("w2", &now_rfc3339()).unwrap().is_none());
    }

    #[test]
    fn claim_order_priority_then_fifo() {
        let (files, tasks) = test_stores();
        seed_file(&files, "f1");

        // Priorities [5, 1, 5, 3] enqueued in that order.
        let mut enqueued = Vec::new();
        for p in [5, 1, 5, 3] {
            // Distinct created_at so the FIFO tie-break is deterministic.
            std::thread::sleep(std::time::Duration::from_millis(2));
            let task = make_task("f1", p, 3);
            tasks.insert(&task).unwrap();
            enqueued.push(task.id.clone());
        }

        let order: Vec<String> = (0..4)
            .map(|_| tasks.claim_next("w1", &now_rfc3339()).unwrap().unwrap().id)
            .collect();

        // First the earliest priority-5, then the later 5, then 3, then 1.
        assert_eq!(order[0], enqueued[0]);
        assert_eq!(order[1], enqueued[2]);
        assert_eq!(order[2], enqueued[3]);
        assert_eq!(order[3], enqueued[1]);
    }

    #[test]
    fn claim_honors_not_before() {
        let (files, tasks) = test_stores();
        seed_file(&files, "f1");

        let mut task = make_task("f1", 0, 3);
        task.not_before = Some(nola_core::rfc3339_from_now(3600));
        tasks.insert(&task).unwrap();

        // Not yet eligible.
        assert!(tasks.claim_next("w1", &now_rfc3339()).unwrap().is_none());

        // A past not_before is eligible.
        let mut ready = make_task("f1", 0, 3);
        ready.not_before = Some(nola_core::rfc3339_from_now(-60));
        tasks.insert(&ready).unwrap();
        let claimed = tasks.claim_next("w1", &now_rfc3339()).unwrap().unwrap();
        assert_eq!(claimed.id, ready.id);
    }

    #[test]
    fn heartbeat_only_for_claim_holder() {
        let (files, tasks) = test_stores();
        seed_file(&files, "f1");
        let task = make_task("f1", 0, 3);
        tasks.insert(&task).unwrap();
        tasks.claim_next("w1", &now_rfc3339()).unwrap().unwrap();

        assert!(tasks
            .heartbeat(&task.id, "w1", Some(25.0), &now_rfc3339())
            .unwrap());
        // Wrong worker: no-op.
        assert!(!tasks
            .heartbeat(&task.id, "w2", None, &now_rfc3339())
            .unwrap());

        let got = tasks.get(&task.id).unwrap();
        assert_eq!(got.progress, 25.0);
        assert_eq!(got.attempt_count, 1);
        assert_eq!(got.status, TaskStatus::Claimed);
    }

    #[test]
    fn heartbeat_is_idempotent_and_monotonic() {
        let (files, tasks) = test_stores();
        seed_file(&files, "f1");
        let task = make_task("f1", 0, 3);
        tasks.insert(&task).unwrap();
        tasks.claim_next("w1", &now_rfc3339()).unwrap();

        let mut last = tasks.get(&task.id).unwrap().heartbeat_at.unwrap();
        for _ in 0..3 {
            std::thread::sleep(std::time::Duration::from_millis(2));
            assert!(tasks
                .heartbeat(&task.id, "w1", None, &now_rfc3339())
                .unwrap());
            let got = tasks.get(&task.id).unwrap();
            let hb = got.heartbeat_at.unwrap();
            assert!(hb > last);
            assert_eq!(got.status, TaskStatus::Claimed);
            assert_eq!(got.attempt_count, 1);
            last = hb;
        }
    }

    #[test]
    fn complete_stores_result_and_clears_claim() {
        let (files, tasks) = test_stores();
        seed_file(&files, "f1");
        let task = make_task("f1", 0, 3);
        tasks.insert(&task).unwrap();
        tasks.claim_next("w1", &now_rfc3339()).unwrap();

        let result = serde_json::json!({"segments": [], "duration": 12.5});
        assert!(tasks
            .complete(&task.id, "w1", &result, &now_rfc3339())
            .unwrap());

        let got = tasks.get(&task.id).unwrap();
        assert_eq!(got.status, TaskStatus::Completed);
        assert_eq!(got.result.unwrap()["duration"], 12.5);
        assert!(got.claimed_by.is_none());
        assert!(got.heartbeat_at.is_none());
        assert!(got.completed_at.is_some());

        // Completing again is stale.
        assert!(!tasks
            .complete(&task.id, "w1", &result, &now_rfc3339())
            .unwrap());
    }

    #[test]
    fn complete_with_foreign_worker_is_noop() {
        let (files, tasks) = test_stores();
        seed_file(&files, "f1");
        let task = make_task("f1", 0, 3);
        tasks.insert(&task).unwrap();
        tasks.claim_next("w1", &now_rfc3339()).unwrap();

        let result = serde_json::json!({});
        assert!(!tasks
            .complete(&task.id, "w2", &result, &now_rfc3339())
            .unwrap());
        let got = tasks.get(&task.id).unwrap();
        assert_eq!(got.status, TaskStatus::Claimed);
        assert_eq!(got.claimed_by.as_deref(), Some("w1"));
    }

    #[test]
    fn fail_requeues_while_attempts_remain() {
        let (files, tasks) = test_stores();
        seed_file(&files, "f1");
        let task = make_task("f1", 0, 2);
        tasks.insert(&task).unwrap();
        tasks.claim_next("w1", &now_rfc3339()).unwrap();

        let outcome = tasks
            .fail_task(&task.id, "w1", None, "decode error", None, &now_rfc3339())
            .unwrap();
        assert_eq!(outcome, FailOutcome::Requeued);

        let got = tasks.get(&task.id).unwrap();
        assert_eq!(got.status, TaskStatus::Pending);
        assert_eq!(got.attempt_count, 1);
        assert!(got.claimed_by.is_none());
        assert!(got.heartbeat_at.is_none());
        assert!(got.started_at.is_none());
        assert_eq!(got.error.as_deref(), Some("decode error"));
    }

    #[test]
    fn fail_dead_letters_at_exhaustion() {
        let (files, tasks) = test_stores();
        seed_file(&files, "f1");
        let task = make_task("f1", 0, 1);
        tasks.insert(&task).unwrap();
        tasks.claim_next("w1", &now_rfc3339()).unwrap();

        // attempt_count(1) >= max_attempts(1): dead, not pending.
        let outcome = tasks
            .fail_task(&task.id, "w1", None, "decode error", None, &now_rfc3339())
            .unwrap();
        assert_eq!(outcome, FailOutcome::Dead);

        let got = tasks.get(&task.id).unwrap();
        assert_eq!(got.status, TaskStatus::Dead);
        assert_eq!(got.error.as_deref(), Some("decode error"));
        assert!(got.completed_at.is_some());

        // Terminal states are inert: a late fail is stale.
        let outcome = tasks
            .fail_task(&task.id, "w1", None, "again", None, &now_rfc3339())
            .unwrap();
        assert_eq!(outcome, FailOutcome::Stale);
        assert_eq!(tasks.get(&task.id).unwrap().error.as_deref(), Some("decode error"));
    }

    #[test]
    fn fail_with_foreign_worker_is_stale() {
        let (files, tasks) = test_stores();
        seed_file(&files, "f1");
        let task = make_task("f1", 0, 3);
        tasks.insert(&task).unwrap();
        tasks.claim_next("w1", &now_rfc3339()).unwrap();

        let outcome = tasks
            .fail_task(&task.id, "w2", None, "err", None, &now_rfc3339())
            .unwrap();
        assert_eq!(outcome, FailOutcome::Stale);
        assert_eq!(tasks.get(&task.id).unwrap().status, TaskStatus::Claimed);
    }

    #[test]
    fn fail_with_heartbeat_guard_misses_after_fresh_heartbeat() {
        let (files, tasks) = test_stores();
        seed_file(&files, "f1");
        let task = make_task("f1", 0, 3);
        tasks.insert(&task).unwrap();
        tasks.claim_next("w1", &now_rfc3339()).unwrap();

        let stale_hb = tasks.get(&task.id).unwrap().heartbeat_at.unwrap();

        // Worker heartbeats between the sweep's read and its action.
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(tasks
            .heartbeat(&task.id, "w1", None, &now_rfc3339())
            .unwrap());

        let outcome = tasks
            .fail_task(
                &task.id,
                "w1",
                Some(&stale_hb),
                "heartbeat timeout",
                None,
                &now_rfc3339(),
            )
            .unwrap();
        assert_eq!(outcome, FailOutcome::Stale);
        assert_eq!(tasks.get(&task.id).unwrap().status, TaskStatus::Claimed);
    }

    #[test]
    fn fail_fatal_skips_retry_policy() {
        let (files, tasks) = test_stores();
        seed_file(&files, "f1");
        let task = make_task("f1", 0, 5);
        tasks.insert(&task).unwrap();
        tasks.claim_next("w1", &now_rfc3339()).unwrap();

        assert!(tasks
            .fail_fatal(&task.id, "w1", "file missing", &now_rfc3339())
            .unwrap());

        let got = tasks.get(&task.id).unwrap();
        assert_eq!(got.status, TaskStatus::Failed);
        assert_eq!(got.attempt_count, 1);
        assert_eq!(got.error.as_deref(), Some("file missing"));
    }

    #[test]
    fn stale_claims_scan() {
        let (files, tasks) = test_stores();
        seed_file(&files, "f1");
        let task = make_task("f1", 0, 3);
        tasks.insert(&task).unwrap();
        tasks.claim_next("w1", &now_rfc3339()).unwrap();

        // Claim is fresh: not stale against a cutoff in the past.
        let past_cutoff = nola_core::rfc3339_from_now(-60);
        assert!(tasks.stale_claims(&past_cutoff).unwrap().is_empty());

        // Against a future cutoff it shows up.
        let future_cutoff = nola_core::rfc3339_from_now(60);
        let stale = tasks.stale_claims(&future_cutoff).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, task.id);
    }

    #[test]
    fn list_and_count() {
        let (files, tasks) = test_stores();
        seed_file(&files, "f1");
        for p in [0, 1, 2] {
            tasks.insert(&make_task("f1", p, 3)).unwrap();
        }
        tasks.claim_next("w1", &now_rfc3339()).unwrap();

        assert_eq!(tasks.count(None).unwrap(), 3);
        assert_eq!(tasks.count(Some(TaskStatus::Pending)).unwrap(), 2);
        assert_eq!(tasks.count(Some(TaskStatus::Claimed)).unwrap(), 1);

        let page = tasks
            .list(&TaskListQuery {
                status: Some(TaskStatus::Pending),
                limit: Some(1),
                offset: None,
            })
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
    }
}
