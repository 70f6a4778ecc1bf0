use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nola_core::ServiceError;

use crate::engine::TaskQueue;
use crate::files::FileStore;
use crate::model::Task;

// ---------------------------------------------------------------------------
// Transcription engine port
// ---------------------------------------------------------------------------

/// Final output of a transcription run. `segments` is opaque to the queue;
/// it is stored verbatim as the task result.
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub segments: serde_json::Value,
    /// Audio duration in seconds.
    pub duration: f64,
}

impl TranscriptionResult {
    /// The JSON stored as the task's result.
    pub fn into_json(self) -> serde_json::Value {
        serde_json::json!({
            "segments": self.segments,
            "duration": self.duration,
        })
    }
}

/// Engine failure, split by whether a retry can possibly succeed.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Worth retrying (model load hiccup, resource exhaustion).
    #[error("{0}")]
    Transient(String),

    /// Retrying cannot help (corrupt or unsupported input).
    #[error("{0}")]
    Fatal(String),
}

/// Shared control handle between the worker loop and a running engine
/// call: the loop signals cancellation, the engine reports progress.
#[derive(Clone, Default)]
pub struct TaskControl {
    cancelled: Arc<AtomicBool>,
    /// Progress percentage as f64 bits.
    progress: Arc<AtomicU64>,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engines should poll this between work units and return early when
    /// set — the claim is gone and the output will be discarded.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Report progress (0-100); picked up by the next heartbeat.
    pub fn report_progress(&self, pct: f64) {
        self.progress.store(pct.to_bits(), Ordering::Relaxed);
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Relaxed))
    }
}

/// The transcription engine, as the queue sees it: an opaque blocking
/// function from a file and options to a result or error. Invoked from the
/// worker loop via `spawn_blocking`, never by the queue engine itself.
pub trait TranscriptionEngine: Send + Sync + 'static {
    fn execute(
        &self,
        path: &Path,
        options: &serde_json::Value,
        ctl: &TaskControl,
    ) -> Result<TranscriptionResult, EngineError>;
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// Configuration for a worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to renew the claim while the engine runs. Must be well
    /// under the reaper's stale timeout (see `ReaperConfig`).
    pub heartbeat_interval: Duration,
    /// Fallback poll interval while the queue is empty; the loop also
    /// wakes immediately on the queue's notify signal.
    pub idle_poll: Duration,
    /// Pause after an unexpected storage error before trying again.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            idle_poll: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Generate a unique worker identity.
pub fn worker_id() -> String {
    format!("worker-{}-{}", std::process::id(), &nola_core::new_id()[..8])
}

/// Start a worker loop in the background.
///
/// Returns a CancellationToken that stops the loop when cancelled. The
/// current task, if any, is abandoned mid-flight on shutdown and will be
/// reclaimed by the reaper once its heartbeat goes stale.
pub fn start(
    queue: Arc<TaskQueue>,
    files: Arc<FileStore>,
    engine: Arc<dyn TranscriptionEngine>,
    worker_id: String,
    config: WorkerConfig,
) -> CancellationToken {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_worker(queue, files, engine, worker_id, config, cancel).await;
        });
    }
    cancel
}

/// The worker loop: claim → execute with periodic heartbeats → report.
///
/// Contract with the queue:
/// - claims are granted exclusively; a `None` just means nothing eligible;
/// - a `false` heartbeat means the claim is void — all work stops
///   immediately and the output is discarded;
/// - outcomes are reported through `complete`/`fail`/`fail_fatal`, never
///   by touching task state directly.
pub async fn run_worker(
    queue: Arc<TaskQueue>,
    files: Arc<FileStore>,
    engine: Arc<dyn TranscriptionEngine>,
    worker_id: String,
    config: WorkerConfig,
    cancel: CancellationToken,
) {
    info!(worker_id = %worker_id, "worker started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match queue.claim(&worker_id) {
            Ok(Some(task)) => {
                if let Err(e) =
                    process_task(&queue, &files, &engine, &worker_id, task, &config).await
                {
                    error!(worker_id = %worker_id, "task processing error: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(config.error_backoff) => {}
                    }
                }
            }
            Ok(None) => {
                // Idle: wake on enqueue/requeue, or poll as a fallback.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = queue.notify().notified() => {}
                    _ = tokio::time::sleep(config.idle_poll) => {}
                }
            }
            Err(e) => {
                error!(worker_id = %worker_id, "claim error: {e}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.error_backoff) => {}
                }
            }
        }
    }

    info!(worker_id = %worker_id, "worker stopped");
}

/// Execute one claimed task end to end.
async fn process_task(
    queue: &Arc<TaskQueue>,
    files: &Arc<FileStore>,
    engine: &Arc<dyn TranscriptionEngine>,
    worker_id: &str,
    task: Task,
    config: &WorkerConfig,
) -> Result<(), ServiceError> {
    info!(task_id = %task.id, worker_id = %worker_id, "starting transcription");

    // Resolve the input file. Both misses are non-retryable: the file
    // record or the bytes on disk will not reappear on a later attempt.
    let path = match files.path(&task.file_id)? {
        Some(p) => PathBuf::from(p),
        None => {
            queue.fail_fatal(
                &task.id,
                worker_id,
                &format!("file not found: {}", task.file_id),
            )?;
            return Ok(());
        }
    };
    if !path.exists() {
        queue.fail_fatal(
            &task.id,
            worker_id,
            &format!("file does not exist: {}", path.display()),
        )?;
        return Ok(());
    }

    let ctl = TaskControl::new();
    let mut run = tokio::task::spawn_blocking({
        let engine = Arc::clone(engine);
        let options = task.options.clone();
        let ctl = ctl.clone();
        move || engine.execute(&path, &options, &ctl)
    });

    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            res = &mut run => break res,
            _ = ticker.tick() => {
                match queue.heartbeat(&task.id, worker_id, Some(ctl.progress())) {
                    Ok(true) => {}
                    Ok(false) => {
                        // Claim void (reaped or taken over). Stop the
                        // engine and discard everything.
                        warn!(task_id = %task.id, worker_id = %worker_id,
                            "claim lost, abandoning work");
                        ctl.cancel();
                        let _ = (&mut run).await;
                        return Ok(());
                    }
                    // Transient heartbeat failures are ignored; the next
                    // tick retries and the stale timeout has headroom.
                    Err(e) => debug!(task_id = %task.id, "heartbeat failed: {e}"),
                }
            }
        }
    };

    let report = match outcome {
        Ok(Ok(result)) => {
            info!(task_id = %task.id, duration = result.duration, "transcription finished");
            queue.complete(&task.id, worker_id, result.into_json())
        }
        Ok(Err(EngineError::Fatal(msg))) => {
            queue.fail_fatal(&task.id, worker_id, &msg)
        }
        Ok(Err(EngineError::Transient(msg))) => {
            queue.fail(&task.id, worker_id, &msg)
        }
        Err(join_err) => {
            // Engine panicked; treat like any other failure and let the
            // retry policy decide.
            queue.fail(&task.id, worker_id, &format!("engine panicked: {join_err}"))
        }
    };

    match report {
        Ok(_) => Ok(()),
        // The claim was lost while the engine ran its last stretch; the
        // result is discarded, which is exactly the contract.
        Err(ServiceError::StaleClaim(_)) => {
            warn!(task_id = %task.id, worker_id = %worker_id, "outcome discarded, claim was lost");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileRecord, TaskStatus};
    use crate::store::TaskStore;
    use nola_core::now_rfc3339;
    use nola_sql::{SQLStore, SqliteStore};
    use std::io::Write;

    fn make_queue() -> (Arc<FileStore>, Arc<TaskQueue>) {
        let db: Arc<dyn SQLStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let files = Arc::new(FileStore::new(Arc::clone(&db)).unwrap());
        let store = Arc::new(TaskStore::new(db).unwrap());
        (files, Arc::new(TaskQueue::new(store)))
    }

    fn seed_file_at(files: &FileStore, id: &str, path: &Path) {
        files
            .create(&FileRecord {
                id: id.into(),
                filename: "audio.mp3".into(),
                path: path.to_string_lossy().into_owned(),
                size: 4,
                content_type: Some("audio/mpeg".into()),
                created_at: now_rfc3339(),
            })
            .unwrap();
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            heartbeat_interval: Duration::from_millis(20),
            idle_poll: Duration::from_millis(20),
            error_backoff: Duration::from_millis(20),
        }
    }

    async fn wait_terminal(queue: &TaskQueue, task_id: &str) -> TaskStatus {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = queue.get(task_id).unwrap().status;
            if status.is_terminal() {
                return status;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "task never reached a terminal state"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    struct OkEngine;
    impl TranscriptionEngine for OkEngine {
        fn execute(
            &self,
            _path: &Path,
            _options: &serde_json::Value,
            ctl: &TaskControl,
        ) -> Result<TranscriptionResult, EngineError> {
            ctl.report_progress(50.0);
            std::thread::sleep(Duration::from_millis(50));
            Ok(TranscriptionResult {
                segments: serde_json::json!([{"start": 0.0, "end": 1.5, "text": "hello"}]),
                duration: 1.5,
            })
        }
    }

    struct TransientFailEngine;
    impl TranscriptionEngine for TransientFailEngine {
        fn execute(
            &self,
            _path: &Path,
            _options: &serde_json::Value,
            _ctl: &TaskControl,
        ) -> Result<TranscriptionResult, EngineError> {
            Err(EngineError::Transient("model load failed".into()))
        }
    }

    struct FatalFailEngine;
    impl TranscriptionEngine for FatalFailEngine {
        fn execute(
            &self,
            _path: &Path,
            _options: &serde_json::Value,
            _ctl: &TaskControl,
        ) -> Result<TranscriptionResult, EngineError> {
            Err(EngineError::Fatal("unsupported codec".into()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_completes_task() {
        let (files, queue) = make_queue();

        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("a.mp3");
        std::fs::File::create(&audio)
            .unwrap()
            .write_all(b"data")
            .unwrap();
        seed_file_at(&files, "f1", &audio);

        let task = queue
            .enqueue("f1", serde_json::json!({}), None, None)
            .unwrap();

        let cancel = start(
            Arc::clone(&queue),
            Arc::clone(&files),
            Arc::new(OkEngine),
            "w1".into(),
            fast_config(),
        );

        assert_eq!(wait_terminal(&queue, &task.id).await, TaskStatus::Completed);
        cancel.cancel();

        let got = queue.get(&task.id).unwrap();
        let result = got.result.unwrap();
        assert_eq!(result["duration"], 1.5);
        assert_eq!(result["segments"][0]["text"], "hello");
        assert_eq!(got.progress, 100.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transient_failures_exhaust_into_dead() {
        let (files, queue) = make_queue();

        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("a.mp3");
        std::fs::File::create(&audio)
            .unwrap()
            .write_all(b"data")
            .unwrap();
        seed_file_at(&files, "f1", &audio);

        let task = queue
            .enqueue("f1", serde_json::json!({}), None, Some(2))
            .unwrap();

        let cancel = start(
            Arc::clone(&queue),
            Arc::clone(&files),
            Arc::new(TransientFailEngine),
            "w1".into(),
            fast_config(),
        );

        assert_eq!(wait_terminal(&queue, &task.id).await, TaskStatus::Dead);
        cancel.cancel();

        let got = queue.get(&task.id).unwrap();
        assert_eq!(got.attempt_count, 2);
        assert_eq!(got.error.as_deref(), Some("model load failed"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fatal_failure_skips_retries() {
        let (files, queue) = make_queue();

        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("a.mp3");
        std::fs::File::create(&audio)
            .unwrap()
            .write_all(b"data")
            .unwrap();
        seed_file_at(&files, "f1", &audio);

        let task = queue
            .enqueue("f1", serde_json::json!({}), None, Some(5))
            .unwrap();

        let cancel = start(
            Arc::clone(&queue),
            Arc::clone(&files),
            Arc::new(FatalFailEngine),
            "w1".into(),
            fast_config(),
        );

        assert_eq!(wait_terminal(&queue, &task.id).await, TaskStatus::Failed);
        cancel.cancel();

        let got = queue.get(&task.id).unwrap();
        assert_eq!(got.attempt_count, 1);
        assert_eq!(got.error.as_deref(), Some("unsupported codec"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_file_on_disk_is_fatal() {
        let (files, queue) = make_queue();
        seed_file_at(&files, "f1", Path::new("/nonexistent/audio.mp3"));

        let task = queue
            .enqueue("f1", serde_json::json!({}), None, None)
            .unwrap();

        let cancel = start(
            Arc::clone(&queue),
            Arc::clone(&files),
            Arc::new(OkEngine),
            "w1".into(),
            fast_config(),
        );

        assert_eq!(wait_terminal(&queue, &task.id).await, TaskStatus::Failed);
        cancel.cancel();

        let got = queue.get(&task.id).unwrap();
        assert!(got.error.unwrap().contains("does not exist"));
    }

    #[test]
    fn task_control_roundtrip() {
        let ctl = TaskControl::new();
        assert!(!ctl.is_cancelled());
        assert_eq!(ctl.progress(), 0.0);

        ctl.report_progress(62.5);
        assert_eq!(ctl.progress(), 62.5);

        ctl.cancel();
        assert!(ctl.is_cancelled());
    }

    #[test]
    fn worker_id_is_unique() {
        assert_ne!(worker_id(), worker_id());
    }
}
