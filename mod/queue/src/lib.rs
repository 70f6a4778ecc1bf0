pub mod engine;
pub mod files;
pub mod model;
pub mod reaper;
pub mod retry;
pub mod store;
pub mod worker;

use std::sync::Arc;

use nola_core::ServiceError;
use nola_sql::SQLStore;

use engine::{QueueConfig, TaskQueue};
use files::FileStore;
use reaper::ReaperConfig;
use store::TaskStore;

/// The queue module — persistent transcription task queue.
///
/// Wires the stores, the queue engine, and the background reaper over one
/// shared store handle. The handle is opened once at process start and
/// passed in; the module never reopens or reinitialises it. Worker loops
/// are started separately (see [`worker::start`]) — typically one per
/// process, against the same store.
pub struct QueueModule {
    files: Arc<FileStore>,
    queue: Arc<TaskQueue>,
    _reaper_cancel: tokio_util::sync::CancellationToken,
}

impl QueueModule {
    /// Create the queue module, initialise storage, and start the reaper.
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        Self::with_config(db, QueueConfig::default(), ReaperConfig::default())
    }

    /// Create with explicit queue and reaper configuration.
    pub fn with_config(
        db: Arc<dyn SQLStore>,
        queue_config: QueueConfig,
        reaper_config: ReaperConfig,
    ) -> Result<Self, ServiceError> {
        // files before tasks: the tasks table's foreign key needs it.
        let files = Arc::new(FileStore::new(Arc::clone(&db))?);
        let store = Arc::new(TaskStore::new(db)?);
        let queue = Arc::new(TaskQueue::with_config(store, queue_config));
        let cancel = reaper::start(Arc::clone(&queue), reaper_config);

        Ok(Self {
            files,
            queue,
            _reaper_cancel: cancel,
        })
    }

    /// The queue engine.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// The file metadata store.
    pub fn files(&self) -> &Arc<FileStore> {
        &self.files
    }
}
