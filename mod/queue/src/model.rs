use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a transcription task.
///
/// ```text
/// pending → claimed → completed
///                   → pending   (failure with attempts left)
///                   → dead      (failure with attempts exhausted)
///                   → failed    (non-retryable failure)
/// ```
///
/// Transitions are made only by the queue engine and the reaper — workers
/// report outcomes, they never write status directly. `completed`,
/// `failed` and `dead` are terminal and inert; a task never re-enters
/// `pending` from a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Dead,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }

    /// Whether the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Dead)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task — the core data model, maps 1:1 to SQL columns
// ---------------------------------------------------------------------------

/// A single transcription task.
///
/// All fields map directly to SQL columns — no JSON blob for the record
/// itself. `options` and `result` are opaque JSON payloads interpreted only
/// by the transcription engine; the queue never looks inside them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,

    // --- definition ---
    /// The input file this task transcribes. Must reference an existing
    /// file record; the store's foreign key rejects dangling inserts.
    pub file_id: String,
    /// Engine options, opaque to the queue.
    pub options: serde_json::Value,
    /// Higher claims first; equal priorities are FIFO by `created_at`.
    #[serde(default)]
    pub priority: i64,

    // --- execution state ---
    pub status: TaskStatus,
    /// Claims ever granted, incremented on every transition into
    /// `claimed` regardless of cause. This is the poison-pill bound.
    #[serde(default)]
    pub attempt_count: i64,
    /// Immutable ceiling set at enqueue time.
    pub max_attempts: i64,

    // --- ownership ---
    /// Worker currently holding the claim; None when unclaimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    /// Last liveness signal (RFC 3339). Only meaningful while `claimed`;
    /// cleared on any exit from that state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<String>,
    /// Earliest time the task is eligible for claim (RFC 3339). None =
    /// immediately eligible. Set by the retry policy on requeue when a
    /// backoff delay is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,
    /// Progress percentage reported with heartbeats (0-100).
    #[serde(default)]
    pub progress: f64,

    // --- outcome ---
    /// Opaque engine result, set once on `completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error description, set on failure paths (including the reaper's
    /// synthetic heartbeat timeout).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    // --- timestamps ---
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

// ---------------------------------------------------------------------------
// FileRecord — minimal file metadata backing the referential invariant
// ---------------------------------------------------------------------------

/// Metadata for an uploaded audio file. The queue only needs existence and
/// the storage path; everything else is bookkeeping for the ingestion side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub filename: String,
    pub path: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Query types
// ---------------------------------------------------------------------------

/// Filters for listing tasks.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListQuery {
    #[serde(default)]
    pub status: Option<TaskStatus>,

    #[serde(default)]
    pub limit: Option<usize>,

    #[serde(default)]
    pub offset: Option<usize>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
