use std::sync::Arc;

use nola_core::ServiceError;
use nola_sql::{Row, SQLStore, Value};

use crate::model::FileRecord;

/// SQL schema for the files table.
const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS files (
    id           TEXT PRIMARY KEY,
    filename     TEXT NOT NULL,
    path         TEXT NOT NULL,
    size         INTEGER NOT NULL,
    content_type TEXT,
    created_at   TEXT NOT NULL
)";

const INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_files_created ON files(created_at DESC)";

/// Persistent storage for uploaded file metadata.
///
/// The queue only depends on two things here: `exists` (the referential
/// check behind enqueue, enforced in SQL by the tasks table's foreign key)
/// and `path` (resolved by workers before invoking the engine). The rest is
/// plain bookkeeping for the ingestion side.
pub struct FileStore {
    db: Arc<dyn SQLStore>,
}

impl FileStore {
    /// Create a new FileStore and initialise the schema.
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        db.exec(SCHEMA, &[])
            .map_err(|e| ServiceError::Storage(format!("files schema init: {e}")))?;
        db.exec(INDEX, &[])
            .map_err(|e| ServiceError::Storage(format!("files schema init: {e}")))?;
        Ok(Self { db })
    }

    /// Insert a new file record.
    pub fn create(&self, file: &FileRecord) -> Result<(), ServiceError> {
        self.db
            .exec(
                "INSERT INTO files (id, filename, path, size, content_type, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                &[
                    Value::Text(file.id.clone()),
                    Value::Text(file.filename.clone()),
                    Value::Text(file.path.clone()),
                    Value::Integer(file.size),
                    Value::opt_text(file.content_type.as_deref()),
                    Value::Text(file.created_at.clone()),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a file record by ID.
    pub fn get(&self, id: &str) -> Result<FileRecord, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT * FROM files WHERE id = ?1",
                &[Value::Text(id.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let row = rows
            .first()
            .ok_or_else(|| ServiceError::NotFound(format!("file {id}")))?;

        row_to_file(row)
    }

    /// Whether a file record exists.
    pub fn exists(&self, id: &str) -> Result<bool, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT 1 AS present FROM files WHERE id = ?1",
                &[Value::Text(id.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        Ok(!rows.is_empty())
    }

    /// Get a file's storage path, or None if the record is missing.
    pub fn path(&self, id: &str) -> Result<Option<String>, ServiceError> {
        match self.get(id) {
            Ok(file) => Ok(Some(file.path)),
            Err(ServiceError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete a file record (not the file on disk). Returns true if a
    /// record was removed.
    pub fn delete(&self, id: &str) -> Result<bool, ServiceError> {
        let affected = self
            .db
            .exec(
                "DELETE FROM files WHERE id = ?1",
                &[Value::Text(id.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        Ok(affected > 0)
    }
}

/// Map a row to a FileRecord.
fn row_to_file(row: &Row) -> Result<FileRecord, ServiceError> {
    Ok(FileRecord {
        id: require_str(row, "id")?,
        filename: require_str(row, "filename")?,
        path: require_str(row, "path")?,
        size: row.get_i64("size").unwrap_or(0),
        content_type: row.get_str("content_type").map(str::to_string),
        created_at: require_str(row, "created_at")?,
    })
}

fn require_str(row: &Row, name: &str) -> Result<String, ServiceError> {
    row.get_str(name)
        .map(str::to_string)
        .ok_or_else(|| ServiceError::Storage(format!("missing column {name}")))
}
