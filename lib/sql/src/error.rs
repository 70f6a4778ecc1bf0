use thiserror::Error;

#[derive(Error, Debug)]
pub enum SQLError {
    #[error("query error: {0}")]
    Query(String),

    #[error("execution error: {0}")]
    Execution(String),

    /// A constraint (foreign key, unique, check) rejected the statement.
    /// Distinguished from [`SQLError::Execution`] so callers can map
    /// referential violations without parsing message strings.
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("connection error: {0}")]
    Connection(String),

    /// The embedded database runtime lacks a required feature. Raised at
    /// open time, before any statement runs. Fatal — not retryable.
    #[error("unsupported sqlite runtime: {0}")]
    Unsupported(String),
}
