pub mod error;
pub mod types;

pub use error::ServiceError;
pub use types::{ListParams, ListResult, new_id, now_rfc3339, rfc3339_from_now};
