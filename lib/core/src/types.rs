use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

/// Parameters for list/query operations.
#[derive(Debug, Clone, Deserialize)]
pub struct ListParams {
    /// Maximum number of results to return.
    #[serde(default = "default_limit")]
    pub limit: usize,

    /// Offset for pagination.
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            offset: 0,
        }
    }
}

/// Result wrapper for list operations.
#[derive(Debug, Clone, Serialize)]
pub struct ListResult<T: Serialize> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Generate a new random ID (UUIDv4, no dashes).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string().replace('-', "")
}

/// Get the current time as an RFC 3339 UTC string.
///
/// Fixed-width microsecond precision, so lexicographic comparison of two
/// timestamps matches their time order. Stored timestamps are compared as
/// strings in SQL (`heartbeat_at < cutoff`).
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// RFC 3339 UTC string for now shifted by `secs` seconds (negative =
/// past). Same fixed-width format as [`now_rfc3339`].
pub fn rfc3339_from_now(secs: i64) -> String {
    (chrono::Utc::now() + chrono::Duration::seconds(secs))
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id() {
        let id = new_id();
        assert_eq!(id.len(), 32);
        assert!(!id.contains('-'));
    }

    #[test]
    fn test_now_rfc3339() {
        let ts = now_rfc3339();
        assert!(ts.contains('T'));
        assert!(ts.ends_with('Z'));
        // Microsecond precision is fixed-width: "....123456Z".
        let frac = ts.split('.').nth(1).unwrap();
        assert_eq!(frac.len(), 7);
    }

    #[test]
    fn timestamps_order_lexicographically() {
        let a = now_rfc3339();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_rfc3339();
        assert!(a < b);
    }

    #[test]
    fn test_rfc3339_from_now() {
        let past = rfc3339_from_now(-60);
        let now = now_rfc3339();
        let future = rfc3339_from_now(60);
        assert!(past < now);
        assert!(now < future);
    }
}
