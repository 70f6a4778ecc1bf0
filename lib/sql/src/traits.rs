use crate::error::SQLError;

/// A dynamically-typed SQL parameter value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Text value, or Null for None. Convenience for nullable columns.
    pub fn opt_text(s: Option<&str>) -> Value {
        match s {
            Some(s) => Value::Text(s.to_string()),
            None => Value::Null,
        }
    }
}

/// A row returned from a SQL query — column name to value.
#[derive(Debug, Clone)]
pub struct Row {
    pub columns: Vec<(String, Value)>,
}

impl Row {
    /// Get a column value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Get a text column value by name.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get an integer column value by name.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Value::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    /// Get a real column value by name. SQLite may report a whole-number
    /// REAL column as an integer, so both storage classes are accepted.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(Value::Real(f)) => Some(*f),
            Some(Value::Integer(i)) => Some(*i as f64),
            _ => None,
        }
    }
}

/// SQLStore provides a SQL execution interface backed by an embedded
/// database.
///
/// Atomicity contract: each `exec`/`query` call runs as a single statement
/// under the store's internal serialization. A conditional update
/// (`UPDATE ... WHERE <predicate>`) therefore either observes the predicate
/// and applies, or affects zero rows — there is no window in which another
/// caller sees a half-applied transition. All queue mutations are built on
/// exactly this primitive.
pub trait SQLStore: Send + Sync {
    /// Execute a query and return rows. Also used for
    /// `UPDATE ... RETURNING` statements, which both mutate and return the
    /// affected row in one atomic step.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError>;

    /// Execute a statement (INSERT/UPDATE/DELETE) and return affected row
    /// count.
    fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, SQLError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_lookup_by_name() {
        let row = Row {
            columns: vec![
                ("id".into(), Value::Text("t1".into())),
                ("priority".into(), Value::Integer(5)),
                ("progress".into(), Value::Real(42.5)),
                ("error".into(), Value::Null),
            ],
        };
        assert_eq!(row.get_str("id"), Some("t1"));
        assert_eq!(row.get_i64("priority"), Some(5));
        assert_eq!(row.get_f64("progress"), Some(42.5));
        assert!(row.get_str("error").is_none());
        assert!(row.get("missing").is_none());
    }

    #[test]
    fn real_column_accepts_integer_storage() {
        let row = Row {
            columns: vec![("progress".into(), Value::Integer(100))],
        };
        assert_eq!(row.get_f64("progress"), Some(100.0));
    }

    #[test]
    fn opt_text_maps_none_to_null() {
        assert!(matches!(Value::opt_text(None), Value::Null));
        assert!(matches!(Value::opt_text(Some("w")), Value::Text(_)));
    }
}
