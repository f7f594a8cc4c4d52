//! Analytical query store abstraction.
//!
//! Queries are opaque SQL strings with named, typed placeholders; the store
//! only ships them and hands back rows as JSON objects.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use peruse_core::StorageError;
use serde_json::{Map, Value};

/// One result row keyed by column name.
pub type Row = Map<String, Value>;

/// A bound query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    String(String),
    Int(i64),
    Float(f64),
    StringArray(Vec<String>),
}

impl From<&str> for QueryParam {
    fn from(value: &str) -> Self {
        QueryParam::String(value.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(value: String) -> Self {
        QueryParam::String(value)
    }
}

impl From<i64> for QueryParam {
    fn from(value: i64) -> Self {
        QueryParam::Int(value)
    }
}

impl From<f64> for QueryParam {
    fn from(value: f64) -> Self {
        QueryParam::Float(value)
    }
}

impl From<Vec<String>> for QueryParam {
    fn from(value: Vec<String>) -> Self {
        QueryParam::StringArray(value)
    }
}

/// Ordered set of named parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams(Vec<(String, QueryParam)>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<QueryParam>) -> Self {
        self.0.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&QueryParam> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &QueryParam)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }
}

/// Store that runs analytical queries.
#[async_trait]
pub trait QueryStore: Send + Sync {
    /// Run a query and return its rows.
    async fn query(&self, sql: &str, params: &QueryParams) -> Result<Vec<Row>, StorageError>;

    /// Run a statement that returns no rows.
    async fn execute(&self, sql: &str, params: &QueryParams) -> Result<(), StorageError>;
}

/// Typed column access for result rows.
pub trait RowExt {
    fn str_column(&self, column: &str) -> Result<&str, StorageError>;
    fn f64_column(&self, column: &str) -> Result<f64, StorageError>;
}

impl RowExt for Row {
    fn str_column(&self, column: &str) -> Result<&str, StorageError> {
        self.get(column)
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::RowDecode {
                column: column.to_string(),
                reason: "expected a string".to_string(),
            })
    }

    fn f64_column(&self, column: &str) -> Result<f64, StorageError> {
        let value = self.get(column).ok_or_else(|| StorageError::RowDecode {
            column: column.to_string(),
            reason: "missing".to_string(),
        })?;
        // Wide numeric types may be quoted in JSON output.
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| StorageError::RowDecode {
                column: column.to_string(),
                reason: format!("expected a number, got {value}"),
            })
    }
}

// ============================================================================
// MOCK STORE
// ============================================================================

/// A statement recorded by [`MockQueryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStatement {
    pub sql: String,
    pub params: QueryParams,
}

#[derive(Debug, Default)]
struct MockState {
    responses: Vec<(String, Vec<Row>)>,
    failure: Option<StorageError>,
    queries: Vec<RecordedStatement>,
    executed: Vec<RecordedStatement>,
}

/// In-memory query store for tests.
///
/// Responses are matched by substring against the SQL text; the first match
/// wins and unmatched queries return no rows.
#[derive(Debug, Default)]
pub struct MockQueryStore {
    state: Mutex<MockState>,
    delay: Option<Duration>,
}

impl MockQueryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, to widen race windows in concurrency tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Return `rows` for any query whose SQL contains `fragment`.
    pub fn respond(&self, fragment: impl Into<String>, rows: Vec<Row>) {
        if let Ok(mut state) = self.state.lock() {
            state.responses.push((fragment.into(), rows));
        }
    }

    /// Fail every subsequent call with `err`, or stop failing with `None`.
    pub fn fail_with(&self, err: Option<StorageError>) {
        if let Ok(mut state) = self.state.lock() {
            state.failure = err;
        }
    }

    pub fn queries(&self) -> Vec<RecordedStatement> {
        self.state
            .lock()
            .map(|s| s.queries.clone())
            .unwrap_or_default()
    }

    pub fn executed(&self) -> Vec<RecordedStatement> {
        self.state
            .lock()
            .map(|s| s.executed.clone())
            .unwrap_or_default()
    }

    /// Number of queries whose SQL contains `fragment`.
    pub fn query_count(&self, fragment: &str) -> usize {
        self.queries()
            .iter()
            .filter(|q| q.sql.contains(fragment))
            .count()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl QueryStore for MockQueryStore {
    async fn query(&self, sql: &str, params: &QueryParams) -> Result<Vec<Row>, StorageError> {
        self.pause().await;
        let mut state = self.state.lock().map_err(|_| StorageError::LockPoisoned)?;
        state.queries.push(RecordedStatement {
            sql: sql.to_string(),
            params: params.clone(),
        });
        if let Some(err) = &state.failure {
            return Err(err.clone());
        }
        Ok(state
            .responses
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn execute(&self, sql: &str, params: &QueryParams) -> Result<(), StorageError> {
        self.pause().await;
        let mut state = self.state.lock().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(err) = &state.failure {
            return Err(err.clone());
        }
        state.executed.push(RecordedStatement {
            sql: sql.to_string(),
            params: params.clone(),
        });
        Ok(())
    }
}

/// Build a row from `(column, value)` pairs.
pub fn row<const N: usize>(columns: [(&str, Value); N]) -> Row {
    columns
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_bind_and_get() {
        let params = QueryParams::new()
            .bind("uri", "at://did:plc:abc/app.bsky.feed.post/3kq")
            .bind("limit", 50i64)
            .bind("dids", vec!["did:plc:a".to_string()]);
        assert_eq!(params.get("limit"), Some(&QueryParam::Int(50)));
        assert_eq!(params.iter().count(), 3);
        assert!(params.get("missing").is_none());
    }

    #[test]
    fn test_row_columns() {
        let r = row([("uri", json!("at://x")), ("score", json!("1.5")), ("n", json!(2))]);
        assert_eq!(r.str_column("uri").unwrap(), "at://x");
        assert_eq!(r.f64_column("score").unwrap(), 1.5);
        assert_eq!(r.f64_column("n").unwrap(), 2.0);
        assert!(matches!(
            r.str_column("n"),
            Err(StorageError::RowDecode { .. })
        ));
    }

    #[tokio::test]
    async fn test_mock_store_matches_by_fragment() {
        let store = MockQueryStore::new();
        store.respond("FROM posts", vec![row([("uri", json!("at://a"))])]);

        let rows = store
            .query("SELECT uri FROM posts", &QueryParams::new())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(store
            .query("SELECT 1", &QueryParams::new())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.query_count("FROM posts"), 1);
    }

    #[tokio::test]
    async fn test_mock_store_failure() {
        let store = MockQueryStore::new();
        store.fail_with(Some(StorageError::QueryFailed {
            reason: "down".to_string(),
        }));
        assert!(store.execute("INSERT", &QueryParams::new()).await.is_err());
        assert!(store.executed().is_empty());

        store.fail_with(None);
        store.execute("INSERT", &QueryParams::new()).await.unwrap();
        assert_eq!(store.executed().len(), 1);
    }
}
