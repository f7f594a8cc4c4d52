//! ClickHouse adapter over its HTTP interface.
//!
//! Statements are POSTed as the request body. Named placeholders written as
//! `{name:Type}` in the SQL are bound through `param_<name>` query arguments,
//! and row-returning queries are read back as `JSONEachRow`.

use std::time::Duration;

use async_trait::async_trait;
use peruse_core::StorageError;
use reqwest::Client;
use tracing::{debug, warn};

use crate::query::{QueryParam, QueryParams, QueryStore, Row};

/// Connection settings for [`ClickHouseStore`].
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    /// Base URL, e.g. `http://localhost:8123`.
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
    pub timeout: Duration,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "default".to_string(),
            user: "default".to_string(),
            password: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Query store backed by a ClickHouse server.
#[derive(Debug, Clone)]
pub struct ClickHouseStore {
    client: Client,
    config: ClickHouseConfig,
}

impl ClickHouseStore {
    pub fn new(config: ClickHouseConfig) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StorageError::QueryFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, config })
    }

    /// Check that the server answers.
    pub async fn ping(&self) -> Result<(), StorageError> {
        self.execute("SELECT 1", &QueryParams::new()).await
    }

    async fn send(&self, body: String, params: &QueryParams) -> Result<String, StorageError> {
        let mut args: Vec<(String, String)> =
            vec![("database".to_string(), self.config.database.clone())];
        args.extend(
            params
                .iter()
                .map(|(name, value)| (format!("param_{name}"), encode_param(value))),
        );

        let response = self
            .client
            .post(&self.config.url)
            .query(&args)
            .header("X-ClickHouse-User", &self.config.user)
            .header("X-ClickHouse-Key", &self.config.password)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::QueryFailed {
                reason: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| StorageError::QueryFailed {
            reason: e.to_string(),
        })?;
        if !status.is_success() {
            warn!(status = %status, "ClickHouse rejected statement");
            return Err(StorageError::QueryFailed {
                reason: format!("HTTP {status}: {}", text.trim()),
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl QueryStore for ClickHouseStore {
    async fn query(&self, sql: &str, params: &QueryParams) -> Result<Vec<Row>, StorageError> {
        let body = format!("{} FORMAT JSONEachRow", sql.trim().trim_end_matches(';'));
        let text = self.send(body, params).await?;
        let rows = parse_json_each_row(&text)?;
        debug!(rows = rows.len(), "ClickHouse query returned");
        Ok(rows)
    }

    async fn execute(&self, sql: &str, params: &QueryParams) -> Result<(), StorageError> {
        self.send(sql.to_string(), params).await.map(|_| ())
    }
}

/// Encode a parameter the way ClickHouse expects it in `param_*` arguments.
fn encode_param(value: &QueryParam) -> String {
    match value {
        QueryParam::String(s) => s.clone(),
        QueryParam::Int(i) => i.to_string(),
        QueryParam::Float(f) => f.to_string(),
        QueryParam::StringArray(items) => {
            let quoted: Vec<String> = items
                .iter()
                .map(|s| format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")))
                .collect();
            format!("[{}]", quoted.join(","))
        }
    }
}

fn parse_json_each_row(text: &str) -> Result<Vec<Row>, StorageError> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<Row>(line).map_err(|e| StorageError::RowDecode {
                column: "*".to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}
