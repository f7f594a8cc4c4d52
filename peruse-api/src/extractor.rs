//! HTTP client for the named-entity extraction service.

use std::time::Duration;

use async_trait::async_trait;
use peruse_core::{Entity, PeruseError};
use peruse_events::EntityExtractor;
use serde::Serialize;
use tracing::debug;

/// Settings for [`NervanaClient`].
#[derive(Debug, Clone)]
pub struct NervanaConfig {
    pub endpoint: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl NervanaConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    text: &'a str,
}

/// Entity extractor backed by a Nervana deployment.
#[derive(Debug, Clone)]
pub struct NervanaClient {
    client: reqwest::Client,
    config: NervanaConfig,
}

fn extraction_failed(reason: impl ToString) -> PeruseError {
    PeruseError::Extraction {
        reason: reason.to_string(),
    }
}

impl NervanaClient {
    pub fn new(config: NervanaConfig) -> Result<Self, PeruseError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(extraction_failed)?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl EntityExtractor for NervanaClient {
    async fn extract(&self, text: &str) -> Result<Vec<Entity>, PeruseError> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let entities: Vec<Entity> = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&ExtractRequest { text })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(extraction_failed)?
            .json()
            .await
            .map_err(extraction_failed)?;

        debug!(count = entities.len(), "Extracted entities");
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/extract")
    }

    #[tokio::test]
    async fn test_extract_posts_text_with_key() {
        let router = Router::new().route(
            "/extract",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let authorized = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some("Bearer secret");
                if !authorized || body["text"] != "Pike Place in Seattle" {
                    return Err(StatusCode::UNAUTHORIZED);
                }
                Ok(Json(json!([
                    {"entityId": "Q5083", "label": "Seattle", "text": "Seattle"},
                    {"entityId": "Q1426695"}
                ])))
            }),
        );
        let endpoint = serve(router).await;
        let client = NervanaClient::new(NervanaConfig::new(endpoint, "secret")).unwrap();

        let entities = client.extract("Pike Place in Seattle").await.unwrap();
        let ids: Vec<&str> = entities.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["Q5083", "Q1426695"]);
        assert_eq!(entities[0].label.as_deref(), Some("Seattle"));
    }

    #[tokio::test]
    async fn test_error_status_is_an_extraction_failure() {
        let router = Router::new().route(
            "/extract",
            post(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );
        let endpoint = serve(router).await;
        let client = NervanaClient::new(NervanaConfig::new(endpoint, "k")).unwrap();

        let err = client.extract("hello").await.unwrap_err();
        assert!(matches!(err, PeruseError::Extraction { .. }));
    }

    #[tokio::test]
    async fn test_blank_text_skips_the_call() {
        // Nothing listens here; a request would fail.
        let client =
            NervanaClient::new(NervanaConfig::new("http://127.0.0.1:9/extract", "k")).unwrap();
        assert!(client.extract("  ").await.unwrap().is_empty());
    }
}
