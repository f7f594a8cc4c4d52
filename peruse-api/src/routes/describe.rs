//! Feed generator metadata: the feed list and the service's DID document.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use peruse_events::FeedRegistry;
use serde::{Deserialize, Serialize};

use crate::state::{AppState, ServiceInfo};

pub const SERVICE_ID: &str = "#bsky_fg";
pub const SERVICE_TYPE: &str = "BskyFeedGenerator";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DescribeResponse {
    pub did: String,
    pub feeds: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DidDocument {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub id: String,
    pub service: Vec<DidService>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DidService {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub service_endpoint: String,
}

/// GET /xrpc/app.bsky.feed.describeFeedGenerator
pub async fn describe_feed_generator(
    State(service): State<Arc<ServiceInfo>>,
    State(registry): State<Arc<FeedRegistry>>,
) -> Json<DescribeResponse> {
    Json(DescribeResponse {
        did: service.service_did.clone(),
        feeds: registry.names().map(|name| service.feed_uri(name)).collect(),
    })
}

/// GET /.well-known/did.json
pub async fn did_document(State(service): State<Arc<ServiceInfo>>) -> Json<DidDocument> {
    Json(DidDocument {
        context: vec!["https://www.w3.org/ns/did/v1".to_string()],
        id: service.service_did.clone(),
        service: vec![DidService {
            id: SERVICE_ID.to_string(),
            kind: SERVICE_TYPE.to_string(),
            service_endpoint: service.service_endpoint.clone(),
        }],
    })
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/xrpc/app.bsky.feed.describeFeedGenerator",
            get(describe_feed_generator),
        )
        .route("/feed/describe", get(describe_feed_generator))
        .route("/.well-known/did.json", get(did_document))
        .route("/.well-known/did-config", get(did_document))
        .with_state(state)
}
