//! Feed skeleton endpoint.
//!
//! The requested feed is picked by the record key of its generator AT-URI.
//! Identity-scoped feeds authenticate the caller first; any failure there is
//! answered with `AuthRequired`.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    routing::get,
    Json, Router,
};
use peruse_core::AtUri;
use peruse_events::{FeedPage, FeedRegistry, FeedRequest};
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::auth::AuthVerifier;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct SkeletonParams {
    pub feed: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<String>,
}

/// GET /xrpc/app.bsky.feed.getFeedSkeleton
pub async fn get_feed_skeleton(
    State(registry): State<Arc<FeedRegistry>>,
    State(verifier): State<Arc<AuthVerifier>>,
    headers: HeaderMap,
    Query(params): Query<SkeletonParams>,
) -> ApiResult<Json<FeedPage>> {
    let feed_uri = params.feed.as_deref().ok_or_else(ApiError::invalid_feed)?;
    let uri = AtUri::parse(feed_uri).map_err(|_| ApiError::invalid_feed())?;
    let rkey = uri.rkey().ok_or_else(ApiError::invalid_feed)?;

    let module = registry.get(rkey).ok_or_else(|| {
        warn!(feed = %feed_uri, "Requested feed is not registered");
        ApiError::feed_not_found()
    })?;

    let limit = match params.limit.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<usize>()
                .map_err(|_| ApiError::invalid_input(format!("Invalid limit {raw:?}")))?,
        ),
    };

    let viewer = if module.requires_auth() {
        match verifier.verify_headers(&headers).await {
            Ok(did) => Some(did),
            Err(e) => {
                debug!(feed = %rkey, error = %e, "Rejected feed request");
                return Err(e.into());
            }
        }
    } else {
        None
    };

    let request = FeedRequest {
        viewer,
        cursor: params.cursor.filter(|c| !c.is_empty()),
        limit,
    };
    let page = module.serve(&request).await.map_err(|e| {
        error!(feed = %rkey, error = %e, "Failed to serve feed");
        ApiError::from(e)
    })?;
    Ok(Json(page))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/xrpc/app.bsky.feed.getFeedSkeleton", get(get_feed_skeleton))
        .route("/feed/getSkeleton", get(get_feed_skeleton))
        .with_state(state)
}
