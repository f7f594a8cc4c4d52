//! HTTP Routes Module
//!
//! Includes:
//! - Feed skeletons, under both the XRPC path and the short alias
//! - Feed generator description and the service DID document
//! - The suggested follows debug page
//! - Health check endpoints

pub mod describe;
pub mod health;
pub mod skeleton;
pub mod suggested;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use describe::create_router as describe_router;
pub use health::create_router as health_router;
pub use skeleton::create_router as skeleton_router;
pub use suggested::create_router as suggested_router;

/// Every route, with request tracing.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(skeleton_router(state.clone()))
        .merge(describe_router(state.clone()))
        .merge(suggested_router(state.clone()))
        .merge(health_router(state))
        .layer(TraceLayer::new_for_http())
}
