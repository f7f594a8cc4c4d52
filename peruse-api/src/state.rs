//! Shared application state for Axum routers.

use std::sync::Arc;
use std::time::Instant;

use peruse_core::{Did, IdentityDirectory};
use peruse_events::FeedRegistry;
use peruse_storage::QueryStore;

use crate::auth::AuthVerifier;
use crate::users::UserManager;

/// How this generator identifies itself to the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub service_did: String,
    pub service_endpoint: String,
    /// Account that publishes the feed generator records.
    pub feed_owner: Did,
}

impl ServiceInfo {
    /// AT-URI of the generator record for the feed named `rkey`.
    pub fn feed_uri(&self, rkey: &str) -> String {
        format!("at://{}/app.bsky.feed.generator/{}", self.feed_owner, rkey)
    }
}

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<FeedRegistry>,
    pub verifier: Arc<AuthVerifier>,
    pub users: Arc<UserManager>,
    pub store: Arc<dyn QueryStore>,
    /// Used to resolve handles on the suggested-follows page.
    pub directory: Arc<dyn IdentityDirectory>,
    pub service: Arc<ServiceInfo>,
    pub start_time: Instant,
}

crate::impl_from_ref!(Arc<FeedRegistry>, registry);
crate::impl_from_ref!(Arc<AuthVerifier>, verifier);
crate::impl_from_ref!(Arc<UserManager>, users);
crate::impl_from_ref!(Arc<dyn QueryStore>, store);
crate::impl_from_ref!(Arc<dyn IdentityDirectory>, directory);
crate::impl_from_ref!(Arc<ServiceInfo>, service);
crate::impl_from_ref!(Instant, start_time);
