//! Chronological posts from accounts recommended to the viewer.

use std::sync::Arc;

use async_trait::async_trait;
use peruse_events::{FeedError, FeedModule, FeedPage, FeedRequest};
use peruse_storage::QueryStore;

use super::chronological_page;
use crate::users::UserManager;

pub struct SuggestedFollowsFeed {
    name: String,
    store: Arc<dyn QueryStore>,
    users: Arc<UserManager>,
}

impl SuggestedFollowsFeed {
    pub fn new(name: impl Into<String>, store: Arc<dyn QueryStore>, users: Arc<UserManager>) -> Self {
        Self {
            name: name.into(),
            store,
            users,
        }
    }
}

#[async_trait]
impl FeedModule for SuggestedFollowsFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_auth(&self) -> bool {
        true
    }

    async fn serve(&self, request: &FeedRequest) -> Result<FeedPage, FeedError> {
        let viewer = request.viewer.as_ref().ok_or(FeedError::AuthRequired)?;
        let suggested = self
            .users
            .session(viewer)
            .suggested_follows(self.store.as_ref())
            .await?;
        let authors = suggested.iter().map(|s| s.did.clone()).collect();
        chronological_page(self.store.as_ref(), authors, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peruse_core::StorageError;
    use peruse_storage::{row, MockQueryStore, QueryParam};
    use peruse_test_utils::fixtures::{self, ALICE, CAROL};
    use serde_json::json;

    fn feed(store: Arc<MockQueryStore>) -> SuggestedFollowsFeed {
        SuggestedFollowsFeed::new("suggested", store, Arc::new(UserManager::new(16)))
    }

    fn as_viewer(did: &str) -> FeedRequest {
        FeedRequest {
            viewer: Some(fixtures::did(did)),
            cursor: Some("3kz".to_string()),
            limit: Some(10),
        }
    }

    #[tokio::test]
    async fn test_pages_through_suggested_authors() {
        let store = Arc::new(MockQueryStore::new());
        store.respond("suggested_did", vec![row([("suggested_did", json!(CAROL))])]);
        store.respond(
            "rkey < {cursor:String}",
            vec![row([
                ("uri", json!(format!("at://{CAROL}/app.bsky.feed.post/3ky"))),
                ("rkey", json!("3ky")),
            ])],
        );

        let page = feed(Arc::clone(&store)).serve(&as_viewer(ALICE)).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.cursor.as_deref(), Some("3ky"));

        let chrono = store
            .queries()
            .into_iter()
            .find(|q| q.sql.contains("rkey < {cursor:String}"))
            .unwrap();
        assert_eq!(chrono.params.get("cursor"), Some(&QueryParam::from("3kz")));
        assert_eq!(chrono.params.get("limit"), Some(&QueryParam::from(10_i64)));
    }

    #[tokio::test]
    async fn test_requires_viewer() {
        let err = feed(Arc::new(MockQueryStore::new()))
            .serve(&FeedRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err, FeedError::AuthRequired);
    }

    #[tokio::test]
    async fn test_store_failure_is_a_backend_error() {
        let store = Arc::new(MockQueryStore::new());
        store.fail_with(Some(StorageError::QueryFailed {
            reason: "down".to_string(),
        }));
        let err = feed(store).serve(&as_viewer(ALICE)).await.unwrap_err();
        assert!(matches!(err, FeedError::Backend(_)));
    }
}
