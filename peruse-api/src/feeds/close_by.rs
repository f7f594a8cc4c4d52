//! Chronological posts from the accounts a viewer interacts with most.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use peruse_events::{FeedError, FeedModule, FeedPage, FeedRequest};
use peruse_storage::QueryStore;
use tracing::debug;

use super::chronological_page;
use crate::users::UserManager;

/// Below this many close accounts the viewer's follows are mixed in.
pub const MIN_CLOSE_ACCOUNTS: usize = 10;

pub struct CloseByFeed {
    name: String,
    store: Arc<dyn QueryStore>,
    users: Arc<UserManager>,
}

impl CloseByFeed {
    pub fn new(name: impl Into<String>, store: Arc<dyn QueryStore>, users: Arc<UserManager>) -> Self {
        Self {
            name: name.into(),
            store,
            users,
        }
    }
}

#[async_trait]
impl FeedModule for CloseByFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_auth(&self) -> bool {
        true
    }

    async fn serve(&self, request: &FeedRequest) -> Result<FeedPage, FeedError> {
        let viewer = request.viewer.as_ref().ok_or(FeedError::AuthRequired)?;
        let session = self.users.session(viewer);

        let close_by = session.close_by(self.store.as_ref()).await?;
        let mut seen = HashSet::with_capacity(close_by.len());
        let mut authors: Vec<String> = close_by
            .iter()
            .filter(|c| seen.insert(c.did.clone()))
            .map(|c| c.did.clone())
            .collect();

        if authors.len() < MIN_CLOSE_ACCOUNTS {
            let following = session.following(self.store.as_ref()).await?;
            authors.extend(
                following
                    .iter()
                    .filter(|did| did.as_str() != viewer.as_str() && seen.insert((*did).clone()))
                    .cloned(),
            );
        }

        debug!(viewer = %viewer, authors = authors.len(), "Serving close-by feed");
        chronological_page(self.store.as_ref(), authors, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::SESSION_CACHE_TTL;
    use peruse_storage::{row, MockQueryStore, QueryParam};
    use peruse_test_utils::fixtures::{self, ALICE, BOB, CAROL};
    use serde_json::json;

    fn feed(store: Arc<MockQueryStore>) -> CloseByFeed {
        let users = Arc::new(UserManager::with_clock(
            16,
            SESSION_CACHE_TTL,
            Arc::new(fixtures::clock()),
        ));
        CloseByFeed::new("chrono", store, users)
    }

    fn as_viewer(did: &str) -> FeedRequest {
        FeedRequest {
            viewer: Some(fixtures::did(did)),
            ..FeedRequest::default()
        }
    }

    fn posts_row() -> peruse_storage::Row {
        row([
            ("uri", json!(format!("at://{BOB}/app.bsky.feed.post/3kb"))),
            ("rkey", json!("3kb")),
        ])
    }

    #[tokio::test]
    async fn test_anonymous_request_requires_auth() {
        let feed = feed(Arc::new(MockQueryStore::new()));
        assert!(feed.requires_auth());
        let err = feed.serve(&FeedRequest::default()).await.unwrap_err();
        assert_eq!(err, FeedError::AuthRequired);
    }

    #[tokio::test]
    async fn test_authors_exclude_viewer_and_include_follows() {
        let store = Arc::new(MockQueryStore::new());
        store.respond(
            "my_did",
            vec![
                row([("did", json!(ALICE))]),
                row([("did", json!(BOB))]),
            ],
        );
        store.respond(
            "default.follow\nWHERE did",
            vec![row([("did", json!(BOB))]), row([("did", json!(CAROL))])],
        );
        store.respond("rkey < {cursor:String}", vec![posts_row()]);

        let page = feed(Arc::clone(&store)).serve(&as_viewer(ALICE)).await.unwrap();
        assert_eq!(page.cursor.as_deref(), Some("3kb"));

        let chrono = store
            .queries()
            .into_iter()
            .find(|q| q.sql.contains("rkey < {cursor:String}"))
            .unwrap();
        assert_eq!(
            chrono.params.get("authors"),
            Some(&QueryParam::from(vec![BOB.to_string(), CAROL.to_string()]))
        );
    }

    #[tokio::test]
    async fn test_enough_close_accounts_skip_follows() {
        let store = Arc::new(MockQueryStore::new());
        let close: Vec<_> = (0..MIN_CLOSE_ACCOUNTS)
            .map(|i| row([("did", json!(format!("did:plc:close{i}")))]))
            .collect();
        store.respond("my_did", close);
        store.respond("rkey < {cursor:String}", vec![posts_row()]);

        feed(Arc::clone(&store)).serve(&as_viewer(ALICE)).await.unwrap();
        assert_eq!(store.query_count("default.follow\nWHERE did"), 0);
    }

    #[tokio::test]
    async fn test_nobody_close_is_not_enough_posts() {
        let store = Arc::new(MockQueryStore::new());
        let err = feed(store).serve(&as_viewer(ALICE)).await.unwrap_err();
        assert_eq!(err, FeedError::unavailable("Not enough posts"));
    }
}
