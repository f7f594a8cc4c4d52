//! Feed modules served by this generator.
//!
//! Topic feeds rank posts classified into their table during ingestion. The
//! social-graph feeds page chronologically through posts by a per-viewer set
//! of authors.

pub mod close_by;
pub mod suggested;
pub mod topic;

pub use close_by::CloseByFeed;
pub use suggested::SuggestedFollowsFeed;
pub use topic::{TopicEntity, TopicFeed, TopicFeedConfig};

use peruse_events::{FeedError, FeedPage, FeedRequest};
use peruse_storage::{QueryParams, QueryStore, RowExt};
use tracing::debug;

use crate::sql;

/// Cursor used when a chronological feed is requested from the top.
pub const DEFAULT_CHRONO_CURSOR: &str = "9999999999999";
pub const CHRONO_PAGE_SIZE: usize = 50;

/// Record keys are short and drawn from a restricted alphabet.
fn valid_rkey_cursor(cursor: &str) -> bool {
    !cursor.is_empty()
        && cursor.len() <= 512
        && cursor
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b':' | b'~'))
}

/// One page of top-level posts by `authors`, newest first, keyed by record key.
pub(crate) async fn chronological_page(
    store: &dyn QueryStore,
    authors: Vec<String>,
    request: &FeedRequest,
) -> Result<FeedPage, FeedError> {
    let cursor = match request.cursor.as_deref() {
        None | Some("") => DEFAULT_CHRONO_CURSOR,
        Some(cursor) if valid_rkey_cursor(cursor) => cursor,
        Some(cursor) => {
            return Err(FeedError::InvalidCursor {
                value: cursor.to_string(),
            })
        }
    };

    if authors.is_empty() {
        return Err(FeedError::unavailable("Not enough posts"));
    }

    let limit = request.page_size(CHRONO_PAGE_SIZE);
    let params = QueryParams::new()
        .bind("authors", authors)
        .bind("cursor", cursor)
        .bind("limit", limit as i64);
    let rows = store.query(sql::CHRONOLOGICAL_POSTS, &params).await?;
    if rows.is_empty() {
        return Err(FeedError::unavailable("Not enough posts"));
    }

    let mut posts = Vec::with_capacity(rows.len());
    let mut last_rkey = None;
    for row in &rows {
        let uri = row.str_column("uri")?;
        let rkey = match row.str_column("rkey") {
            Ok(rkey) => rkey,
            Err(_) => uri.rsplit('/').next().unwrap_or(uri),
        };
        last_rkey = Some(rkey.to_string());
        posts.push(uri.to_string());
    }

    debug!(posts = posts.len(), cursor, "Served chronological page");
    Ok(FeedPage::new(posts, last_rkey))
}

#[cfg(test)]
mod tests {
    use super::*;
    use peruse_storage::{row, MockQueryStore, QueryParam};
    use serde_json::json;

    fn authors() -> Vec<String> {
        vec!["did:plc:a".to_string(), "did:plc:b".to_string()]
    }

    #[tokio::test]
    async fn test_first_page_uses_default_cursor_and_last_rkey() {
        let store = MockQueryStore::new();
        store.respond(
            "rkey < {cursor:String}",
            vec![
                row([("uri", json!("at://did:plc:a/app.bsky.feed.post/3kb")), ("rkey", json!("3kb"))]),
                row([("uri", json!("at://did:plc:b/app.bsky.feed.post/3ka")), ("rkey", json!("3ka"))]),
            ],
        );

        let page = chronological_page(&store, authors(), &FeedRequest::default())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.cursor.as_deref(), Some("3ka"));

        let executed = store.queries();
        assert_eq!(
            executed[0].params.get("cursor"),
            Some(&QueryParam::from(DEFAULT_CHRONO_CURSOR))
        );
        assert_eq!(executed[0].params.get("limit"), Some(&QueryParam::from(50_i64)));
    }

    #[tokio::test]
    async fn test_cursor_falls_back_to_uri_tail() {
        let store = MockQueryStore::new();
        store.respond(
            "default.post",
            vec![row([("uri", json!("at://did:plc:a/app.bsky.feed.post/3kz"))])],
        );
        let request = FeedRequest {
            cursor: Some("3kzz".to_string()),
            ..FeedRequest::default()
        };
        let page = chronological_page(&store, authors(), &request).await.unwrap();
        assert_eq!(page.cursor.as_deref(), Some("3kz"));
    }

    #[tokio::test]
    async fn test_empty_page_is_a_feed_error() {
        let store = MockQueryStore::new();
        let err = chronological_page(&store, authors(), &FeedRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err, FeedError::unavailable("Not enough posts"));
    }

    #[tokio::test]
    async fn test_no_authors_skips_the_query() {
        let store = MockQueryStore::new();
        let err = chronological_page(&store, Vec::new(), &FeedRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err, FeedError::unavailable("Not enough posts"));
        assert!(store.queries().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_cursor_rejected() {
        let store = MockQueryStore::new();
        let request = FeedRequest {
            cursor: Some("' OR 1=1 --".to_string()),
            ..FeedRequest::default()
        };
        let err = chronological_page(&store, authors(), &request).await.unwrap_err();
        assert!(matches!(err, FeedError::InvalidCursor { .. }));
    }
}
