//! The feed module contract.

use async_trait::async_trait;
use peruse_core::{DecodedRecord, Did};
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// A request for one page of a feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedRequest {
    /// Authenticated caller, if any.
    pub viewer: Option<Did>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

impl FeedRequest {
    /// Page size to use, honouring the caller's limit when it is smaller.
    pub fn page_size(&self, default: usize) -> usize {
        self.limit
            .filter(|l| *l > 0)
            .map_or(default, |l| l.min(default))
    }
}

/// A single post reference in a feed skeleton.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkeletonItem {
    pub post: String,
}

/// One page of a feed skeleton.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedPage {
    #[serde(rename = "feed")]
    pub items: Vec<SkeletonItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl FeedPage {
    pub fn new(posts: impl IntoIterator<Item = String>, cursor: Option<String>) -> Self {
        Self {
            items: posts.into_iter().map(|post| SkeletonItem { post }).collect(),
            cursor,
        }
    }
}

/// A pluggable feed: serves pages and optionally ingests new records.
#[async_trait]
pub trait FeedModule: Send + Sync {
    /// Unique name; also the record key of the feed's generator URI.
    fn name(&self) -> &str;

    /// Whether `serve` needs an authenticated viewer.
    fn requires_auth(&self) -> bool {
        false
    }

    async fn serve(&self, request: &FeedRequest) -> Result<FeedPage, FeedError>;

    /// Called once for every newly created record of a dispatched collection.
    async fn on_create(&self, _record: &DecodedRecord) -> Result<(), FeedError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_clamps_to_default() {
        let mut req = FeedRequest::default();
        assert_eq!(req.page_size(30), 30);
        req.limit = Some(10);
        assert_eq!(req.page_size(30), 10);
        req.limit = Some(100);
        assert_eq!(req.page_size(30), 30);
        req.limit = Some(0);
        assert_eq!(req.page_size(30), 30);
    }

    #[test]
    fn test_page_serializes_as_skeleton() {
        let page = FeedPage::new(vec!["at://a".to_string()], Some("30".to_string()));
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"feed": [{"post": "at://a"}], "cursor": "30"})
        );

        let no_cursor = serde_json::to_value(FeedPage::new(Vec::new(), None)).unwrap();
        assert_eq!(no_cursor, serde_json::json!({"feed": []}));
    }
}
