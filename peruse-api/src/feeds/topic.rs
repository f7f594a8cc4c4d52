//! Entity-classified topic feeds.
//!
//! New top-level posts whose extracted entities match the feed's entity set
//! are recorded in the feed's table. Serving ranks that table by likes decayed
//! with age and pages through the ranking by offset.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peruse_core::{Clock, Collection, ConfigError, DecodedRecord, Entity, StorageError, SystemClock};
use peruse_events::{FeedError, FeedModule, FeedPage, FeedRequest};
use peruse_storage::{CacheConfig, QueryParams, QueryStore, RowExt, TtlCache};
use serde::Deserialize;
use tracing::{debug, info};

use crate::sql;

pub const TOPIC_PAGE_SIZE: usize = 30;
pub const RANKING_TTL: Duration = Duration::from_secs(60);

/// Knowledge-base id of the "human" class.
pub const HUMAN_ENTITY: &str = "Q5";

/// One entity of a topic, as listed in the topic's entities file.
///
/// Fields may be full knowledge-base URLs; only the trailing id is kept.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicEntity {
    pub entity: String,
    #[serde(default)]
    pub property: String,
    #[serde(default)]
    pub instance_of: String,
}

fn last_segment(value: &str) -> &str {
    value.rsplit('/').next().unwrap_or(value)
}

impl TopicEntity {
    fn normalized(&self) -> Self {
        Self {
            entity: last_segment(&self.entity).to_string(),
            property: last_segment(&self.property).to_string(),
            instance_of: last_segment(&self.instance_of).to_string(),
        }
    }

    /// Parse a JSON array of entities.
    pub fn parse_list(json: &str) -> Result<Vec<TopicEntity>, serde_json::Error> {
        let raw: Vec<TopicEntity> = serde_json::from_str(json)?;
        Ok(raw
            .iter()
            .map(TopicEntity::normalized)
            .filter(|e| !e.entity.is_empty())
            .collect())
    }

    pub fn load(path: &Path) -> Result<Vec<TopicEntity>, ConfigError> {
        let failed = |reason: String| ConfigError::FileLoad {
            path: path.display().to_string(),
            reason,
        };
        let json = std::fs::read_to_string(path).map_err(|e| failed(e.to_string()))?;
        Self::parse_list(&json).map_err(|e| failed(e.to_string()))
    }
}

/// One `[[feed]]` entry of the topic feeds file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopicFeedConfig {
    pub name: String,
    pub table: String,
    /// JSON entities file, relative to the topic feeds file.
    pub entities: PathBuf,
}

#[derive(Debug, Deserialize)]
struct TopicFeedsFile {
    #[serde(default)]
    feed: Vec<TopicFeedConfig>,
}

impl TopicFeedConfig {
    /// Read every `[[feed]]` entry from a TOML file.
    pub fn load_all(path: &Path) -> Result<Vec<TopicFeedConfig>, ConfigError> {
        let failed = |reason: String| ConfigError::FileLoad {
            path: path.display().to_string(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| failed(e.to_string()))?;
        let file: TopicFeedsFile = toml::from_str(&text).map_err(|e| failed(e.to_string()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        file.feed
            .into_iter()
            .map(|mut feed| {
                feed.validate()?;
                if feed.entities.is_relative() {
                    feed.entities = base.join(&feed.entities);
                }
                Ok(feed)
            })
            .collect()
    }

    /// Table names are spliced into SQL as identifiers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid = !self.table.is_empty()
            && self
                .table
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.');
        if !valid {
            return Err(ConfigError::InvalidValue {
                field: format!("feed.{}.table", self.name),
                value: self.table.clone(),
                reason: "must be a plain table identifier".to_string(),
            });
        }
        if self.name.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "feed.name".to_string(),
            });
        }
        Ok(())
    }
}

/// A feed of posts about one topic.
pub struct TopicFeed {
    name: String,
    table: String,
    entities: HashMap<String, TopicEntity>,
    store: Arc<dyn QueryStore>,
    ranked: TtlCache<(), Arc<[String]>, StorageError>,
}

impl TopicFeed {
    pub fn new(
        config: &TopicFeedConfig,
        entities: Vec<TopicEntity>,
        store: Arc<dyn QueryStore>,
    ) -> Self {
        Self::with_clock(config, entities, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &TopicFeedConfig,
        entities: Vec<TopicEntity>,
        store: Arc<dyn QueryStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let entities = entities
            .into_iter()
            .map(|e| (e.entity.clone(), e))
            .collect::<HashMap<_, _>>();
        info!(feed = %config.name, table = %config.table, entities = entities.len(), "Loaded topic feed");
        Self {
            name: config.name.clone(),
            table: config.table.clone(),
            entities,
            store,
            ranked: TtlCache::with_clock(CacheConfig::new().with_ttl(RANKING_TTL), clock),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Whether a post mentioning `found` belongs in this feed.
    ///
    /// At least one entity must be part of the topic. A lone person is not
    /// enough on its own; names collide too often.
    pub fn should_include(&self, found: &[Entity]) -> bool {
        let relevant: Vec<&TopicEntity> = found
            .iter()
            .filter_map(|e| self.entities.get(&e.entity_id))
            .collect();
        if relevant.is_empty() {
            return false;
        }
        !(relevant.len() < 2 && relevant.iter().any(|e| e.instance_of == HUMAN_ENTITY))
    }

    async fn ranked_posts(&self) -> Result<Arc<[String]>, StorageError> {
        self.ranked
            .get_or_compute((), || async {
                let params = QueryParams::new().bind("table", self.table.as_str());
                let rows = self.store.query(sql::TOPIC_RANKED, &params).await?;
                debug!(feed = %self.name, posts = rows.len(), "Refreshed topic ranking");
                rows.iter()
                    .map(|row| row.str_column("uri").map(str::to_string))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Arc::from)
            })
            .await
    }
}

#[async_trait]
impl FeedModule for TopicFeed {
    fn name(&self) -> &str {
        &self.name
    }

    async fn serve(&self, request: &FeedRequest) -> Result<FeedPage, FeedError> {
        let offset = match request.cursor.as_deref() {
            None | Some("") => 0,
            Some(cursor) => cursor.parse::<usize>().map_err(|_| FeedError::InvalidCursor {
                value: cursor.to_string(),
            })?,
        };

        let posts = self.ranked_posts().await?;
        let start = offset.min(posts.len());
        let end = (start + request.page_size(TOPIC_PAGE_SIZE)).min(posts.len());
        let page = &posts[start..end];

        Ok(FeedPage::new(
            page.iter().cloned(),
            Some((start + page.len()).to_string()),
        ))
    }

    async fn on_create(&self, record: &DecodedRecord) -> Result<(), FeedError> {
        if record.collection != Collection::Post || record.is_reply() {
            return Ok(());
        }
        if record.text().map_or(true, str::is_empty) {
            return Ok(());
        }
        if !self.should_include(&record.entities) {
            return Ok(());
        }

        let params = QueryParams::new()
            .bind("table", self.table.as_str())
            .bind("uri", record.uri.to_string())
            .bind(
                "created_at",
                record.indexed_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            );
        self.store.execute(sql::TOPIC_INSERT, &params).await?;
        debug!(feed = %self.name, uri = %record.uri, "Added post to topic feed");
        Ok(())
    }
}
