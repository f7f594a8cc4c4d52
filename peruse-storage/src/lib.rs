//! Peruse Storage - Caches, Cursor Persistence and Query Stores
//!
//! In-process caching primitives plus the two pieces of durable state the feed
//! generator touches: the relay cursor and the analytical store.

pub mod cache;
pub mod clickhouse;
pub mod cursor;
pub mod query;

pub use cache::{mutex_lock, CacheConfig, CacheEntry, TtlCache};
pub use clickhouse::{ClickHouseConfig, ClickHouseStore};
pub use cursor::{CursorStore, FileCursorStore, MemoryCursorStore};
pub use query::{
    row, MockQueryStore, QueryParam, QueryParams, QueryStore, RecordedStatement, Row, RowExt,
};
