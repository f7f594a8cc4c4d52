//! Per-viewer state for the social-graph feeds.
//!
//! A [`UserSession`] holds the expensive per-viewer sets, each in its own
//! hourly cache. Sessions are created on first use and dropped by LRU.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use peruse_core::{Clock, Did, StorageError, SystemClock};
use peruse_storage::{mutex_lock, CacheConfig, QueryParams, QueryStore, RowExt, TtlCache};
use serde::Serialize;

use crate::sql;

pub const USER_SESSION_CAPACITY: usize = 20_000;
pub const SESSION_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// An account the viewer interacts with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseBy {
    pub did: String,
    pub closeness_score: f64,
    pub interaction_type: String,
}

/// An account recommended to the viewer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuggestedFollow {
    pub did: String,
    pub bsky_url: String,
    pub followed_by_count: u64,
}

type SessionCache<T> = TtlCache<(), Arc<[T]>, StorageError>;

/// Cached social-graph sets of one viewer.
pub struct UserSession {
    did: Did,
    following: SessionCache<String>,
    close_by: SessionCache<CloseBy>,
    suggested_follows: SessionCache<SuggestedFollow>,
}

impl UserSession {
    pub fn new(did: Did, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let config = CacheConfig::new().with_ttl(ttl);
        Self {
            did,
            following: TtlCache::with_clock(config.clone(), Arc::clone(&clock)),
            close_by: TtlCache::with_clock(config.clone(), Arc::clone(&clock)),
            suggested_follows: TtlCache::with_clock(config, clock),
        }
    }

    pub fn did(&self) -> &Did {
        &self.did
    }

    fn viewer_params(&self) -> QueryParams {
        QueryParams::new().bind("viewer", self.did.as_str())
    }

    /// Accounts the viewer follows.
    pub async fn following(&self, store: &dyn QueryStore) -> Result<Arc<[String]>, StorageError> {
        self.following
            .get_or_compute((), || async {
                let rows = store.query(sql::FOLLOWING, &self.viewer_params()).await?;
                rows.iter()
                    .map(|row| row.str_column("did").map(str::to_string))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Arc::from)
            })
            .await
    }

    /// Accounts the viewer interacts with, never including the viewer.
    pub async fn close_by(&self, store: &dyn QueryStore) -> Result<Arc<[CloseBy]>, StorageError> {
        self.close_by
            .get_or_compute((), || async {
                let rows = store.query(sql::CLOSE_BY, &self.viewer_params()).await?;
                let mut close_by = Vec::with_capacity(rows.len());
                for row in &rows {
                    let did = row.str_column("did")?;
                    if did == self.did.as_str() {
                        continue;
                    }
                    close_by.push(CloseBy {
                        did: did.to_string(),
                        closeness_score: row.f64_column("closeness_score").unwrap_or_default(),
                        interaction_type: row
                            .str_column("interaction_type")
                            .unwrap_or("unknown")
                            .to_string(),
                    });
                }
                Ok(Arc::from(close_by))
            })
            .await
    }

    /// Accounts recommended to the viewer.
    pub async fn suggested_follows(
        &self,
        store: &dyn QueryStore,
    ) -> Result<Arc<[SuggestedFollow]>, StorageError> {
        self.suggested_follows
            .get_or_compute((), || async {
                let rows = store
                    .query(sql::SUGGESTED_FOLLOWS, &self.viewer_params())
                    .await?;
                rows.iter()
                    .map(|row| {
                        let did = row.str_column("suggested_did")?.to_string();
                        Ok(SuggestedFollow {
                            bsky_url: row
                                .str_column("bsky_url")
                                .map(str::to_string)
                                .unwrap_or_else(|_| format!("https://bsky.app/profile/{did}")),
                            followed_by_count: row
                                .f64_column("followed_by_count")
                                .map(|n| n as u64)
                                .unwrap_or_default(),
                            did,
                        })
                    })
                    .collect::<Result<Vec<_>, StorageError>>()
                    .map(Arc::from)
            })
            .await
    }
}

/// LRU-bounded table of viewer sessions.
pub struct UserManager {
    sessions: Mutex<LruCache<Did, Arc<UserSession>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for UserManager {
    fn default() -> Self {
        Self::new(USER_SESSION_CAPACITY)
    }
}

impl UserManager {
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, SESSION_CACHE_TTL, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let sessions = match NonZeroUsize::new(capacity) {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            sessions: Mutex::new(sessions),
            ttl,
            clock,
        }
    }

    /// The session for `did`, created on first use.
    ///
    /// The table lock is held only for the lookup; session caches carry their
    /// own locks.
    pub fn session(&self, did: &Did) -> Arc<UserSession> {
        let mut sessions = mutex_lock(&self.sessions, "session");
        let session = sessions.get_or_insert(did.clone(), || {
            Arc::new(UserSession::new(
                did.clone(),
                self.ttl,
                Arc::clone(&self.clock),
            ))
        });
        Arc::clone(session)
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.sessions, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
