//! Relay stream events and the decoded records handed to feed modules.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;
use crate::identity::{AtUri, Cid, Did, Tid};

/// Records older than this are considered to carry a bogus timestamp.
const MAX_PAST_DAYS: i64 = 365 * 5;

/// Records further in the future than this are considered to carry a bogus timestamp.
const MAX_FUTURE_DAYS: i64 = 200;

// ============================================================================
// STREAM EVENTS
// ============================================================================

/// Kind of change a record operation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpAction {
    Create,
    Update,
    Delete,
}

/// One record-level operation inside a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOp {
    pub action: OpAction,
    pub path: String,
    /// Content identifier the event claims for the new record.
    pub cid: Option<Cid>,
}

/// One commit to a repository as delivered by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    pub repo: String,
    pub seq: i64,
    pub rev: String,
    pub time: String,
    pub too_big: bool,
    pub ops: Vec<RecordOp>,
    /// Block set carrying the records referenced by `ops`, in the codec's encoding.
    pub blocks: Vec<u8>,
}

// ============================================================================
// COLLECTIONS
// ============================================================================

/// Record collection, with the ones feed modules care about broken out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Collection {
    Post,
    Like,
    Repost,
    Other(String),
}

impl Collection {
    pub const POST: &'static str = "app.bsky.feed.post";
    pub const LIKE: &'static str = "app.bsky.feed.like";
    pub const REPOST: &'static str = "app.bsky.feed.repost";

    pub fn from_nsid(nsid: &str) -> Self {
        match nsid {
            Self::POST => Collection::Post,
            Self::LIKE => Collection::Like,
            Self::REPOST => Collection::Repost,
            other => Collection::Other(other.to_string()),
        }
    }

    pub fn as_nsid(&self) -> &str {
        match self {
            Collection::Post => Self::POST,
            Collection::Like => Self::LIKE,
            Collection::Repost => Self::REPOST,
            Collection::Other(nsid) => nsid,
        }
    }

    /// Whether records of this collection are fanned out to feed modules.
    pub fn is_dispatched(&self) -> bool {
        !matches!(self, Collection::Other(_))
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_nsid())
    }
}

// ============================================================================
// NAMED ENTITIES
// ============================================================================

/// A named entity found in post text, identified by its knowledge-base id (e.g. `Q5`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub entity_id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

// ============================================================================
// DECODED RECORD
// ============================================================================

/// A newly created record, verified against its block and ready for fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub collection: Collection,
    pub uri: AtUri,
    pub author: Did,
    pub rkey: String,
    pub cid: Cid,
    pub indexed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub entities: Vec<Entity>,
}

impl DecodedRecord {
    /// Post text, if the record has any.
    pub fn text(&self) -> Option<&str> {
        self.payload.get("text").and_then(|t| t.as_str())
    }

    /// Whether the record is a reply to another post.
    pub fn is_reply(&self) -> bool {
        self.payload.get("reply").is_some_and(|r| !r.is_null())
    }
}

// ============================================================================
// TIMESTAMPS
// ============================================================================

/// Parse the loosely formatted timestamps found in the wild.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(ValidationError::InvalidTimestamp {
        value: value.to_string(),
    })
}

fn in_range(ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    if ts < now {
        now - ts <= ChronoDuration::days(MAX_PAST_DAYS)
    } else {
        ts - now <= ChronoDuration::days(MAX_FUTURE_DAYS)
    }
}

/// Work out when a record was created.
///
/// The record's own `createdAt` wins when it is plausible. Otherwise posts fall
/// back to the record key's TID and then to `now`; likes and reposts fall back
/// to the TID only.
pub fn derive_created_at(
    collection: &Collection,
    payload: &serde_json::Value,
    uri: &AtUri,
    rkey: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ValidationError> {
    let rkey_time = if rkey == "self" {
        None
    } else {
        Tid::parse(rkey).ok().and_then(|tid| tid.timestamp())
    };

    let declared = || -> Result<DateTime<Utc>, ValidationError> {
        let raw = payload
            .get("createdAt")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ValidationError::InvalidTimestamp {
                value: String::new(),
            })?;
        parse_timestamp(raw)
    };

    match collection {
        Collection::Post => {
            let ts = declared()?;
            if in_range(ts, now) {
                return Ok(ts);
            }
            Ok(rkey_time.filter(|t| in_range(*t, now)).unwrap_or(now))
        }
        Collection::Like | Collection::Repost => {
            let ts = declared()?;
            if in_range(ts, now) {
                return Ok(ts);
            }
            rkey_time.ok_or_else(|| ValidationError::MissingTimestamp {
                uri: uri.to_string(),
            })
        }
        Collection::Other(_) => Ok(rkey_time.filter(|t| in_range(*t, now)).unwrap_or(now)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn uri() -> AtUri {
        let did = Did::parse("did:plc:abc123").unwrap();
        AtUri::for_record(&did, Collection::POST, "3kq2sneqbkm2a")
    }

    #[test]
    fn test_collection_mapping() {
        assert_eq!(Collection::from_nsid("app.bsky.feed.post"), Collection::Post);
        assert_eq!(Collection::from_nsid("app.bsky.feed.like"), Collection::Like);
        assert!(Collection::Repost.is_dispatched());
        let follow = Collection::from_nsid("app.bsky.graph.follow");
        assert!(!follow.is_dispatched());
        assert_eq!(follow.as_nsid(), "app.bsky.graph.follow");
    }

    #[test]
    fn test_record_helpers() {
        let record = DecodedRecord {
            collection: Collection::Post,
            uri: uri(),
            author: Did::parse("did:plc:abc123").unwrap(),
            rkey: "3kq2sneqbkm2a".to_string(),
            cid: Cid::new("sha256:00"),
            indexed_at: now(),
            created_at: now(),
            payload: json!({"text": "hello", "reply": {"root": {}}}),
            entities: vec![],
        };
        assert_eq!(record.text(), Some("hello"));
        assert!(record.is_reply());
    }

    #[test]
    fn test_created_at_prefers_declared_timestamp() {
        let payload = json!({"createdAt": "2024-05-31T10:00:00.000Z"});
        let ts = derive_created_at(&Collection::Post, &payload, &uri(), "3kq2sneqbkm2a", now())
            .unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 5, 31, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_created_at_falls_back_to_tid_for_posts() {
        let payload = json!({"createdAt": "1970-01-01T00:00:00Z"});
        let ts = derive_created_at(&Collection::Post, &payload, &uri(), "3kq2sneqbkm2a", now())
            .unwrap();
        assert_eq!(ts.format("%Y-%m-%d").to_string(), "2024-04-14");
    }

    #[test]
    fn test_created_at_falls_back_to_now_without_tid() {
        let payload = json!({"createdAt": "1970-01-01T00:00:00Z"});
        let ts = derive_created_at(&Collection::Post, &payload, &uri(), "self", now()).unwrap();
        assert_eq!(ts, now());
    }

    #[test]
    fn test_like_without_usable_timestamp_fails() {
        let payload = json!({"createdAt": "1970-01-01T00:00:00Z"});
        let err = derive_created_at(&Collection::Like, &payload, &uri(), "self", now());
        assert!(matches!(err, Err(ValidationError::MissingTimestamp { .. })));
    }

    #[test]
    fn test_parse_timestamp_lenient_formats() {
        assert!(parse_timestamp("2024-05-31T10:00:00Z").is_ok());
        assert!(parse_timestamp("2024-05-31T10:00:00.123456").is_ok());
        assert!(parse_timestamp("2024-05-31 10:00:00").is_ok());
        assert!(parse_timestamp("yesterday").is_err());
    }
}
