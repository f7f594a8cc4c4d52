//! Peruse Core - Identifiers, Events and Errors
//!
//! Shared data types for the feed generator. Every other crate depends on this
//! one; it carries no I/O, only the traits I/O adapters implement.

pub mod clock;
pub mod error;
pub mod event;
pub mod identity;
pub mod keys;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{
    ConfigError, IdentityError, PeruseError, PeruseResult, StorageError, StreamError,
    ValidationError,
};
pub use event::{
    derive_created_at, parse_timestamp, CommitEvent, Collection, DecodedRecord, Entity, OpAction,
    RecordOp,
};
pub use identity::{AtUri, Cid, Did, RepoPath, Tid};
pub use keys::{IdentityDirectory, KeyType, PublicKey, SignatureError};

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
