//! Protocol identifiers: DIDs, AT-URIs, repo paths, record keys, TIDs and CIDs.
//!
//! These are validated newtypes. Parsing is strict; anything that reaches the
//! rest of the system through one of these types is well-formed.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Maximum DID length accepted by the protocol.
const MAX_DID_LEN: usize = 2048;

/// Maximum record key length.
const MAX_RKEY_LEN: usize = 512;

/// Base32-sortable alphabet used by TIDs.
const TID_ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";

// ============================================================================
// DID
// ============================================================================

/// A decentralized identifier such as `did:plc:ewvi7nxzyoun6zhxrhs64oiz`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Did(String);

impl Did {
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidDid {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        if value.len() > MAX_DID_LEN {
            return Err(invalid("too long"));
        }
        let rest = value
            .strip_prefix("did:")
            .ok_or_else(|| invalid("missing did: prefix"))?;
        let (method, identifier) = rest
            .split_once(':')
            .ok_or_else(|| invalid("missing method separator"))?;

        if method.is_empty() || !method.bytes().all(|b| b.is_ascii_lowercase()) {
            return Err(invalid("method must be lowercase letters"));
        }
        if identifier.is_empty() {
            return Err(invalid("empty method-specific identifier"));
        }
        if !identifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'%' | b'-'))
        {
            return Err(invalid("identifier contains disallowed characters"));
        }
        if identifier.ends_with(':') || identifier.ends_with('%') {
            return Err(invalid("identifier has a trailing ':' or '%'"));
        }

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// DID method, e.g. `plc` or `web`.
    pub fn method(&self) -> &str {
        self.0[4..].split(':').next().unwrap_or_default()
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Did {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Did {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Did> for String {
    fn from(did: Did) -> Self {
        did.0
    }
}

// ============================================================================
// RECORD KEY / COLLECTION / REPO PATH
// ============================================================================

/// Validate a record key.
fn valid_record_key(rkey: &str) -> bool {
    !rkey.is_empty()
        && rkey.len() <= MAX_RKEY_LEN
        && rkey != "."
        && rkey != ".."
        && rkey
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'~' | b'-'))
}

/// Validate a namespaced collection identifier (NSID) such as `app.bsky.feed.post`.
fn valid_nsid(nsid: &str) -> bool {
    let segments: Vec<&str> = nsid.split('.').collect();
    segments.len() >= 3
        && segments.iter().all(|s| {
            !s.is_empty()
                && s.len() <= 63
                && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
}

/// A `collection/rkey` path inside a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoPath {
    collection: String,
    rkey: String,
}

impl RepoPath {
    pub fn parse(path: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidRepoPath {
            value: path.to_string(),
            reason: reason.to_string(),
        };

        let (collection, rkey) = path
            .split_once('/')
            .ok_or_else(|| invalid("expected collection/rkey"))?;
        if rkey.contains('/') {
            return Err(invalid("too many path segments"));
        }
        if !valid_nsid(collection) {
            return Err(invalid("invalid collection NSID"));
        }
        if !valid_record_key(rkey) {
            return Err(invalid("invalid record key"));
        }

        Ok(Self {
            collection: collection.to_string(),
            rkey: rkey.to_string(),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn rkey(&self) -> &str {
        &self.rkey
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.rkey)
    }
}

// ============================================================================
// AT-URI
// ============================================================================

/// An `at://authority/collection/rkey` URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    authority: String,
    collection: Option<String>,
    rkey: Option<String>,
}

impl AtUri {
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidAtUri {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let rest = value
            .strip_prefix("at://")
            .ok_or_else(|| invalid("missing at:// scheme"))?;
        let rest = rest.split(['?', '#']).next().unwrap_or_default();
        let mut parts = rest.split('/');

        let authority = parts
            .next()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| invalid("missing authority"))?;
        if authority.starts_with("did:") {
            Did::parse(authority).map_err(|_| invalid("authority is not a valid DID"))?;
        }

        let collection = match parts.next() {
            Some(c) if valid_nsid(c) => Some(c.to_string()),
            Some("") | None => None,
            Some(_) => return Err(invalid("invalid collection NSID")),
        };
        let rkey = match parts.next() {
            Some(r) if collection.is_some() && valid_record_key(r) => Some(r.to_string()),
            Some("") | None => None,
            Some(_) => return Err(invalid("invalid record key")),
        };
        if parts.next().is_some_and(|p| !p.is_empty()) {
            return Err(invalid("too many path segments"));
        }

        Ok(Self {
            authority: authority.to_string(),
            collection,
            rkey,
        })
    }

    /// Build the URI of a record from its parts.
    pub fn for_record(did: &Did, collection: &str, rkey: &str) -> Self {
        Self {
            authority: did.to_string(),
            collection: Some(collection.to_string()),
            rkey: Some(rkey.to_string()),
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn rkey(&self) -> Option<&str> {
        self.rkey.as_deref()
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}", self.authority)?;
        if let Some(collection) = &self.collection {
            write!(f, "/{}", collection)?;
            if let Some(rkey) = &self.rkey {
                write!(f, "/{}", rkey)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// TID
// ============================================================================

/// Timestamp identifier: 13 base32-sortable characters encoding microseconds
/// since the epoch (upper 53 bits) and a clock id (lower 10 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(u64);

impl Tid {
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidTid {
            value: value.to_string(),
        };

        let bytes = value.as_bytes();
        if bytes.len() != 13 {
            return Err(invalid());
        }
        // The first character carries the (always zero) top bit.
        if !matches!(bytes[0], b'2'..=b'7' | b'a'..=b'j') {
            return Err(invalid());
        }

        let mut raw: u64 = 0;
        for b in bytes {
            let digit = TID_ALPHABET
                .iter()
                .position(|c| c == b)
                .ok_or_else(invalid)?;
            raw = (raw << 5) | digit as u64;
        }
        Ok(Self(raw))
    }

    pub fn micros(&self) -> i64 {
        (self.0 >> 10) as i64
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_micros(self.micros()).single()
    }
}

// ============================================================================
// CID
// ============================================================================

/// Content identifier of a record block, kept in its textual form.
///
/// Equality is textual; the codec that produced both sides is responsible
/// for using one canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// SHA-256 content identifier for raw record bytes.
    pub fn for_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("sha256:{}", hex::encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_did_accepts_plc_and_web() {
        let plc = Did::parse("did:plc:ewvi7nxzyoun6zhxrhs64oiz").expect("valid plc did");
        assert_eq!(plc.method(), "plc");

        let web = Did::parse("did:web:feeds.example.com").expect("valid web did");
        assert_eq!(web.method(), "web");
    }

    #[test]
    fn test_did_rejects_malformed() {
        for bad in [
            "",
            "plc:abc",
            "did:",
            "did:plc",
            "did:PLC:abc",
            "did:plc:",
            "did:plc:abc:",
            "did:plc:a b",
            "did:plc:abc%",
        ] {
            assert!(Did::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_repo_path_parse() {
        let path = RepoPath::parse("app.bsky.feed.post/3kq2sneqbkm2a").expect("valid path");
        assert_eq!(path.collection(), "app.bsky.feed.post");
        assert_eq!(path.rkey(), "3kq2sneqbkm2a");
        assert_eq!(path.to_string(), "app.bsky.feed.post/3kq2sneqbkm2a");

        assert!(RepoPath::parse("app.bsky.feed.post").is_err());
        assert!(RepoPath::parse("app.bsky.feed.post/a/b").is_err());
        assert!(RepoPath::parse("post/abc").is_err());
        assert!(RepoPath::parse("app.bsky.feed.post/..").is_err());
    }

    #[test]
    fn test_at_uri_roundtrip_and_rkey() {
        let uri = AtUri::parse(
            "at://did:plc:ewvi7nxzyoun6zhxrhs64oiz/app.bsky.feed.generator/seattle",
        )
        .expect("valid uri");
        assert_eq!(uri.authority(), "did:plc:ewvi7nxzyoun6zhxrhs64oiz");
        assert_eq!(uri.collection(), Some("app.bsky.feed.generator"));
        assert_eq!(uri.rkey(), Some("seattle"));
        assert_eq!(
            uri.to_string(),
            "at://did:plc:ewvi7nxzyoun6zhxrhs64oiz/app.bsky.feed.generator/seattle"
        );

        assert!(AtUri::parse("https://example.com").is_err());
        assert!(AtUri::parse("at://").is_err());
        assert!(AtUri::parse("at://did:plc:abc/notnsid/rkey").is_err());
    }

    #[test]
    fn test_at_uri_for_record() {
        let did = Did::parse("did:plc:abc123").expect("valid did");
        let uri = AtUri::for_record(&did, "app.bsky.feed.post", "3kq2sneqbkm2a");
        assert_eq!(uri.to_string(), "at://did:plc:abc123/app.bsky.feed.post/3kq2sneqbkm2a");
    }

    #[test]
    fn test_tid_timestamp() {
        let tid = Tid::parse("3jzfcijpj2z2a").expect("valid tid");
        let ts = tid.timestamp().expect("in range");
        // TIDs of this shape were minted in 2023.
        assert_eq!(ts.format("%Y").to_string(), "2023");

        assert!(Tid::parse("3jzfcijpj2z2").is_err());
        assert!(Tid::parse("zzzzzzzzzzzzz").is_err());
        assert!(Tid::parse("3jzfcijpj2z2!").is_err());
    }

    #[test]
    fn test_cid_for_bytes_is_stable() {
        let a = Cid::for_bytes(b"{\"text\":\"hi\"}");
        let b = Cid::for_bytes(b"{\"text\":\"hi\"}");
        let c = Cid::for_bytes(b"{\"text\":\"bye\"}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("sha256:"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_plc_dids_parse(id in "[a-z2-7]{24}") {
            let raw = format!("did:plc:{}", id);
            let did = Did::parse(&raw).expect("generated DID should parse");
            prop_assert_eq!(did.as_str(), raw.as_str());
        }

        #[test]
        fn prop_dids_without_prefix_rejected(s in "[a-z0-9:]{0,40}") {
            prop_assume!(!s.starts_with("did:"));
            prop_assert!(Did::parse(&s).is_err());
        }

        #[test]
        fn prop_tid_parse_never_panics(s in "\\PC{0,20}") {
            let _ = Tid::parse(&s);
        }
    }
}
