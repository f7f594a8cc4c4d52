//! Peruse Test Utilities
//!
//! Shared test infrastructure for the peruse workspace:
//! - Fake identity directory, signing keys and entity extractor
//! - A feed module that records what it is handed
//! - Token and record fixtures
//! - Proptest generators for identifiers

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha512};

pub use peruse_core::{
    AtUri, Cid, Collection, DecodedRecord, Did, Entity, IdentityDirectory, IdentityError,
    KeyType, ManualClock, PeruseError, PublicKey, SignatureError,
};
pub use peruse_events::{EntityExtractor, FeedError, FeedModule, FeedPage, FeedRequest};
pub use peruse_storage::{row, MockQueryStore};

// ============================================================================
// FAKE IDENTITY
// ============================================================================

/// Deterministic test key: signatures are `SHA-512(secret || message)`, 64 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestKey {
    secret: [u8; 32],
}

impl TestKey {
    pub fn new(seed: u8) -> Self {
        Self { secret: [seed; 32] }
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let mut hasher = Sha512::new();
        hasher.update(self.secret);
        hasher.update(message);
        hasher.finalize().to_vec()
    }
}

impl PublicKey for TestKey {
    fn key_type(&self) -> KeyType {
        KeyType::Other("test-sha512")
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        if self.sign(message) == signature {
            Ok(())
        } else {
            Err(SignatureError)
        }
    }
}

#[derive(Default)]
struct DirectoryState {
    keys: HashMap<Did, Arc<dyn PublicKey>>,
    handles: HashMap<String, Did>,
    failure: Option<IdentityError>,
}

/// In-memory identity directory that counts key lookups.
#[derive(Default)]
pub struct FakeDirectory {
    state: Mutex<DirectoryState>,
    lookups: AtomicUsize,
    delay: Option<Duration>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(self, did: &Did, key: impl PublicKey + 'static) -> Self {
        self.insert_key(did, key);
        self
    }

    pub fn with_handle(self, handle: &str, did: &Did) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.handles.insert(handle.to_string(), did.clone());
        }
        self
    }

    /// Sleep this long before answering each lookup.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Replace the key for `did`, as after a key rotation.
    pub fn insert_key(&self, did: &Did, key: impl PublicKey + 'static) {
        if let Ok(mut state) = self.state.lock() {
            state.keys.insert(did.clone(), Arc::new(key));
        }
    }

    /// Fail every lookup with `err` until cleared with `None`.
    pub fn fail_with(&self, err: Option<IdentityError>) {
        if let Ok(mut state) = self.state.lock() {
            state.failure = err;
        }
    }

    /// Number of key lookups served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityDirectory for FakeDirectory {
    async fn lookup_public_key(&self, did: &Did) -> Result<Arc<dyn PublicKey>, IdentityError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().map_err(|_| IdentityError::ResolutionFailed {
            subject: did.to_string(),
            reason: "directory lock poisoned".to_string(),
        })?;
        if let Some(err) = &state.failure {
            return Err(err.clone());
        }
        state
            .keys
            .get(did)
            .cloned()
            .ok_or_else(|| IdentityError::ResolutionFailed {
                subject: did.to_string(),
                reason: "not found".to_string(),
            })
    }

    async fn resolve_handle(&self, handle: &str) -> Result<Did, IdentityError> {
        let state = self.state.lock().map_err(|_| IdentityError::ResolutionFailed {
            subject: handle.to_string(),
            reason: "directory lock poisoned".to_string(),
        })?;
        state
            .handles
            .get(handle)
            .cloned()
            .ok_or_else(|| IdentityError::ResolutionFailed {
                subject: handle.to_string(),
                reason: "unknown handle".to_string(),
            })
    }
}

// ============================================================================
// FAKE EXTRACTOR AND FEED
// ============================================================================

/// Entity extractor returning a fixed answer for any text.
#[derive(Debug, Default)]
pub struct FakeExtractor {
    entities: Vec<Entity>,
    calls: AtomicUsize,
}

impl FakeExtractor {
    pub fn returning(entity_ids: &[&str]) -> Self {
        Self {
            entities: entity_ids.iter().map(|id| fixtures::entity(id)).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntityExtractor for FakeExtractor {
    async fn extract(&self, _text: &str) -> Result<Vec<Entity>, PeruseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.entities.clone())
    }
}

/// Feed module that serves a fixed page and keeps every record it is handed.
pub struct RecordingFeed {
    name: String,
    requires_auth: bool,
    page: FeedPage,
    seen: Mutex<Vec<DecodedRecord>>,
    requests: Mutex<Vec<FeedRequest>>,
}

impl RecordingFeed {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            requires_auth: false,
            page: FeedPage::default(),
            seen: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requiring_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    pub fn serving(mut self, page: FeedPage) -> Self {
        self.page = page;
        self
    }

    pub fn seen(&self) -> Vec<DecodedRecord> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<FeedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl FeedModule for RecordingFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_auth(&self) -> bool {
        self.requires_auth
    }

    async fn serve(&self, request: &FeedRequest) -> Result<FeedPage, FeedError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        Ok(self.page.clone())
    }

    async fn on_create(&self, record: &DecodedRecord) -> Result<(), FeedError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(record.clone());
        }
        Ok(())
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Tokens, records and entities for tests.

    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::{json, Map, Value};

    pub const ALICE: &str = "did:plc:ewvi7nxzyoun6zhxrhs64oiz";
    pub const BOB: &str = "did:plc:44ybard66vv44zksje25o7dz";
    pub const CAROL: &str = "did:plc:z72i7hdynmk6r22z27h6tvur";
    pub const SERVICE_DID: &str = "did:web:feeds.example.com";

    pub fn did(value: &str) -> Did {
        match Did::parse(value) {
            Ok(did) => did,
            Err(e) => panic!("fixture DID {value:?} is invalid: {e}"),
        }
    }

    /// 2024-06-01T00:00:00Z, the default "now" of fixtures.
    pub fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0)
            .single()
            .unwrap_or_default()
    }

    pub fn clock() -> ManualClock {
        ManualClock::at(now())
    }

    pub fn entity(id: &str) -> Entity {
        Entity {
            entity_id: id.to_string(),
            label: None,
            text: None,
        }
    }

    /// Builder for signed bearer tokens.
    #[derive(Debug, Clone)]
    pub struct TokenBuilder {
        alg: String,
        claims: Map<String, Value>,
    }

    impl TokenBuilder {
        /// An `ES256K` token issued by `iss`, expiring an hour after [`now`].
        pub fn new(iss: &str) -> Self {
            let mut claims = Map::new();
            claims.insert("iss".to_string(), json!(iss));
            claims.insert("exp".to_string(), json!(now().timestamp() + 3600));
            Self {
                alg: "ES256K".to_string(),
                claims,
            }
        }

        pub fn alg(mut self, alg: &str) -> Self {
            self.alg = alg.to_string();
            self
        }

        pub fn exp(self, exp: i64) -> Self {
            self.claim("exp", json!(exp))
        }

        pub fn aud(self, aud: &str) -> Self {
            self.claim("aud", json!(aud))
        }

        pub fn lxm(self, lxm: &str) -> Self {
            self.claim("lxm", json!(lxm))
        }

        pub fn claim(mut self, name: &str, value: Value) -> Self {
            self.claims.insert(name.to_string(), value);
            self
        }

        pub fn without(mut self, name: &str) -> Self {
            self.claims.remove(name);
            self
        }

        /// `base64url(header) "." base64url(claims)`.
        pub fn signing_input(&self) -> String {
            let header = json!({"alg": self.alg, "typ": "JWT"}).to_string();
            let claims = Value::Object(self.claims.clone()).to_string();
            format!(
                "{}.{}",
                URL_SAFE_NO_PAD.encode(header),
                URL_SAFE_NO_PAD.encode(claims)
            )
        }

        pub fn sign(&self, key: &TestKey) -> String {
            self.sign_with(|input| key.sign(input))
        }

        pub fn sign_with(&self, signer: impl FnOnce(&[u8]) -> Vec<u8>) -> String {
            let input = self.signing_input();
            let signature = signer(input.as_bytes());
            format!("{input}.{}", URL_SAFE_NO_PAD.encode(signature))
        }
    }

    pub fn bearer(token: &str) -> String {
        format!("Bearer {token}")
    }

    /// A top-level post by `author` with record key `rkey`.
    pub fn post(author: &str, rkey: &str, text: &str) -> DecodedRecord {
        let payload = json!({
            "$type": Collection::POST,
            "text": text,
            "createdAt": "2024-05-31T10:00:00Z",
        });
        record(Collection::Post, author, rkey, payload)
    }

    /// A reply post.
    pub fn reply(author: &str, rkey: &str, text: &str) -> DecodedRecord {
        let mut record = post(author, rkey, text);
        record.payload["reply"] = json!({
            "root": {"uri": format!("at://{BOB}/{}/3kq2aaaaaaaaa", Collection::POST), "cid": "x"},
            "parent": {"uri": format!("at://{BOB}/{}/3kq2aaaaaaaaa", Collection::POST), "cid": "x"},
        });
        record
    }

    pub fn like(author: &str, rkey: &str, subject: &str) -> DecodedRecord {
        let payload = json!({
            "$type": Collection::LIKE,
            "subject": {"uri": subject, "cid": "x"},
            "createdAt": "2024-05-31T10:00:00Z",
        });
        record(Collection::Like, author, rkey, payload)
    }

    fn record(collection: Collection, author: &str, rkey: &str, payload: Value) -> DecodedRecord {
        let author = did(author);
        let cid = Cid::for_bytes(payload.to_string().as_bytes());
        DecodedRecord {
            uri: AtUri::for_record(&author, collection.as_nsid(), rkey),
            collection,
            author,
            rkey: rkey.to_string(),
            cid,
            indexed_at: Utc.with_ymd_and_hms(2024, 5, 31, 10, 0, 1).single().unwrap_or_default(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 31, 10, 0, 0).single().unwrap_or_default(),
            payload,
            entities: Vec::new(),
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for identifiers and tokens.

    use super::*;
    use proptest::prelude::*;

    /// A well-formed `did:plc` identifier.
    pub fn arb_did() -> impl Strategy<Value = Did> {
        "[a-z2-7]{24}".prop_map(|id| fixtures::did(&format!("did:plc:{id}")))
    }

    /// A 13-character TID-shaped record key.
    pub fn arb_rkey() -> impl Strategy<Value = String> {
        "[2-7][2-7a-z]{12}"
    }

    /// Algorithm names other than the two accepted ones.
    pub fn arb_unsupported_alg() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("none".to_string()),
            Just("HS256".to_string()),
            Just("RS256".to_string()),
            Just("EdDSA".to_string()),
            Just("es256k".to_string()),
            "[A-Z]{2}[0-9]{3}[A-Z]?".prop_filter("accepted alg", |a| a != "ES256" && a != "ES256K"),
        ]
    }

    /// Issuer strings that are not DIDs.
    pub fn arb_non_did_issuer() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            Just("alice.bsky.social".to_string()),
            Just("did:".to_string()),
            Just("did:PLC:abc".to_string()),
            "[a-z]{1,20}",
        ]
    }

    /// Signature lengths other than 64.
    pub fn arb_bad_signature_len() -> impl Strategy<Value = usize> {
        (0usize..200).prop_filter("valid length", |n| *n != 64)
    }
}
