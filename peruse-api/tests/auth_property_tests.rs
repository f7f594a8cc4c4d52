//! Property-Based Tests for Request Authentication
//!
//! Any token that is not a well-formed, correctly signed ES256K/ES256 token
//! from a DID issuer is rejected with `AuthRequired`, and the scoped feed is
//! never asked for a page.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{to_bytes, Body},
    http::{header::AUTHORIZATION, Request, StatusCode},
    Router,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use peruse_api::{
    create_router, AlgorithmTable, AppState, AuthConfig, AuthVerifier, ServiceInfo, UserManager,
};
use peruse_core::IdentityDirectory;
use peruse_events::FeedRegistry;
use peruse_storage::QueryStore;
use peruse_test_utils::fixtures::{self, TokenBuilder, ALICE, SERVICE_DID};
use peruse_test_utils::generators::{arb_bad_signature_len, arb_non_did_issuer, arb_unsupported_alg};
use peruse_test_utils::{FakeDirectory, MockQueryStore, RecordingFeed, TestKey};
use proptest::prelude::*;
use serde_json::{json, Value};
use tower::ServiceExt;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

const FEED: &str = "/xrpc/app.bsky.feed.getFeedSkeleton?feed=at://did:plc:z72i7hdynmk6r22z27h6tvur/app.bsky.feed.generator/mine";

fn test_app() -> (Router, Arc<RecordingFeed>) {
    let directory: Arc<dyn IdentityDirectory> =
        Arc::new(FakeDirectory::new().with_key(&fixtures::did(ALICE), TestKey::new(1)));
    let feed = Arc::new(RecordingFeed::new("mine").requiring_auth());

    let mut builder = FeedRegistry::builder();
    builder.register(feed.clone()).unwrap();

    let state = AppState {
        registry: builder.build(),
        verifier: Arc::new(AuthVerifier::with_clock(
            Arc::clone(&directory),
            AlgorithmTable::atproto(),
            AuthConfig {
                service_did: Some(SERVICE_DID.to_string()),
                ..AuthConfig::default()
            },
            Arc::new(fixtures::clock()),
        )),
        users: Arc::new(UserManager::new(16)),
        store: Arc::new(MockQueryStore::new()) as Arc<dyn QueryStore>,
        directory,
        service: Arc::new(ServiceInfo {
            service_did: SERVICE_DID.to_string(),
            service_endpoint: "https://feeds.example.com".to_string(),
            feed_owner: fixtures::did("did:plc:z72i7hdynmk6r22z27h6tvur"),
        }),
        start_time: Instant::now(),
    };
    (create_router(state), feed)
}

/// Send `authorization` (if any) and return status and JSON body.
fn call(authorization: Option<String>) -> (StatusCode, Value, usize) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let (app, feed) = test_app();
        let mut request = Request::get(FEED);
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, body, feed.requests().len())
    })
}

fn assert_rejected((status, body, served): (StatusCode, Value, usize)) -> Result<(), TestCaseError> {
    prop_assert_eq!(status, StatusCode::BAD_REQUEST);
    prop_assert_eq!(body, json!({"error": "AuthRequired"}));
    prop_assert_eq!(served, 0);
    Ok(())
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Algorithms outside the accepted pair fail even with a valid signature.
    #[test]
    fn prop_unsupported_algorithms_rejected(alg in arb_unsupported_alg()) {
        let token = TokenBuilder::new(ALICE).alg(&alg).sign(&TestKey::new(1));
        assert_rejected(call(Some(fixtures::bearer(&token))))?;
    }

    /// Issuers that are not DIDs fail before any key lookup.
    #[test]
    fn prop_non_did_issuers_rejected(iss in arb_non_did_issuer()) {
        let token = TokenBuilder::new(&iss).sign(&TestKey::new(1));
        assert_rejected(call(Some(fixtures::bearer(&token))))?;
    }

    /// Signatures must be exactly 64 bytes.
    #[test]
    fn prop_wrong_length_signatures_rejected(len in arb_bad_signature_len()) {
        let token = TokenBuilder::new(ALICE).sign_with(|_| vec![7u8; len]);
        assert_rejected(call(Some(fixtures::bearer(&token))))?;
    }

    /// A correctly sized signature from the wrong key fails.
    #[test]
    fn prop_foreign_key_rejected(seed in 2u8..=255) {
        let token = TokenBuilder::new(ALICE).sign(&TestKey::new(seed));
        assert_rejected(call(Some(fixtures::bearer(&token))))?;
    }

    /// Arbitrary header values never authenticate.
    #[test]
    fn prop_garbage_headers_rejected(value in "[A-Za-z]{0,8} [A-Za-z0-9_.-]{0,60}") {
        assert_rejected(call(Some(value)))?;
    }

    /// Tampered claims break the signature.
    #[test]
    fn prop_tampered_claims_rejected(exp in any::<i32>()) {
        prop_assume!(i64::from(exp) != fixtures::now().timestamp() + 3600);
        let signed = TokenBuilder::new(ALICE).sign(&TestKey::new(1));
        let parts: Vec<&str> = signed.split('.').collect();
        let claims = json!({"iss": ALICE, "exp": i64::from(exp)}).to_string();
        let forged = format!("{}.{}.{}", parts[0], URL_SAFE_NO_PAD.encode(claims), parts[2]);
        assert_rejected(call(Some(fixtures::bearer(&forged))))?;
    }
}

#[test]
fn test_missing_token_rejected() {
    let (status, body, served) = call(None);
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "AuthRequired"}));
    assert_eq!(served, 0);
}

#[test]
fn test_valid_token_reaches_feed() {
    let token = TokenBuilder::new(ALICE).aud(SERVICE_DID).sign(&TestKey::new(1));
    let (status, _, served) = call(Some(fixtures::bearer(&token)));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(served, 1);
}
