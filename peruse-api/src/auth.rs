//! Inter-service request authentication.
//!
//! Feed requests carry `Authorization: Bearer <token>`, where the token is a
//! compact JWS signed by the requesting account's `#atproto` key. The verifier
//! resolves the issuer's key (cached, LRU-bounded, never expiring), checks the
//! signature with the scheme named by the token header, and returns the
//! issuer's DID.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use peruse_core::{Clock, Did, IdentityDirectory, IdentityError, PublicKey, SystemClock};
use peruse_storage::{CacheConfig, TtlCache};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Clock skew tolerated when checking `exp`.
pub const CLOCK_LEEWAY_SECS: i64 = 60;
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);
pub const KEY_CACHE_CAPACITY: usize = 100_000;

/// Every signature scheme in use produces `r || s` over 32-byte scalars.
const SIGNATURE_LEN: usize = 64;

// ============================================================================
// ERRORS
// ============================================================================

/// Why a request failed authentication.
///
/// Clients only ever see `AuthRequired`; the variant is for logs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingBearer,

    #[error("malformed token: {reason}")]
    MalformedToken { reason: String },

    #[error("unsupported signing algorithm {alg:?}")]
    UnsupportedAlgorithm { alg: String },

    #[error("issuer {value:?} is not a DID")]
    InvalidIssuer { value: String },

    #[error("failed to look up signing key: {0}")]
    KeyLookup(#[from] IdentityError),

    #[error("bad signature")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("token audience {actual:?} does not match {expected:?}")]
    WrongAudience { expected: String, actual: String },

    #[error("signing is not supported")]
    SigningUnsupported,

    #[error("authentication timed out")]
    Timeout,
}

fn malformed(reason: impl Into<String>) -> AuthError {
    AuthError::MalformedToken {
        reason: reason.into(),
    }
}

// ============================================================================
// SIGNATURE SCHEMES
// ============================================================================

/// A JWS signing algorithm this service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureScheme {
    alg: &'static str,
    signature_len: usize,
}

impl SignatureScheme {
    /// ECDSA over secp256k1 with SHA-256.
    pub const ES256K: SignatureScheme = SignatureScheme {
        alg: "ES256K",
        signature_len: SIGNATURE_LEN,
    };

    /// ECDSA over P-256 with SHA-256.
    pub const ES256: SignatureScheme = SignatureScheme {
        alg: "ES256",
        signature_len: SIGNATURE_LEN,
    };

    pub fn alg(&self) -> &'static str {
        self.alg
    }

    pub fn verify(
        &self,
        key: &dyn PublicKey,
        signing_input: &[u8],
        signature: &[u8],
    ) -> Result<(), AuthError> {
        if signature.len() != self.signature_len {
            return Err(AuthError::BadSignature);
        }
        key.verify(signing_input, signature)
            .map_err(|_| AuthError::BadSignature)
    }

    /// This service never issues tokens.
    pub fn sign(&self, _signing_input: &[u8]) -> Result<Vec<u8>, AuthError> {
        Err(AuthError::SigningUnsupported)
    }
}

/// The algorithms a verifier accepts, keyed by JWS `alg`.
#[derive(Debug, Clone, Default)]
pub struct AlgorithmTable {
    schemes: HashMap<&'static str, SignatureScheme>,
}

impl AlgorithmTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `ES256K` and `ES256`.
    pub fn atproto() -> Self {
        Self::new()
            .with(SignatureScheme::ES256K)
            .with(SignatureScheme::ES256)
    }

    pub fn with(mut self, scheme: SignatureScheme) -> Self {
        self.schemes.insert(scheme.alg, scheme);
        self
    }

    pub fn get(&self, alg: &str) -> Option<&SignatureScheme> {
        self.schemes.get(alg)
    }

    pub fn len(&self) -> usize {
        self.schemes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemes.is_empty()
    }
}

// ============================================================================
// TOKENS
// ============================================================================

#[derive(Debug, Deserialize)]
struct TokenHeader {
    alg: String,
}

/// Claims read from a request token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
    /// Lexicon method the token is bound to.
    #[serde(default)]
    pub lxm: Option<String>,
}

/// A token split into its parts, signature not yet checked.
#[derive(Debug, Clone)]
pub struct ParsedToken<'a> {
    pub alg: String,
    pub claims: TokenClaims,
    pub signing_input: &'a str,
    pub signature: Vec<u8>,
}

fn decode_segment(segment: &str, name: &str) -> Result<Vec<u8>, AuthError> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| malformed(format!("{name}: {e}")))
}

/// Split and decode a compact JWS.
pub fn parse_token(token: &str) -> Result<ParsedToken<'_>, AuthError> {
    let mut parts = token.split('.');
    let (Some(header), Some(claims), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed("expected three segments"));
    };

    let header: TokenHeader = serde_json::from_slice(&decode_segment(header, "header")?)
        .map_err(|e| malformed(format!("header: {e}")))?;
    let claims_value: serde_json::Value =
        serde_json::from_slice(&decode_segment(claims, "claims")?)
            .map_err(|e| malformed(format!("claims: {e}")))?;
    if claims_value.get("iss").is_none() {
        return Err(malformed("missing iss claim"));
    }
    let claims: TokenClaims =
        serde_json::from_value(claims_value).map_err(|e| malformed(format!("claims: {e}")))?;
    let signature = decode_segment(signature, "signature")?;

    let signing_input = token
        .rsplit_once('.')
        .map_or(token, |(input, _)| input);
    Ok(ParsedToken {
        alg: header.alg,
        claims,
        signing_input,
        signature,
    })
}

/// The token of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingBearer)?;
    let mut parts = value.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) if !token.is_empty() => Ok(token),
        _ => Err(AuthError::MissingBearer),
    }
}

// ============================================================================
// VERIFIER
// ============================================================================

/// Verifier settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// When set, a token's `aud` must equal this DID.
    pub service_did: Option<String>,
    pub timeout: Duration,
    pub key_cache_capacity: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            service_did: None,
            timeout: DEFAULT_AUTH_TIMEOUT,
            key_cache_capacity: KEY_CACHE_CAPACITY,
        }
    }
}

/// Authenticates requests against issuers' published signing keys.
pub struct AuthVerifier {
    directory: Arc<dyn IdentityDirectory>,
    keys: TtlCache<Did, Arc<dyn PublicKey>, IdentityError>,
    algorithms: AlgorithmTable,
    config: AuthConfig,
    clock: Arc<dyn Clock>,
}

impl AuthVerifier {
    pub fn new(
        directory: Arc<dyn IdentityDirectory>,
        algorithms: AlgorithmTable,
        config: AuthConfig,
    ) -> Self {
        Self::with_clock(directory, algorithms, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        directory: Arc<dyn IdentityDirectory>,
        algorithms: AlgorithmTable,
        config: AuthConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // Keys never expire; rotation is picked up after eviction.
        let keys = TtlCache::with_clock(
            CacheConfig::new().with_capacity(config.key_cache_capacity),
            Arc::clone(&clock),
        );
        Self {
            directory,
            keys,
            algorithms,
            config,
            clock,
        }
    }

    pub fn algorithms(&self) -> &AlgorithmTable {
        &self.algorithms
    }

    /// Number of issuers whose keys are cached.
    pub fn cached_keys(&self) -> usize {
        self.keys.len()
    }

    /// Authenticate a request from its headers.
    pub async fn verify_headers(&self, headers: &HeaderMap) -> Result<Did, AuthError> {
        let token = bearer_token(headers)?;
        self.verify_token(token).await
    }

    /// Verify a token and return its issuer.
    pub async fn verify_token(&self, token: &str) -> Result<Did, AuthError> {
        tokio::time::timeout(self.config.timeout, self.verify_inner(token))
            .await
            .map_err(|_| AuthError::Timeout)?
    }

    async fn verify_inner(&self, token: &str) -> Result<Did, AuthError> {
        let parsed = parse_token(token)?;
        let scheme = self
            .algorithms
            .get(&parsed.alg)
            .ok_or_else(|| AuthError::UnsupportedAlgorithm {
                alg: parsed.alg.clone(),
            })?;

        let issuer = Did::parse(&parsed.claims.iss).map_err(|_| AuthError::InvalidIssuer {
            value: parsed.claims.iss.clone(),
        })?;
        self.check_claims(&parsed.claims)?;

        let key = self.public_key(&issuer).await?;
        scheme.verify(
            key.as_ref(),
            parsed.signing_input.as_bytes(),
            &parsed.signature,
        )?;

        debug!(did = %issuer, alg = scheme.alg(), lxm = ?parsed.claims.lxm, "Request authenticated");
        Ok(issuer)
    }

    fn check_claims(&self, claims: &TokenClaims) -> Result<(), AuthError> {
        let now = self.clock.now().timestamp();
        if let Some(exp) = claims.exp {
            if exp < now - CLOCK_LEEWAY_SECS {
                return Err(AuthError::Expired);
            }
        }
        if let (Some(expected), Some(actual)) = (&self.config.service_did, &claims.aud) {
            if expected != actual {
                return Err(AuthError::WrongAudience {
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
        }
        Ok(())
    }

    async fn public_key(&self, did: &Did) -> Result<Arc<dyn PublicKey>, AuthError> {
        let key = self
            .keys
            .get_or_compute(did.clone(), || self.directory.lookup_public_key(did))
            .await?;
        Ok(key)
    }
}

// ============================================================================
// TESTS
// ============================================================================
