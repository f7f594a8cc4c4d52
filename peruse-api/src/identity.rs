//! Identity resolution over HTTP.
//!
//! `did:plc` documents come from the PLC directory, `did:web` documents from
//! the host's `/.well-known/did.json`. Handles resolve through the public
//! AppView's `com.atproto.identity.resolveHandle`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k256::ecdsa::signature::Verifier as _;
use peruse_core::{Did, IdentityDirectory, IdentityError, KeyType, PublicKey, SignatureError};
use serde::Deserialize;
use tracing::debug;

/// Multicodec prefix of a compressed secp256k1 public key.
const SECP256K1_PREFIX: [u8; 2] = [0xe7, 0x01];
/// Multicodec prefix of a compressed P-256 public key.
const P256_PREFIX: [u8; 2] = [0x80, 0x24];

// ============================================================================
// KEYS
// ============================================================================

/// secp256k1 verifying key (`ES256K`).
#[derive(Debug, Clone)]
pub struct Secp256k1Key(k256::ecdsa::VerifyingKey);

impl Secp256k1Key {
    pub fn from_sec1(bytes: &[u8]) -> Result<Self, IdentityError> {
        k256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|e| unsupported(format!("bad secp256k1 key: {e}")))
    }
}

impl From<k256::ecdsa::VerifyingKey> for Secp256k1Key {
    fn from(key: k256::ecdsa::VerifyingKey) -> Self {
        Self(key)
    }
}

impl PublicKey for Secp256k1Key {
    fn key_type(&self) -> KeyType {
        KeyType::Secp256k1
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        let sig = k256::ecdsa::Signature::from_slice(signature).map_err(|_| SignatureError)?;
        // High-S signatures are accepted.
        let sig = sig.normalize_s().unwrap_or(sig);
        self.0.verify(message, &sig).map_err(|_| SignatureError)
    }
}

/// NIST P-256 verifying key (`ES256`).
#[derive(Debug, Clone)]
pub struct P256Key(p256::ecdsa::VerifyingKey);

impl P256Key {
    pub fn from_sec1(bytes: &[u8]) -> Result<Self, IdentityError> {
        p256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|e| unsupported(format!("bad p256 key: {e}")))
    }
}

impl From<p256::ecdsa::VerifyingKey> for P256Key {
    fn from(key: p256::ecdsa::VerifyingKey) -> Self {
        Self(key)
    }
}

impl PublicKey for P256Key {
    fn key_type(&self) -> KeyType {
        KeyType::P256
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        let sig = p256::ecdsa::Signature::from_slice(signature).map_err(|_| SignatureError)?;
        let sig = sig.normalize_s().unwrap_or(sig);
        p256::ecdsa::signature::Verifier::verify(&self.0, message, &sig).map_err(|_| SignatureError)
    }
}

fn unsupported(reason: impl Into<String>) -> IdentityError {
    IdentityError::UnsupportedKey {
        reason: reason.into(),
    }
}

/// Decode a `publicKeyMultibase` value (`z` + base58btc of multicodec prefix + SEC1 point).
pub fn parse_multikey(value: &str) -> Result<Arc<dyn PublicKey>, IdentityError> {
    let encoded = value
        .strip_prefix('z')
        .ok_or_else(|| unsupported("multibase value is not base58btc"))?;
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| unsupported(format!("bad base58: {e}")))?;

    if let Some(key) = bytes.strip_prefix(&SECP256K1_PREFIX) {
        return Ok(Arc::new(Secp256k1Key::from_sec1(key)?));
    }
    if let Some(key) = bytes.strip_prefix(&P256_PREFIX) {
        return Ok(Arc::new(P256Key::from_sec1(key)?));
    }
    Err(unsupported("unknown multicodec prefix"))
}

/// Encode a compressed secp256k1 key as a multikey string.
pub fn secp256k1_multikey(key: &k256::ecdsa::VerifyingKey) -> String {
    let point = key.to_encoded_point(true);
    let mut bytes = SECP256K1_PREFIX.to_vec();
    bytes.extend_from_slice(point.as_bytes());
    format!("z{}", bs58::encode(bytes).into_string())
}

/// Encode a compressed P-256 key as a multikey string.
pub fn p256_multikey(key: &p256::ecdsa::VerifyingKey) -> String {
    let point = key.to_encoded_point(true);
    let mut bytes = P256_PREFIX.to_vec();
    bytes.extend_from_slice(point.as_bytes());
    format!("z{}", bs58::encode(bytes).into_string())
}

// ============================================================================
// DID DOCUMENTS
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidDocument {
    #[serde(default)]
    verification_method: Vec<VerificationMethod>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerificationMethod {
    id: String,
    #[serde(default)]
    public_key_multibase: Option<String>,
}

/// The `#atproto` signing key of a DID document.
pub fn signing_key_from_document(
    did: &Did,
    document: serde_json::Value,
) -> Result<Arc<dyn PublicKey>, IdentityError> {
    let document: DidDocument =
        serde_json::from_value(document).map_err(|e| IdentityError::ResolutionFailed {
            subject: did.to_string(),
            reason: format!("malformed DID document: {e}"),
        })?;
    let qualified = format!("{did}#atproto");
    let multibase = document
        .verification_method
        .iter()
        .find(|m| m.id == "#atproto" || m.id == qualified)
        .and_then(|m| m.public_key_multibase.as_deref())
        .ok_or_else(|| IdentityError::MissingSigningKey {
            did: did.to_string(),
        })?;
    parse_multikey(multibase)
}

// ============================================================================
// DIRECTORY
// ============================================================================

/// Settings for [`PlcDirectory`].
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub plc_url: String,
    pub public_api_host: String,
    pub timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            plc_url: "https://plc.directory".to_string(),
            public_api_host: "https://public.api.bsky.app".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

/// HTTP identity directory.
#[derive(Debug, Clone)]
pub struct PlcDirectory {
    client: reqwest::Client,
    config: DirectoryConfig,
}

impl PlcDirectory {
    pub fn new(config: DirectoryConfig) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("peruse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IdentityError::ResolutionFailed {
                subject: config.plc_url.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { client, config })
    }

    /// Where the DID document for `did` lives.
    pub fn document_url(&self, did: &Did) -> Result<String, IdentityError> {
        match did.method() {
            "plc" => Ok(format!(
                "{}/{}",
                self.config.plc_url.trim_end_matches('/'),
                did
            )),
            "web" => {
                let host = did
                    .as_str()
                    .trim_start_matches("did:web:")
                    .replace("%3A", ":");
                Ok(format!("https://{host}/.well-known/did.json"))
            }
            other => Err(IdentityError::ResolutionFailed {
                subject: did.to_string(),
                reason: format!("unsupported DID method {other}"),
            }),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        subject: &str,
    ) -> Result<T, IdentityError> {
        let failed = |e: reqwest::Error| {
            if e.is_timeout() {
                IdentityError::Timeout {
                    subject: subject.to_string(),
                }
            } else {
                IdentityError::ResolutionFailed {
                    subject: subject.to_string(),
                    reason: e.to_string(),
                }
            }
        };
        request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(failed)?
            .json()
            .await
            .map_err(failed)
    }
}

#[async_trait]
impl IdentityDirectory for PlcDirectory {
    async fn lookup_public_key(&self, did: &Did) -> Result<Arc<dyn PublicKey>, IdentityError> {
        let url = self.document_url(did)?;
        debug!(did = %did, url = %url, "Fetching DID document");
        let document: serde_json::Value =
            self.get_json(self.client.get(&url), did.as_str()).await?;
        signing_key_from_document(did, document)
    }

    async fn resolve_handle(&self, handle: &str) -> Result<Did, IdentityError> {
        let url = format!(
            "{}/xrpc/com.atproto.identity.resolveHandle",
            self.config.public_api_host.trim_end_matches('/')
        );
        let response: ResolveHandleResponse = self
            .get_json(self.client.get(&url).query(&[("handle", handle)]), handle)
            .await?;
        Did::parse(&response.did).map_err(|e| IdentityError::ResolutionFailed {
            subject: handle.to_string(),
            reason: e.to_string(),
        })
    }
}
