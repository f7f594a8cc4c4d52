//! Signing keys and the identity directory seam.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::IdentityError;
use crate::identity::Did;

/// Signature verification failed.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("signature verification failed")]
pub struct SignatureError;

/// Curve of a public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Secp256k1,
    P256,
    /// Non-production keys used by fakes.
    Other(&'static str),
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Secp256k1 => f.write_str("secp256k1"),
            KeyType::P256 => f.write_str("p256"),
            KeyType::Other(name) => f.write_str(name),
        }
    }
}

/// A public key able to check signatures over arbitrary messages.
///
/// Implementations hash the message themselves and accept the 64-byte
/// `r || s` signature form, in either S normalization.
pub trait PublicKey: Send + Sync + fmt::Debug {
    fn key_type(&self) -> KeyType;

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), SignatureError>;
}

/// Resolves identities to their signing keys and handles to identities.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Current signing key for `did`.
    async fn lookup_public_key(&self, did: &Did) -> Result<Arc<dyn PublicKey>, IdentityError>;

    /// Resolve a handle (e.g. `alice.bsky.social`) to its DID.
    async fn resolve_handle(&self, handle: &str) -> Result<Did, IdentityError>;
}
