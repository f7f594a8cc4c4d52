//! Error types for peruse operations

use thiserror::Error;

/// Identifier and input validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid DID {value:?}: {reason}")]
    InvalidDid { value: String, reason: String },

    #[error("Invalid AT-URI {value:?}: {reason}")]
    InvalidAtUri { value: String, reason: String },

    #[error("Invalid repo path {value:?}: {reason}")]
    InvalidRepoPath { value: String, reason: String },

    #[error("Invalid TID {value:?}")]
    InvalidTid { value: String },

    #[error("Invalid cursor {value:?}: {reason}")]
    InvalidCursor { value: String, reason: String },

    #[error("Invalid timestamp {value:?}")]
    InvalidTimestamp { value: String },

    #[error("Record has no usable timestamp: {uri}")]
    MissingTimestamp { uri: String },
}

/// Storage layer errors (query store, cursor file).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("Unexpected row shape for column {column}: {reason}")]
    RowDecode { column: String, reason: String },

    #[error("Cursor file {path} error: {reason}")]
    CursorIo { path: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Relay stream errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("Failed to connect to relay {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Relay stream failed: {reason}")]
    Transport { reason: String },

    #[error("Failed to decode frame: {reason}")]
    FrameDecode { reason: String },

    #[error("Failed to decode blocks for {repo}: {reason}")]
    BlockDecode { repo: String, reason: String },

    #[error("Failed to decode record at {path}: {reason}")]
    RecordDecode { path: String, reason: String },
}

/// Identity resolution and key handling errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Failed to resolve {subject}: {reason}")]
    ResolutionFailed { subject: String, reason: String },

    #[error("Identity {did} has no signing key")]
    MissingSigningKey { did: String },

    #[error("Unsupported key type: {reason}")]
    UnsupportedKey { reason: String },

    #[error("Identity resolution timed out for {subject}")]
    Timeout { subject: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load {path}: {reason}")]
    FileLoad { path: String, reason: String },
}

/// Master error type for all peruse errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeruseError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Entity extraction failed: {reason}")]
    Extraction { reason: String },
}

/// Result type alias for peruse operations.
pub type PeruseResult<T> = Result<T, PeruseError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_invalid_did() {
        let err = ValidationError::InvalidDid {
            value: "did:".to_string(),
            reason: "missing method".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Invalid DID"));
        assert!(msg.contains("missing method"));
    }

    #[test]
    fn test_storage_error_display_cursor_io() {
        let err = StorageError::CursorIo {
            path: "/var/lib/peruse/cursor".to_string(),
            reason: "permission denied".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("/var/lib/peruse/cursor"));
        assert!(msg.contains("permission denied"));
    }

    #[test]
    fn test_peruse_error_from_variants() {
        let storage = PeruseError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, PeruseError::Storage(_)));

        let stream = PeruseError::from(StreamError::Transport {
            reason: "reset".to_string(),
        });
        assert!(matches!(stream, PeruseError::Stream(_)));

        let identity = PeruseError::from(IdentityError::MissingSigningKey {
            did: "did:plc:abc".to_string(),
        });
        assert!(matches!(identity, PeruseError::Identity(_)));

        let config = PeruseError::from(ConfigError::MissingRequired {
            field: "cursor_file".to_string(),
        });
        assert!(matches!(config, PeruseError::Config(_)));
    }

    #[test]
    fn test_errors_are_cloneable_for_fan_out() {
        let err = PeruseError::from(StorageError::QueryFailed {
            reason: "timeout".to_string(),
        });
        let copy = err.clone();
        assert_eq!(err, copy);
    }
}
