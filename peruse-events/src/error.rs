//! Feed and registry errors.

use peruse_core::{IdentityError, PeruseError, StorageError};
use thiserror::Error;

/// Errors raised by feed modules while serving or ingesting.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeedError {
    #[error("Invalid cursor {value:?}")]
    InvalidCursor { value: String },

    #[error("Authentication required")]
    AuthRequired,

    #[error("{message}")]
    Unavailable { message: String },

    #[error(transparent)]
    Backend(#[from] PeruseError),
}

impl FeedError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        FeedError::Unavailable {
            message: message.into(),
        }
    }
}

impl From<StorageError> for FeedError {
    fn from(err: StorageError) -> Self {
        FeedError::Backend(err.into())
    }
}

impl From<IdentityError> for FeedError {
    fn from(err: IdentityError) -> Self {
        FeedError::Backend(err.into())
    }
}

/// Errors raised while assembling the feed registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Feed {name:?} is already registered")]
    DuplicateFeed { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_become_backend_failures() {
        let err = FeedError::from(StorageError::QueryFailed {
            reason: "timeout".to_string(),
        });
        assert!(matches!(err, FeedError::Backend(PeruseError::Storage(_))));
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_duplicate_feed_display() {
        let err = RegistryError::DuplicateFeed {
            name: "seattle".to_string(),
        };
        assert_eq!(err.to_string(), "Feed \"seattle\" is already registered");
    }
}
