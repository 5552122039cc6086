//! Error types for ordered collections.

use realtree_core::CoreError;
use thiserror::Error;

/// Result type for collection operations.
pub type CollectionResult<T> = Result<T, CollectionError>;

/// Errors that can occur while mirroring a remote collection.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollectionError {
    /// Error from the core layer.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The local mirror disagrees with the remote collection.
    #[error("consistency error at {location}: {message}")]
    Consistency {
        /// Collection location.
        location: String,
        /// What disagreed.
        message: String,
    },

    /// A remote element could not be decoded.
    #[error("cannot decode element {key:?}: {message}")]
    Decoding {
        /// Key of the element.
        key: String,
        /// Description of the mismatch.
        message: String,
    },

    /// A changed element is not part of the mirror.
    #[error("cannot move item {key:?}: not found")]
    ItemNotFound {
        /// Key of the element.
        key: String,
    },

    /// The paging controller was started twice.
    #[error("paging controller is already started")]
    AlreadyStarted,

    /// Paging was requested before `start`.
    #[error("paging controller is not started")]
    NotStarted,

    /// The operation needs a view bound to a database location.
    #[error("collection is not bound to a database location")]
    Detached,

    /// The operation is not allowed in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CollectionError {
    /// Creates a consistency error.
    pub fn consistency(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Consistency {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Creates a decoding error.
    pub fn decoding(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decoding {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates an item-not-found error.
    pub fn item_not_found(key: impl Into<String>) -> Self {
        Self::ItemNotFound { key: key.into() }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the mirror must be reloaded to recover.
    pub fn requires_reload(&self) -> bool {
        matches!(
            self,
            CollectionError::Consistency { .. } | CollectionError::ItemNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CollectionError::consistency("list", "removed 2 items, remote reported 3");
        assert_eq!(
            err.to_string(),
            "consistency error at list: removed 2 items, remote reported 3"
        );
        assert_eq!(
            CollectionError::item_not_found("k1").to_string(),
            "cannot move item \"k1\": not found"
        );
    }

    #[test]
    fn core_errors_convert() {
        let err: CollectionError = CoreError::Timeout.into();
        assert_eq!(err, CollectionError::Core(CoreError::Timeout));
        assert!(!err.requires_reload());
        assert!(CollectionError::item_not_found("x").requires_reload());
    }
}
