//! Error types for realtree core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in realtree core operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    /// Merging a leaf into the same location requires a full replace.
    #[error("merge at {location} requires full replace operation")]
    RequiresReplace {
        /// Absolute path of the merge location.
        location: String,
    },

    /// Two staging trees do not share a location.
    #[error("cannot merge {other} into unrelated location {location}")]
    UnrelatedLocation {
        /// Location of the receiving tree.
        location: String,
        /// Location of the merged tree.
        other: String,
    },

    /// The shape of the staging tree does not allow the operation.
    #[error("structural conflict at {location}: {message}")]
    StructuralConflict {
        /// Absolute path where the conflict was detected.
        location: String,
        /// Description of the conflict.
        message: String,
    },

    /// A write spans more than one tree level against a backend that
    /// does not allow it.
    #[error("multi-level node {location} can be used only for readonly operations")]
    MultiLevelWrite {
        /// Absolute path of the offending location.
        location: String,
    },

    /// Location is deeper than the configured limit.
    #[error("maximum depth limit of child nodes exceeded: {depth} > {max}")]
    DepthExceeded {
        /// Depth of the location.
        depth: usize,
        /// Configured maximum depth.
        max: usize,
    },

    /// Key contains unavailable symbols.
    #[error("key {key:?} has unavailable symbols")]
    InvalidKey {
        /// The rejected key.
        key: String,
    },

    /// Commit was requested for a transaction without staged values.
    #[error("tried to commit empty transaction")]
    EmptyTransaction,

    /// A registered precondition rejected the commit.
    #[error("precondition failed: {message}")]
    Precondition {
        /// Reason given by the precondition.
        message: String,
    },

    /// The remote database rejected the value commit.
    #[error("commit failed: {message}")]
    Commit {
        /// Description of the failure.
        message: String,
    },

    /// The remote storage rejected a file write.
    #[error("file commit failed at {node}: {message}")]
    File {
        /// Absolute path of the file.
        node: String,
        /// Description of the failure.
        message: String,
    },

    /// The local mirror disagrees with the remote collection.
    #[error("consistency error: {message}")]
    Consistency {
        /// Description of the disagreement.
        message: String,
    },

    /// A value could not be encoded.
    #[error("encoding failed: {message}")]
    Encoding {
        /// Description of the encoding error.
        message: String,
    },

    /// A payload did not match the expected shape.
    #[error("decoding failed at {location}: {message}")]
    Decoding {
        /// Absolute path of the decoded data.
        location: String,
        /// Description of the decoding error.
        message: String,
    },

    /// Operation timed out.
    #[error("operation timeout")]
    Timeout,

    /// Operation was cancelled.
    #[error("operation cancelled: {reason}")]
    Cancelled {
        /// Reason for the cancellation.
        reason: String,
    },

    /// Backend does not support the requested operation.
    #[error("unsupported operation: {message}")]
    Unsupported {
        /// Description of the unsupported operation.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a requires-replace error.
    pub fn requires_replace(location: impl Into<String>) -> Self {
        Self::RequiresReplace {
            location: location.into(),
        }
    }

    /// Creates an unrelated location error.
    pub fn unrelated_location(location: impl Into<String>, other: impl Into<String>) -> Self {
        Self::UnrelatedLocation {
            location: location.into(),
            other: other.into(),
        }
    }

    /// Creates a structural conflict error.
    pub fn structural(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StructuralConflict {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Creates a precondition error.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// Creates a commit error.
    pub fn commit(message: impl Into<String>) -> Self {
        Self::Commit {
            message: message.into(),
        }
    }

    /// Creates a file commit error.
    pub fn file(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::File {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Creates a consistency error.
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency {
            message: message.into(),
        }
    }

    /// Creates an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Creates a decoding error.
    pub fn decoding(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decoding {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Creates a cancelled error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Creates an unsupported operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for programmer errors: tree shape violations that never
    /// occur in correct usage.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            CoreError::RequiresReplace { .. }
                | CoreError::UnrelatedLocation { .. }
                | CoreError::StructuralConflict { .. }
                | CoreError::MultiLevelWrite { .. }
                | CoreError::DepthExceeded { .. }
                | CoreError::InvalidKey { .. }
                | CoreError::EmptyTransaction
        )
    }

    /// Returns true if the error is a runtime failure the caller can react to.
    pub fn is_recoverable(&self) -> bool {
        !self.is_structural()
    }
}
