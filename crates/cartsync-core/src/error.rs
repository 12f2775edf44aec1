//! Error types for cartsync-core

use thiserror::Error;

use crate::models::EntityKind;

/// Result type alias using cartsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cartsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// `SQLite` error from the local store
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote store error
    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A foreign reference could not be resolved on the other replica
    #[error("Missing {kind} reference: {detail}")]
    MissingReference {
        /// Kind of the referenced entity
        kind: EntityKind,
        /// What was being resolved
        detail: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The synchronizer has been stopped
    #[error("Synchronizer is not running")]
    Closed,
}

impl Error {
    /// Returns true for remote permission errors, which are expected while
    /// the signed-in identity is changing.
    pub const fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Remote(RemoteError::PermissionDenied(_)))
    }
}

/// Errors reported by a remote store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The current identity may not access the path
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The remote store cannot be reached
    #[error("Remote store unavailable")]
    Unavailable,

    /// A path segment was empty or contained a separator
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A node did not have the expected shape
    #[error("Malformed document at {path}: {reason}")]
    Malformed {
        /// Path of the offending node
        path: String,
        /// What was wrong with it
        reason: String,
    },
}
