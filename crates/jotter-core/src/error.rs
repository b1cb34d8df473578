//! Error types for jotter-core

use thiserror::Error;

use crate::sync::GatewayError;

/// Result type alias using jotter-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in jotter-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry or record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed `table:id` entity reference
    #[error("Invalid entity reference: {0}")]
    InvalidEntityRef(String),

    /// Resolution requested for an entity that has no open conflict
    #[error("Entity is not in conflict: {0}")]
    NotInConflict(String),

    /// Remote API failure that aborted the operation
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Sync cycle failure not attributable to a single entity
    #[error("Sync error: {0}")]
    Sync(String),
}

impl Error {
    /// Whether this error came from an authentication failure at the remote API.
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Gateway(GatewayError::Unauthorized(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_errors_keep_their_message() {
        let error = Error::from(GatewayError::Unauthorized("token expired".to_string()));
        assert!(error.is_unauthorized());
        assert!(error.to_string().contains("token expired"));
    }

    #[test]
    fn not_in_conflict_names_the_entity() {
        let error = Error::NotInConflict("entries:abc".to_string());
        assert_eq!(error.to_string(), "Entity is not in conflict: entries:abc");
        assert!(!error.is_unauthorized());
    }
}
