//! Service Layer Error Types

use crate::db::DatabaseError;
use crate::models::ontology::SchemaError;
use thiserror::Error;

/// Engine operation errors.
///
/// The caller-facing taxonomy: schema errors are fatal at startup,
/// validation errors abort the enclosing transaction and carry enough
/// detail to locate the offending record, provider errors surface only
/// after local retry recovery is exhausted.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Referenced type not declared in the ontology
    #[error("Unknown type: {0}")]
    UnknownType(String),

    /// Anchor node not found; distinguished from "anchor has no matches"
    #[error("Node not found: {table}/{id}")]
    NodeNotFound { table: String, id: i64 },

    /// Record-level validation failure (missing identity field, broken
    /// edge reference, malformed value)
    #[error("Validation failed for {table} at {location}: {detail}")]
    Validation {
        table: String,
        location: String,
        detail: String,
    },

    /// Ontology error surfaced after startup (should not normally happen)
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Database operation failed
    #[error("Database operation failed: {0}")]
    Database(#[from] DatabaseError),

    /// External provider (lexical/embedding) failed after bounded retries
    #[error("Provider '{provider}' failed: {detail}")]
    Provider { provider: String, detail: String },

    /// Flat-file synchronization failure; prior canonical state is intact
    #[error("Sync failed: {context}")]
    SyncFailed { context: String },

    /// Filesystem error outside the atomic-swap protocol
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Create an unknown type error
    pub fn unknown_type(name: impl Into<String>) -> Self {
        Self::UnknownType(name.into())
    }

    /// Create a node not found error
    pub fn node_not_found(table: impl Into<String>, id: i64) -> Self {
        Self::NodeNotFound {
            table: table.into(),
            id,
        }
    }

    /// Create a validation error locating the offending record
    pub fn validation(
        table: impl Into<String>,
        location: impl std::fmt::Display,
        detail: impl Into<String>,
    ) -> Self {
        Self::Validation {
            table: table.into(),
            location: location.to_string(),
            detail: detail.into(),
        }
    }

    /// Create a provider failure error
    pub fn provider(provider: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            detail: detail.into(),
        }
    }

    /// Create a sync failed error
    pub fn sync_failed(context: impl Into<String>) -> Self {
        Self::SyncFailed {
            context: context.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}
