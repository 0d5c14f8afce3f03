//! Error types for the sync engine.
//!
//! This module defines a hierarchy of error types:
//!
//! - [`DomainError`] - Business rule violations (bad ranges, inconsistent state)
//! - [`StorageError`] - Database/repository errors
//! - [`ChainError`] - Chain Read API and push channel errors
//! - [`PluginError`] - Failures raised by plugins
//! - [`IndexerError`] - Top-level orchestration errors
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries.

use thiserror::Error;

// =============================================================================
// Domain Errors
// =============================================================================

/// Business logic and domain rule violations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A height range with `from > to` was requested.
    #[error("Invalid height range: {from}..={to}")]
    InvalidRange { from: u64, to: u64 },

    /// The singleton sync state row is missing when it must exist.
    #[error("Sync state not initialized")]
    SyncStateMissing,

    /// Two plugins were registered with the same name.
    #[error("Duplicate plugin name: {0}")]
    DuplicatePlugin(String),

    /// Generic validation error.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

// =============================================================================
// Storage Errors
// =============================================================================

/// Database and repository errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to establish database connection.
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    /// SQL query execution failed.
    #[error("Query execution error: {0}")]
    QueryError(String),

    /// Requested record was not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Database constraint was violated (unique, foreign key, etc.).
    ///
    /// During concurrent bulk inserts a duplicate key means another loop
    /// already wrote the row.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    MigrationError(String),

    /// Transaction commit/rollback failed.
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// Data serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

// =============================================================================
// Chain Errors
// =============================================================================

/// Chain Read API and push channel errors.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Non-success status code from the API.
    #[error("Unexpected status {status} for {path}")]
    Status { status: u16, path: String },

    /// Response body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Entity does not exist upstream.
    #[error("Not found upstream: {0}")]
    NotFound(String),

    /// Push subscription failed or disconnected.
    #[error("Subscription error: {0}")]
    SubscriptionError(String),
}

// =============================================================================
// Plugin Errors
// =============================================================================

/// Errors raised by plugin code.
///
/// These never escape the fan-out boundary; they end up as dead letters.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Batch processing failed.
    #[error("Plugin {plugin} failed: {message}")]
    Processing { plugin: String, message: String },

    /// A decode hook failed for one transaction.
    #[error("Plugin {plugin} could not decode {tx_hash}: {message}")]
    Decode {
        plugin: String,
        tx_hash: String,
        message: String,
    },

    /// No plugin with this name is registered.
    #[error("Plugin not registered: {0}")]
    NotRegistered(String),

    /// The plugin's own storage failed.
    #[error("Plugin storage error: {0}")]
    Storage(#[from] StorageError),
}

impl PluginError {
    /// Shorthand for a processing failure.
    pub fn processing(plugin: &str, message: impl Into<String>) -> Self {
        Self::Processing {
            plugin: plugin.to_string(),
            message: message.into(),
        }
    }
}

// =============================================================================
// Indexer Errors
// =============================================================================

/// Top-level orchestration errors.
///
/// Returned by the services in [`crate::services`]; wraps all lower-level
/// errors.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Domain logic error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Storage/database error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Chain API error.
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// Plugin error surfaced outside the fan-out (admin triggers).
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A run of this loop is already in progress.
    #[error("Sync loop already running")]
    AlreadyRunning,

    /// Graceful shutdown was requested.
    ///
    /// This is not really an error but uses the error type for control flow.
    #[error("Shutdown requested")]
    ShutdownRequested,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for indexer operations.
pub type IndexerResult<T> = Result<T, IndexerError>;

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;
