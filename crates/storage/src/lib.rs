//! Storage layer for the aesync chain mirror.
//!
//! This crate provides PostgreSQL implementations of the repository traits
//! defined in `aesync-core`. It handles all database interactions including
//! connection pooling, migrations, purge and the reorg rollback.
//!
//! # Architecture
//!
//! The storage layer follows the repository pattern:
//!
//! - [`postgres::Database`] - Connection pool management
//! - [`postgres::PgRepositories`] - Composite repository for all entity types
//! - Individual repositories for transactions, blocks, sync state and dead letters
//!
//! # Usage
//!
//! ```ignore
//! use aesync_storage::{Database, DatabaseConfig, PgRepositories};
//!
//! let config = DatabaseConfig::for_sync(&database_url, sync.bulk_parallel_workers);
//! let db = Database::connect(&config).await?;
//! db.migrate().await?;
//!
//! let repositories = Arc::new(PgRepositories::new(Arc::new(db)));
//! ```

pub mod postgres;

pub use postgres::{Database, DatabaseConfig, PgRepositories, PurgeStats};
