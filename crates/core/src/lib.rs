//! Core domain layer for the aesync chain mirror.
//!
//! This crate contains the domain models, port traits (interfaces), and
//! sync services that mirror an æternity-style chain into a relational
//! store. It follows hexagonal architecture principles - this is the
//! innermost layer with no dependencies on infrastructure.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      aesync (binary)                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │   aesync-admin    │   aesync-plugins   │    aesync-mdw      │
//! │  (GraphQL/HTTP)   │     (bundles)      │  (HTTP + WebSocket)│
//! ├───────────────────┴────────────────────┴────────────────────┤
//! │                     aesync-storage                          │
//! │                      (PostgreSQL)                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     aesync-core  ← YOU ARE HERE             │
//! │               (models, ports, services)                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`models`] - Domain models (Transaction, KeyBlock, SyncState, etc.)
//! - [`ports`] - Interface traits for adapters to implement
//! - [`services`] - Sync loops, reorg handling and plugin fan-out
//! - [`events`] - Transaction-created broadcast
//! - [`config`] - Sync engine configuration
//! - [`error`] - Domain error types
//! - [`metrics`] - Prometheus metrics definitions
//!
//! # Key Concepts
//!
//! ## Ports
//!
//! - [`ports::ChainApi`] / [`ports::ChainSubscriber`] - Read API and push channels
//! - [`ports::Repositories`] - Persist and query mirrored data
//! - [`ports::Plugin`] - Downstream consumers of persisted batches
//!
//! ## Sync Loops
//!
//! Four loops run as independent tasks against one store:
//!
//! 1. [`services::IndexerService`] - backward backfill from the tip to genesis
//! 2. [`services::LiveIndexerService`] - push-driven forward tailing
//! 3. [`services::BlockValidationService`] - recent-window revalidation
//! 4. [`services::PluginFailedTransactionService`] - dead-letter replay
//!
//! Every persisted batch is handed to all plugins by
//! [`services::PluginBatchProcessorService`]; a plugin failure becomes a
//! dead letter and never blocks the loops.

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod services;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
