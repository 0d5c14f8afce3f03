//! Plugin bundles for the aesync chain mirror.
//!
//! A bundle packages one or more [`Plugin`](aesync_core::ports::Plugin)
//! instances together with:
//!
//! - SQL migrations for the tables the plugins own
//! - The list of tables cleared by `--purge`
//!
//! # Registering Bundles
//!
//! ```ignore
//! let mut bundles = BundleRegistry::new();
//! bundles.register(Box::new(SpendTransfersBundle::new(pool.clone())));
//!
//! // Run all bundle migrations
//! bundles.run_migrations(&pool).await?;
//!
//! // Explicit, static plugin list for the core registry
//! let registry = PluginRegistryService::new(bundles.plugins())?;
//! ```

pub mod spend_transfers;

mod bundle;
mod registry;

pub use bundle::PluginBundle;
pub use registry::BundleRegistry;

pub use spend_transfers::SpendTransfersBundle;
