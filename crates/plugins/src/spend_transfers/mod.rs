//! Spend transfers plugin bundle.
//!
//! Sample bundle exercising the plugin contract end to end: it keeps one
//! row per `SpendTx` in its own table and rolls rows back on reorgs.
//!
//! # Database Tables
//!
//! - `spend_transfers` - One row per mirrored spend
//!
//! # Usage
//!
//! ```ignore
//! use aesync_plugins::SpendTransfersBundle;
//!
//! bundles.register(Box::new(SpendTransfersBundle::new(pool)));
//! ```

pub mod models;
mod plugin;
pub mod storage;

use std::sync::Arc;

use aesync_core::ports::Plugin;
use sqlx::PgPool;

use crate::PluginBundle;

pub use models::SpendTransfer;
pub use plugin::{PLUGIN_NAME, PLUGIN_VERSION, SpendTransfersPlugin};
pub use storage::{MIGRATIONS, PgSpendTransfersStorage, SpendTransfersStorage};

/// Plugin bundle for spend transfers.
pub struct SpendTransfersBundle {
    pool: PgPool,
}

impl SpendTransfersBundle {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PluginBundle for SpendTransfersBundle {
    fn name(&self) -> &'static str {
        "spend_transfers"
    }

    fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        let storage = Arc::new(PgSpendTransfersStorage::new(self.pool.clone()));
        vec![Arc::new(SpendTransfersPlugin::new(storage))]
    }

    fn migrations(&self) -> &'static [&'static str] {
        MIGRATIONS
    }

    fn tables_to_purge(&self) -> &'static [&'static str] {
        &["spend_transfers"]
    }
}
