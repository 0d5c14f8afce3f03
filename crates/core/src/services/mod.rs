pub mod block_sync;
pub mod block_validation;
pub mod health;
pub mod indexer;
pub mod live_indexer;
pub mod micro_block;
pub mod plugin_batch_processor;
pub mod plugin_failed_transaction;
pub mod plugin_registry;
pub mod plugin_upgrade;
pub mod reorg;

pub use block_sync::{BlockSyncService, RangeSync, RangeSyncOptions, WritePath};
pub use block_validation::{BlockValidationService, ValidationReport};
pub use health::{HealthReport, HealthService, HealthStatus};
pub use indexer::{IndexerService, SyncMode, SyncPlan, TickOutcome, plan_backward};
pub use live_indexer::{LiveActivity, LiveIndexerService, LiveTxOutcome};
pub use micro_block::MicroBlockService;
pub use plugin_batch_processor::{BatchReport, DeliveryOutcome, PluginBatchProcessorService};
pub use plugin_failed_transaction::{PluginFailedTransactionService, RetryReport};
pub use plugin_registry::{BootstrapReport, PluginFilterSummary, PluginRegistryService, VersionChange};
pub use plugin_upgrade::{PluginUpgradeService, UpgradeReport};
pub use reorg::ReorgService;
