//! Sync engine configuration.
//!
//! The binary fills this from CLI flags / environment variables; services
//! only ever see the validated struct.

use std::time::Duration;

use crate::error::IndexerError;

/// Hard page-size cap of the Chain Read API.
pub const API_MAX_PAGE_SIZE: u32 = 100;

/// Configuration shared by all sync services.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How many heights below the tip are checked for divergence and revalidated.
    pub reorg_depth: u64,
    /// Backward sync tick interval.
    pub sync_interval: Duration,
    /// Requested API page size (clamped by [`SyncConfig::effective_page_size`]).
    pub page_size: u32,
    /// Blocks per range in normal mode.
    pub normal_batch_blocks: u64,
    /// Blocks per range in bulk mode.
    pub bulk_batch_blocks: u64,
    /// Parallel range workers in bulk mode.
    pub bulk_parallel_workers: usize,
    /// Remaining-block distance above which bulk mode is used.
    pub bulk_mode_threshold: u64,
    /// Interval of the recent-window revalidation.
    pub validation_interval: Duration,
    /// Interval of the dead-letter version check.
    pub failed_retry_interval: Duration,
    /// Batch size for manual version-upgrade backfills.
    pub upgrade_batch_size: usize,
    /// Live lag (blocks) at which health becomes `warning`.
    pub health_warning_lag: u64,
    /// Live lag (blocks) at which health becomes `critical`.
    pub health_critical_lag: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reorg_depth: 100,
            sync_interval: Duration::from_secs(5),
            page_size: API_MAX_PAGE_SIZE,
            normal_batch_blocks: 100,
            bulk_batch_blocks: 1000,
            bulk_parallel_workers: 4,
            bulk_mode_threshold: 1000,
            validation_interval: Duration::from_secs(60),
            failed_retry_interval: Duration::from_secs(300),
            upgrade_batch_size: 500,
            health_warning_lag: 10,
            health_critical_lag: 100,
        }
    }
}

impl SyncConfig {
    /// Page size actually sent to the API.
    pub fn effective_page_size(&self) -> u32 {
        self.page_size.clamp(1, API_MAX_PAGE_SIZE)
    }

    /// Reject values that would stall or spin the loops.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.normal_batch_blocks == 0 || self.bulk_batch_blocks == 0 {
            return Err(IndexerError::ConfigError(
                "batch block counts must be greater than zero".into(),
            ));
        }
        if self.bulk_parallel_workers == 0 {
            return Err(IndexerError::ConfigError(
                "bulk_parallel_workers must be greater than zero".into(),
            ));
        }
        if self.upgrade_batch_size == 0 {
            return Err(IndexerError::ConfigError(
                "upgrade_batch_size must be greater than zero".into(),
            ));
        }
        if self.health_warning_lag > self.health_critical_lag {
            return Err(IndexerError::ConfigError(format!(
                "health_warning_lag ({}) exceeds health_critical_lag ({})",
                self.health_warning_lag, self.health_critical_lag
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_clamped_to_api_cap() {
        let config = SyncConfig {
            page_size: 500,
            ..Default::default()
        };
        assert_eq!(config.effective_page_size(), API_MAX_PAGE_SIZE);

        let config = SyncConfig {
            page_size: 0,
            ..Default::default()
        };
        assert_eq!(config.effective_page_size(), 1);
    }

    #[test]
    fn validate_rejects_zero_workers_and_inverted_thresholds() {
        let config = SyncConfig {
            bulk_parallel_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            health_warning_lag: 50,
            health_critical_lag: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        assert!(SyncConfig::default().validate().is_ok());
    }
}
