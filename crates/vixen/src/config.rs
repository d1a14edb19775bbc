//! Configuration for the WAL storage.

use crate::wal::DEFAULT_SEGMENT_SIZE;
use std::time::Duration;

/// Default number of stripe index shards.
pub const DEFAULT_STRIPE_SIZE: usize = 16;

/// Default minimum age of WAL data before it may be truncated (12 hours).
pub const DEFAULT_CLEANUP_AGE: Duration = Duration::from_secs(12 * 60 * 60);

/// Default cadence of the embedder's cleanup loop (30 minutes).
pub const DEFAULT_CLEANUP_PERIOD: Duration = Duration::from_secs(30 * 60);

/// Configuration for [`crate::Storage`].
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Maximum size of a single WAL segment file.
    pub segment_size: usize,
    /// Number of stripe index shards. Rounded up to a power of two at open;
    /// fixed for the lifetime of the storage.
    pub stripe_size: usize,
    /// Minimum time between truncations. Consumed by the embedder's
    /// truncation scheduler, not by the storage itself.
    pub cleanup_age: Duration,
    /// How often the embedder's cleanup loop wakes up.
    pub cleanup_period: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            stripe_size: DEFAULT_STRIPE_SIZE,
            cleanup_age: DEFAULT_CLEANUP_AGE,
            cleanup_period: DEFAULT_CLEANUP_PERIOD,
        }
    }
}

impl StorageConfig {
    /// Overrides the maximum segment size.
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Overrides the number of stripe index shards.
    pub fn with_stripe_size(mut self, stripe_size: usize) -> Self {
        self.stripe_size = stripe_size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.segment_size, DEFAULT_SEGMENT_SIZE);
        assert_eq!(config.stripe_size, DEFAULT_STRIPE_SIZE);
        assert_eq!(config.cleanup_age, DEFAULT_CLEANUP_AGE);
        assert_eq!(config.cleanup_period, DEFAULT_CLEANUP_PERIOD);
    }
}
