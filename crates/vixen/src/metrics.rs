//! Prometheus collectors for the WAL storage.

use crate::error::{Result, WalError};
use prometheus::{IntCounter, IntGauge, Registry};

/// Gauges and counters tracking index and journal activity.
///
/// Registered against the caller's registry at open, unregistered at close.
pub(crate) struct StorageMetrics {
    registry: Option<Registry>,
    pub active_series: IntGauge,
    pub deleted_series: IntGauge,
    pub created_series_total: IntCounter,
    pub removed_series_total: IntCounter,
    pub appended_samples_total: IntCounter,
    pub appended_exemplars_total: IntCounter,
}

impl StorageMetrics {
    pub fn new(registry: Option<&Registry>) -> Result<Self> {
        let active_series = IntGauge::new(
            "vixen_wal_storage_active_series",
            "Current number of active series being tracked by the WAL storage",
        )
        .map_err(metrics_err)?;
        let deleted_series = IntGauge::new(
            "vixen_wal_storage_deleted_series",
            "Current number of series marked for deletion from memory",
        )
        .map_err(metrics_err)?;
        let created_series_total = IntCounter::new(
            "vixen_wal_storage_created_series_total",
            "Total number of created series appended to the WAL",
        )
        .map_err(metrics_err)?;
        let removed_series_total = IntCounter::new(
            "vixen_wal_storage_removed_series_total",
            "Total number of created series removed from the WAL",
        )
        .map_err(metrics_err)?;
        let appended_samples_total = IntCounter::new(
            "vixen_wal_samples_appended_total",
            "Total number of samples appended to the WAL",
        )
        .map_err(metrics_err)?;
        let appended_exemplars_total = IntCounter::new(
            "vixen_wal_exemplars_appended_total",
            "Total number of exemplars appended to the WAL",
        )
        .map_err(metrics_err)?;

        if let Some(r) = registry {
            r.register(Box::new(active_series.clone()))
                .map_err(metrics_err)?;
            r.register(Box::new(deleted_series.clone()))
                .map_err(metrics_err)?;
            r.register(Box::new(created_series_total.clone()))
                .map_err(metrics_err)?;
            r.register(Box::new(removed_series_total.clone()))
                .map_err(metrics_err)?;
            r.register(Box::new(appended_samples_total.clone()))
                .map_err(metrics_err)?;
            r.register(Box::new(appended_exemplars_total.clone()))
                .map_err(metrics_err)?;
        }

        Ok(Self {
            registry: registry.cloned(),
            active_series,
            deleted_series,
            created_series_total,
            removed_series_total,
            appended_samples_total,
            appended_exemplars_total,
        })
    }

    pub fn unregister(&self) {
        let Some(r) = &self.registry else {
            return;
        };
        let _ = r.unregister(Box::new(self.active_series.clone()));
        let _ = r.unregister(Box::new(self.deleted_series.clone()));
        let _ = r.unregister(Box::new(self.created_series_total.clone()));
        let _ = r.unregister(Box::new(self.removed_series_total.clone()));
        let _ = r.unregister(Box::new(self.appended_samples_total.clone()));
        let _ = r.unregister(Box::new(self.appended_exemplars_total.clone()));
    }
}

fn metrics_err(err: prometheus::Error) -> WalError {
    WalError::Metrics(err.to_string())
}
