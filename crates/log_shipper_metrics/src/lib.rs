//! Prometheus metric registration shared by the connection, batch and
//! health components.
//!
//! Metrics are `LazyLock` statics registered against a crate-owned
//! registry, using the plain `prometheus` crate macros directly rather than
//! a wrapper layer.

use std::sync::LazyLock;

use prometheus::{
    register_int_counter_vec_with_registry,
    register_int_counter_with_registry,
    register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry,
    IntCounter,
    IntCounterVec,
    IntGauge,
    IntGaugeVec,
    Registry,
};

pub static LOG_SHIPPER_REGISTRY: LazyLock<Registry> =
    LazyLock::new(|| Registry::new_custom(Some("log_shipper".to_string()), None).expect("registry"));

/// Metrics owned by the Connection Manager.
pub struct ConnectionMetrics {
    pub connect_successes: IntCounter,
    pub connect_failures: IntCounter,
    pub reconnects: IntCounter,
    pub last_connect_time_ms: IntGauge,
    pub last_disconnect_time_ms: IntGauge,
}

impl Default for ConnectionMetrics {
    /// Registers against a private, freshly-created registry rather than
    /// the shared `LOG_SHIPPER_REGISTRY`: this crate doesn't itself expose
    /// a `/metrics` HTTP endpoint (mounting one is a host-application
    /// concern), and a `ConnectionManager` is typically a process-wide
    /// singleton, so nothing is lost by each instance owning its own
    /// registry. A shared one would panic on double-registration the
    /// moment a second instance exists in the same process, as in this
    /// crate's own test suite. Embedders that do want these metrics on a
    /// combined registry can call
    /// `ConnectionMetrics::new(&LOG_SHIPPER_REGISTRY)` directly.
    fn default() -> Self {
        Self::new(&Registry::new())
    }
}

impl ConnectionMetrics {
    /// Registers this component's metrics against `registry`. Pass
    /// `&LOG_SHIPPER_REGISTRY` to publish on the shared process registry,
    /// or a throwaway `Registry::new()` (what `Default` does) to keep this
    /// instance's metrics private.
    pub fn new(registry: &Registry) -> Self {
        Self {
            connect_successes: register_int_counter_with_registry!(
                "connection_connect_successes_total",
                "Number of successful connect attempts",
                registry
            )
            .expect("metric registration"),
            connect_failures: register_int_counter_with_registry!(
                "connection_connect_failures_total",
                "Number of failed connect attempts",
                registry
            )
            .expect("metric registration"),
            reconnects: register_int_counter_with_registry!(
                "connection_reconnects_total",
                "Number of times the client reconnected after a loss",
                registry
            )
            .expect("metric registration"),
            last_connect_time_ms: register_int_gauge_with_registry!(
                "connection_last_connect_time_ms",
                "Unix millis of the last successful connect",
                registry
            )
            .expect("metric registration"),
            last_disconnect_time_ms: register_int_gauge_with_registry!(
                "connection_last_disconnect_time_ms",
                "Unix millis of the last observed disconnect",
                registry
            )
            .expect("metric registration"),
        }
    }
}

/// Metrics owned by the Batch Manager, plus a per-collection breakdown
/// (entries processed / batches flushed / retries / DLQ writes, labeled
/// by collection).
pub struct BatchMetrics {
    pub total_entries_processed: IntCounter,
    pub total_batches_flushed: IntCounter,
    pub total_flush_failures: IntCounter,
    pub total_retries: IntCounter,
    pub total_dlq_writes: IntCounter,
    pub last_flush_time_ms: IntGauge,
    pub current_memory_usage: IntGauge,
    pub collections_active: IntGauge,
    pub entries_processed_by_collection: IntCounterVec,
    pub batches_flushed_by_collection: IntCounterVec,
    pub retries_by_collection: IntCounterVec,
    pub dlq_writes_by_collection: IntCounterVec,
}

impl Default for BatchMetrics {
    /// See `ConnectionMetrics::default`'s doc comment: private
    /// freshly-created registry per instance, not the shared
    /// `LOG_SHIPPER_REGISTRY`, so that constructing more than one
    /// `BatchManager` in a process (as every test in this workspace does)
    /// never collides on metric names.
    fn default() -> Self {
        Self::new(&Registry::new())
    }
}

impl BatchMetrics {
    /// Registers this component's metrics against `registry`. Pass
    /// `&LOG_SHIPPER_REGISTRY` to publish on the shared process registry,
    /// or a throwaway `Registry::new()` (what `Default` does) to keep this
    /// instance's metrics private.
    pub fn new(registry: &Registry) -> Self {
        Self {
            total_entries_processed: register_int_counter_with_registry!(
                "batch_entries_processed_total",
                "Number of log entries accepted by the batch manager",
                registry
            )
            .expect("metric registration"),
            total_batches_flushed: register_int_counter_with_registry!(
                "batch_batches_flushed_total",
                "Number of successful batch flushes",
                registry
            )
            .expect("metric registration"),
            total_flush_failures: register_int_counter_with_registry!(
                "batch_flush_failures_total",
                "Number of flush attempts that did not fully succeed",
                registry
            )
            .expect("metric registration"),
            total_retries: register_int_counter_with_registry!(
                "batch_retries_total",
                "Number of whole-batch retries scheduled after a transient failure",
                registry
            )
            .expect("metric registration"),
            total_dlq_writes: register_int_counter_with_registry!(
                "batch_dlq_writes_total",
                "Number of records written to a dead-letter collection",
                registry
            )
            .expect("metric registration"),
            last_flush_time_ms: register_int_gauge_with_registry!(
                "batch_last_flush_time_ms",
                "Unix millis of the last successful flush, any collection",
                registry
            )
            .expect("metric registration"),
            current_memory_usage: register_int_gauge_with_registry!(
                "batch_current_memory_usage_bytes",
                "Estimated bytes currently staged across all collections",
                registry
            )
            .expect("metric registration"),
            collections_active: register_int_gauge_with_registry!(
                "batch_collections_active",
                "Number of distinct destination collections seen so far; a collection's \
                 batch slot is reused, never torn down, once its first entry is staged",
                registry
            )
            .expect("metric registration"),
            entries_processed_by_collection: register_int_counter_vec_with_registry!(
                "batch_entries_processed_by_collection_total",
                "Entries accepted, labeled by destination collection",
                &["collection"],
                registry
            )
            .expect("metric registration"),
            batches_flushed_by_collection: register_int_counter_vec_with_registry!(
                "batch_batches_flushed_by_collection_total",
                "Successful flushes, labeled by collection",
                &["collection"],
                registry
            )
            .expect("metric registration"),
            retries_by_collection: register_int_counter_vec_with_registry!(
                "batch_retries_by_collection_total",
                "Whole-batch retries, labeled by collection",
                &["collection"],
                registry
            )
            .expect("metric registration"),
            dlq_writes_by_collection: register_int_counter_vec_with_registry!(
                "batch_dlq_writes_by_collection_total",
                "Dead-letter writes, labeled by source collection",
                &["collection"],
                registry
            )
            .expect("metric registration"),
        }
    }
}

/// Point-in-time snapshot returned by `ConnectionManager::metrics()`.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionMetricsSnapshot {
    pub successes: u64,
    pub failures: u64,
    pub reconnects: u64,
    pub last_connection_time_ms: Option<i64>,
    pub last_disconnect_time_ms: Option<i64>,
}

impl ConnectionMetrics {
    pub fn snapshot(&self) -> ConnectionMetricsSnapshot {
        let last_connect = self.last_connect_time_ms.get();
        let last_disconnect = self.last_disconnect_time_ms.get();
        ConnectionMetricsSnapshot {
            successes: self.connect_successes.get(),
            failures: self.connect_failures.get(),
            reconnects: self.reconnects.get(),
            last_connection_time_ms: (last_connect > 0).then_some(last_connect),
            last_disconnect_time_ms: (last_disconnect > 0).then_some(last_disconnect),
        }
    }
}

/// Point-in-time snapshot returned by `BatchManager::metrics()`.
#[derive(Debug, Clone, Copy)]
pub struct BatchMetricsSnapshot {
    pub total_entries_processed: u64,
    pub total_batches_flushed: u64,
    pub total_flush_failures: u64,
    pub total_retries: u64,
    pub average_batch_size: f64,
    pub last_flush_time_ms: Option<i64>,
    pub current_memory_usage: i64,
    pub collections_active: i64,
}

impl BatchMetrics {
    pub fn snapshot(&self) -> BatchMetricsSnapshot {
        let flushed = self.total_batches_flushed.get();
        let processed = self.total_entries_processed.get();
        let last_flush = self.last_flush_time_ms.get();
        BatchMetricsSnapshot {
            total_entries_processed: processed,
            total_batches_flushed: flushed,
            total_flush_failures: self.total_flush_failures.get(),
            total_retries: self.total_retries.get(),
            average_batch_size: if flushed == 0 {
                0.0
            } else {
                processed as f64 / flushed as f64
            },
            last_flush_time_ms: (last_flush > 0).then_some(last_flush),
            current_memory_usage: self.current_memory_usage.get(),
            collections_active: self.collections_active.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_snapshot_computes_average() {
        let m = BatchMetrics::new(&Registry::new());
        m.total_entries_processed.inc_by(30);
        m.total_batches_flushed.inc_by(3);
        let snap = m.snapshot();
        assert_eq!(snap.average_batch_size, 10.0);
    }

    #[test]
    fn batch_snapshot_zero_flushes_is_zero_average() {
        let m = BatchMetrics::new(&Registry::new());
        let snap = m.snapshot();
        assert_eq!(snap.average_batch_size, 0.0);
    }
}
