//! Health Reporter.
//!
//! Aggregates Connection Manager and Batch Manager status into a single
//! view. Reads both components' metrics atomically-enough for reporting:
//! no cross-component locking, each individual counter is already
//! consistent on its own.

use log_shipper_batch::BatchManager;
use log_shipper_config::Config;
use log_shipper_connection::{
    ConnectionManager,
    ConnectionManagerMetrics,
    HealthStatus,
};
use log_shipper_metrics::BatchMetricsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Up,
    Degraded,
    Down,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub timestamp_ms: i64,
    pub database_status: HealthStatus,
    pub batch_status: Status,
    pub overall_status: Status,
    pub connection_metrics: ConnectionManagerMetrics,
    pub batch_metrics: BatchMetricsSnapshot,
}

fn now_unix_ms() -> i64 {
    use std::time::{
        SystemTime,
        UNIX_EPOCH,
    };
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Computes batch status: degraded if the flush failure rate exceeds 10%
/// or staged memory exceeds 90% of the configured cap.
fn batch_status(metrics: &BatchMetricsSnapshot, max_memory_usage_bytes: u64) -> Status {
    let failure_rate = metrics.total_flush_failures as f64 / metrics.total_batches_flushed.max(1) as f64;
    let memory_pressure = if max_memory_usage_bytes == 0 {
        0.0
    } else {
        metrics.current_memory_usage as f64 / max_memory_usage_bytes as f64
    };
    if failure_rate > 0.1 || memory_pressure > 0.9 {
        Status::Degraded
    } else {
        Status::Up
    }
}

pub struct HealthReporter {
    config: Config,
    connection: ConnectionManager,
    batch: BatchManager,
}

impl HealthReporter {
    pub fn new(config: Config, connection: ConnectionManager, batch: BatchManager) -> Self {
        Self { config, connection, batch }
    }

    pub async fn report(&self) -> HealthReport {
        let database_status = self.connection.health_probe().await;
        let connection_metrics = self.connection.metrics();
        let batch_metrics = self.batch.metrics();
        let batch_status = batch_status(&batch_metrics, self.config.max_memory_usage_bytes());
        let overall_status = match &database_status {
            HealthStatus::Down { .. } => Status::Down,
            HealthStatus::Up if batch_status == Status::Degraded => Status::Degraded,
            HealthStatus::Up => Status::Up,
        };
        HealthReport {
            timestamp_ms: now_unix_ms(),
            database_status,
            batch_status,
            overall_status,
            connection_metrics,
            batch_metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use log_shipper_connection::{
        Connector,
        Handle,
        WeakConnectionManager,
    };
    use mongodb::error::{
        Error as MongoError,
        ErrorKind,
    };

    use super::*;

    struct AlwaysFailConnector;

    #[async_trait]
    impl Connector for AlwaysFailConnector {
        async fn connect(&self, _config: &Config, _events: WeakConnectionManager) -> Result<Handle, MongoError> {
            Err(MongoError::from(ErrorKind::Internal { message: "refused".to_string() }))
        }
    }

    fn test_config() -> Config {
        Config {
            uri: "mongodb://localhost:27017/logs".into(),
            default_collection: "logs".into(),
            batch_size: 500,
            flush_interval_ms: 60_000,
            max_memory_usage_mb: 100,
            retry_delay_ms: 10,
            graceful_shutdown_timeout_ms: 1000,
            circuit_failure_threshold: 5,
            circuit_open_duration_ms: 30_000,
            connection_options: log_shipper_config::ConnectionOptions::default(),
        }
    }

    #[tokio::test]
    async fn overall_is_down_when_database_is_down() {
        let config = test_config();
        let connection = ConnectionManager::with_connector(config.clone(), Arc::new(AlwaysFailConnector));
        let batch = BatchManager::new(config.clone(), connection.clone());
        let reporter = HealthReporter::new(config, connection, batch);
        let report = reporter.report().await;
        assert_eq!(report.overall_status, Status::Down);
        assert!(matches!(report.database_status, HealthStatus::Down { .. }));
    }

    #[test]
    fn batch_degraded_on_high_failure_rate() {
        let metrics = BatchMetricsSnapshot {
            total_entries_processed: 10,
            total_batches_flushed: 10,
            total_flush_failures: 2,
            total_retries: 2,
            average_batch_size: 1.0,
            last_flush_time_ms: None,
            current_memory_usage: 0,
            collections_active: 1,
        };
        assert_eq!(batch_status(&metrics, 100), Status::Degraded);
    }

    #[test]
    fn batch_degraded_on_memory_pressure() {
        let metrics = BatchMetricsSnapshot {
            total_entries_processed: 10,
            total_batches_flushed: 10,
            total_flush_failures: 0,
            total_retries: 0,
            average_batch_size: 1.0,
            last_flush_time_ms: None,
            current_memory_usage: 95,
            collections_active: 1,
        };
        assert_eq!(batch_status(&metrics, 100), Status::Degraded);
    }

    #[test]
    fn batch_up_under_normal_conditions() {
        let metrics = BatchMetricsSnapshot {
            total_entries_processed: 100,
            total_batches_flushed: 10,
            total_flush_failures: 0,
            total_retries: 0,
            average_batch_size: 10.0,
            last_flush_time_ms: None,
            current_memory_usage: 10,
            collections_active: 1,
        };
        assert_eq!(batch_status(&metrics, 100), Status::Up);
    }
}
