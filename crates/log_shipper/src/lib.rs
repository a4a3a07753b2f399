//! Producer-facing facade that wires the Connection Manager, Batch Manager,
//! Ingress Service and Health Reporter behind one handle.

pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use log_shipper_batch::{
    BatchManager,
    LogEntry,
};
pub use log_shipper_config::{
    Config,
    ConnectionOptions,
};
use log_shipper_connection::{
    Connector,
    HealthStatus,
};
pub use log_shipper_connection::{
    ConnectionManager,
    MongoConnector,
};
use log_shipper_health::{
    HealthReport,
    HealthReporter,
};
use log_shipper_ingress::IngressService;
pub use log_shipper_metrics::{
    BatchMetricsSnapshot,
    ConnectionManagerMetrics,
};
use mongodb::bson::Document;
use tokio::sync::watch;

pub use log_shipper_errors::LogShipperError;

/// Entry point for a running log shipper instance. Holds a background
/// periodic-flush task, stopped when the handle is dropped or `shutdown`
/// is called explicitly.
pub struct LogShipper {
    ingress: IngressService,
    health: HealthReporter,
    connection: ConnectionManager,
    timer_shutdown: watch::Sender<bool>,
}

impl LogShipper {
    /// Validates `config`, wires the four components together with the
    /// production `MongoConnector`, and starts the periodic flush timer.
    pub fn start(config: Config) -> Result<Self, LogShipperError> {
        Self::start_with_connector(config, Arc::new(MongoConnector))
    }

    /// Same as `start`, but with an injected `Connector`, the seam tests
    /// (and any embedder wanting a fake database) use instead of dialing a
    /// real MongoDB deployment.
    pub fn start_with_connector(config: Config, connector: Arc<dyn Connector>) -> Result<Self, LogShipperError> {
        config.validate()?;

        let connection = ConnectionManager::with_connector(config.clone(), connector);
        let batch = BatchManager::new(config.clone(), connection.clone());
        let ingress = IngressService::new(batch.clone());
        let health = HealthReporter::new(config, connection.clone(), batch.clone());

        let (timer_shutdown, rx) = watch::channel(false);
        let timer_batch = batch.clone();
        tokio::spawn(async move { timer_batch.run_timer(rx).await });

        Ok(Self { ingress, health, connection, timer_shutdown })
    }

    /// Stamps and stages a log entry for `collection`.
    pub async fn log(&self, collection: impl Into<String>, entry: LogEntry) {
        self.ingress.log(collection, entry).await;
    }

    /// Builds an entry from an error value and optional metadata, then
    /// stages it the same way as `log`.
    pub async fn log_error(
        &self,
        collection: impl Into<String>,
        err: impl Into<anyhow::Error>,
        metadata: Option<Document>,
    ) {
        self.ingress.log_error(collection, err, metadata).await;
    }

    /// `flush()`.
    pub async fn flush(&self) {
        self.ingress.flush().await;
    }

    /// `shutdown(timeout?)`: drains staged batches, then stops the
    /// periodic timer and closes the database handle.
    pub async fn shutdown(&self, timeout: Option<Duration>) {
        self.ingress.shutdown(timeout).await;
        let _ = self.timer_shutdown.send(true);
        self.connection.shutdown();
    }

    pub async fn health(&self) -> HealthReport {
        self.health.report().await
    }

    pub async fn health_probe(&self) -> HealthStatus {
        self.connection.health_probe().await
    }
}
