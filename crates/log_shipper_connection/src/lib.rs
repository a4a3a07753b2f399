//! Connection Manager.
//!
//! Owns the single database handle, opens/monitors/reconnects it, and
//! trips a circuit breaker after repeated connect failures: a
//! connect-serializing async lock with a double-checked fast path, a
//! `Weak`-back-reference for the driver's own connection-lifecycle
//! callbacks, and `shutdown()` closing the handle so future acquires fail.

mod circuit;

use std::sync::{
    atomic::{
        AtomicBool,
        Ordering,
    },
    Arc,
    Weak,
};
use std::time::{
    SystemTime,
    UNIX_EPOCH,
};

use async_trait::async_trait;
use circuit::CircuitState;
pub use circuit::CircuitState as BreakerState;
use log_shipper_config::Config;
use log_shipper_errors::LogShipperError;
use log_shipper_metrics::{
    ConnectionMetrics,
    ConnectionMetricsSnapshot,
};
use mongodb::bson::{
    doc,
    Document,
};
use mongodb::options::{
    ClientOptions,
    InsertManyOptions,
};
use mongodb::Client;
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;

/// The database operations the Batch Manager and Health Reporter actually
/// invoke. Abstracting the write path behind a trait, rather than handing
/// callers a concrete `mongodb::Collection`, is what lets the
/// flush/retry/DLQ state machine in `log_shipper_batch` be exercised with a
/// fake in tests; without it, only the connect/circuit-breaker path is
/// reachable without a live MongoDB.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<(), mongodb::error::Error>;

    /// Always unordered.
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<(), mongodb::error::Error>;

    /// Lightweight ping used by `ConnectionManager::health_probe`.
    async fn ping(&self) -> Result<(), mongodb::error::Error>;

    fn database_name(&self) -> &str;
}

/// What `acquire()` hands back: a ready-to-use, cheaply-cloneable database
/// handle.
pub type Handle = Arc<dyn DocumentStore>;

/// Production `DocumentStore`: the real driver's client plus the database
/// name derived from the connection string.
pub struct MongoHandle {
    client: Client,
    database_name: String,
}

impl MongoHandle {
    /// Wraps an already-built client. Exposed for embedders that construct
    /// the client themselves; `MongoConnector` is the usual path.
    pub fn new(client: Client, database_name: String) -> Self {
        Self { client, database_name }
    }

    fn database(&self) -> mongodb::Database {
        self.client.database(&self.database_name)
    }
}

#[async_trait]
impl DocumentStore for MongoHandle {
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<(), mongodb::error::Error> {
        self.database().collection::<Document>(collection).insert_one(doc, None).await?;
        Ok(())
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<(), mongodb::error::Error> {
        let options = InsertManyOptions::builder().ordered(false).build();
        self.database().collection::<Document>(collection).insert_many(docs, options).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), mongodb::error::Error> {
        self.database().run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }

    fn database_name(&self) -> &str {
        &self.database_name
    }
}

/// Lifecycle state of the owned client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Database status reported by `health_probe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Up,
    Down { reason: String },
}

/// Abstracts over the real MongoDB driver so the breaker/retry logic can
/// be exercised with a fake in tests. `events` is handed to the real
/// connector so it can wire the driver's own connection-lifecycle
/// callbacks back to the manager that's dialing it; fakes can ignore it.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        config: &Config,
        events: WeakConnectionManager,
    ) -> Result<Handle, mongodb::error::Error>;
}

/// Forwards the driver's connection-pool and server-monitoring events to
/// the `ConnectionManager` that owns the client, so a silent close,
/// checkout failure, or heartbeat failure updates `ConnectionState`
/// instead of leaving `fast_path()` handing out a stale handle.
struct DriverEventListener(WeakConnectionManager);

impl mongodb::event::cmap::CmapEventHandler for DriverEventListener {
    fn handle_connection_closed_event(&self, _event: mongodb::event::cmap::ConnectionClosedEvent) {
        self.0.notify_connection_lost();
    }

    fn handle_connection_checkout_failed_event(
        &self,
        _event: mongodb::event::cmap::ConnectionCheckoutFailedEvent,
    ) {
        self.0.notify_connection_lost();
    }
}

impl mongodb::event::sdam::SdamEventHandler for DriverEventListener {
    fn handle_server_heartbeat_failed_event(
        &self,
        _event: mongodb::event::sdam::ServerHeartbeatFailedEvent,
    ) {
        self.0.notify_connection_lost();
    }
}

/// Production connector: builds a real `mongodb::Client` with the pool
/// parameters merged with caller overrides, and the driver's event
/// handlers wired back to the owning `ConnectionManager`.
pub struct MongoConnector;

#[async_trait]
impl Connector for MongoConnector {
    async fn connect(
        &self,
        config: &Config,
        events: WeakConnectionManager,
    ) -> Result<Handle, mongodb::error::Error> {
        let mut options = ClientOptions::parse(&config.uri).await?;
        let opts = &config.connection_options;
        options.max_pool_size = Some(opts.max_pool_size);
        options.min_pool_size = Some(opts.min_pool_size);
        options.max_idle_time = Some(opts.idle_timeout());
        options.server_selection_timeout = Some(opts.server_selection_timeout());
        options.connect_timeout = Some(opts.socket_timeout());
        let listener = Arc::new(DriverEventListener(events));
        options.cmap_event_handler = Some(listener.clone());
        options.sdam_event_handler = Some(listener);
        let database_name = options
            .default_database
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "logs".to_string());
        let client = Client::with_options(options)?;
        Ok(Arc::new(MongoHandle { client, database_name }))
    }
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Point-in-time snapshot returned by `ConnectionManager::metrics()`.
#[derive(Debug, Clone)]
pub struct ConnectionManagerMetrics {
    pub successes: u64,
    pub failures: u64,
    pub reconnects: u64,
    pub last_connection_time_ms: Option<i64>,
    pub last_disconnect_time_ms: Option<i64>,
    pub state: ConnectionState,
    pub breaker_state: BreakerState,
}

struct Shared {
    state: RwLock<ConnectionState>,
    handle: RwLock<Option<Handle>>,
    breaker: circuit::CircuitBreaker,
    metrics: ConnectionMetrics,
    ever_connected: AtomicBool,
    shut_down: AtomicBool,
}

/// Singleton database handle owner. Cheap to clone; clones share the same
/// underlying state (`Arc`).
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    connect_lock: Arc<AsyncMutex<()>>,
    config: Config,
}

impl ConnectionManager {
    pub fn new(config: Config) -> Self {
        Self::with_connector(config, Arc::new(MongoConnector))
    }

    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Self {
        let shared = Arc::new(Shared {
            state: RwLock::new(ConnectionState::Disconnected),
            handle: RwLock::new(None),
            breaker: circuit::CircuitBreaker::new(
                config.circuit_failure_threshold,
                config.circuit_open_duration(),
            ),
            metrics: ConnectionMetrics::default(),
            ever_connected: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        });
        Self {
            shared,
            connector,
            connect_lock: Arc::new(AsyncMutex::new(())),
            config,
        }
    }

    /// A weak handle usable by the driver's connection-event callbacks to
    /// report disconnects without keeping the manager alive or creating a
    /// reference cycle.
    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager(Arc::downgrade(&self.shared))
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.state.read() == ConnectionState::Connected
    }

    pub fn is_circuit_open(&self) -> bool {
        self.shared.breaker.state() == CircuitState::Open
    }

    /// Returns a ready-to-use handle, reconnecting or fast-failing behind
    /// the circuit breaker as needed.
    pub async fn acquire(&self) -> Result<Handle, LogShipperError> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(LogShipperError::Unavailable("connection manager is shut down".into()));
        }
        if let Some(handle) = self.fast_path() {
            return Ok(handle);
        }
        if self.shared.breaker.should_fail_fast() {
            return Err(LogShipperError::CircuitOpen);
        }
        let _guard = self.connect_lock.lock().await;
        // Re-check under the lock: another task may have completed the
        // connect (or the trial) while we were waiting for it.
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(LogShipperError::Unavailable("connection manager is shut down".into()));
        }
        if let Some(handle) = self.fast_path() {
            return Ok(handle);
        }
        if self.shared.breaker.should_fail_fast() {
            return Err(LogShipperError::CircuitOpen);
        }
        self.connect_once().await
    }

    fn fast_path(&self) -> Option<Handle> {
        if *self.shared.state.read() == ConnectionState::Connected {
            self.shared.handle.read().clone()
        } else {
            None
        }
    }

    async fn connect_once(&self) -> Result<Handle, LogShipperError> {
        let was_ever_connected = self.shared.ever_connected.load(Ordering::Acquire);
        *self.shared.state.write() =
            if was_ever_connected { ConnectionState::Reconnecting } else { ConnectionState::Connecting };

        match self.connector.connect(&self.config, self.downgrade()).await {
            Ok(handle) => {
                *self.shared.handle.write() = Some(handle.clone());
                *self.shared.state.write() = ConnectionState::Connected;
                self.shared.breaker.record_success();
                self.shared.metrics.connect_successes.inc();
                self.shared.metrics.last_connect_time_ms.set(now_unix_ms());
                if was_ever_connected {
                    self.shared.metrics.reconnects.inc();
                }
                self.shared.ever_connected.store(true, Ordering::Release);
                tracing::info!("Connected to {}", handle.database_name());
                Ok(handle)
            },
            Err(e) => {
                *self.shared.handle.write() = None;
                *self.shared.state.write() = ConnectionState::Disconnected;
                self.shared.breaker.record_failure();
                self.shared.metrics.connect_failures.inc();
                self.shared.metrics.last_disconnect_time_ms.set(now_unix_ms());
                tracing::error!("Failed to connect: {e}");
                Err(LogShipperError::Connect(e))
            },
        }
    }

    /// Issues a lightweight ping; returns `Down` if not connected or the
    /// ping fails.
    pub async fn health_probe(&self) -> HealthStatus {
        let Some(handle) = self.fast_path() else {
            return HealthStatus::Down { reason: "not connected".to_string() };
        };
        match handle.ping().await {
            Ok(()) => HealthStatus::Up,
            Err(e) => HealthStatus::Down { reason: e.to_string() },
        }
    }

    pub fn metrics(&self) -> ConnectionManagerMetrics {
        let ConnectionMetricsSnapshot {
            successes,
            failures,
            reconnects,
            last_connection_time_ms,
            last_disconnect_time_ms,
        } = self.shared.metrics.snapshot();
        ConnectionManagerMetrics {
            successes,
            failures,
            reconnects,
            last_connection_time_ms,
            last_disconnect_time_ms,
            state: *self.shared.state.read(),
            breaker_state: self.shared.breaker.state(),
        }
    }

    /// Closes the handle; subsequent `acquire` calls fail.
    pub fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::Release);
        *self.shared.handle.write() = None;
        *self.shared.state.write() = ConnectionState::Disconnected;
    }
}

/// Weak reference the driver's close/error/heartbeat-failure event
/// callbacks hold: marks the handle disconnected on
/// notify; the breaker and the next `acquire()` are what reopen it, this
/// never reconnects eagerly from the callback itself.
#[derive(Clone)]
pub struct WeakConnectionManager(Weak<Shared>);

impl WeakConnectionManager {
    pub fn notify_connection_lost(&self) {
        if let Some(shared) = self.0.upgrade() {
            if *shared.state.read() == ConnectionState::Connected {
                *shared.state.write() = ConnectionState::Disconnected;
                *shared.handle.write() = None;
                shared.metrics.last_disconnect_time_ms.set(now_unix_ms());
                tracing::warn!("Database connection closed; will reconnect on next acquire()");
            }
        }
    }
}
