//! Ingress Service.
//!
//! The application-facing surface. Performs no I/O of its own: pure
//! data-shaping that stamps a Log Entry and forwards it to the Batch
//! Manager.

use log_shipper_batch::{
    BatchManager,
    LogEntry,
};
use mongodb::bson::Document;

/// Producer-facing handle. Cheap to clone.
#[derive(Clone)]
pub struct IngressService {
    batch: BatchManager,
}

impl IngressService {
    pub fn new(batch: BatchManager) -> Self {
        Self { batch }
    }

    /// Stamps `timestamp = now`, sets `collection`, and submits to the
    /// Batch Manager. An explicit `timestamp` already present on `entry` is
    /// overwritten: ingress is the sole authority on when an entry was
    /// received.
    pub async fn log(&self, collection: impl Into<String>, mut entry: LogEntry) {
        entry.set_collection(collection);
        entry.set_timestamp(mongodb::bson::DateTime::now());
        self.batch.submit(entry).await;
    }

    /// Derives `{level: "error", message, stack}` from `err`. Any type
    /// convertible to `anyhow::Error` qualifies, covering both "proper"
    /// errors (message comes from `Display`, full cause chain and any
    /// captured backtrace become `stack`) and arbitrary values wrapped via
    /// `anyhow::anyhow!`: the debug render is always available because
    /// `anyhow::Error` always implements `Debug`.
    pub async fn log_error(
        &self,
        collection: impl Into<String>,
        err: impl Into<anyhow::Error>,
        metadata: Option<Document>,
    ) {
        let err = err.into();
        let message = err.to_string();
        let stack = format!("{err:?}");
        let mut entry = LogEntry::new().with_level("error").with_message(message).with_stack(stack);
        if let Some(metadata) = metadata {
            entry = entry.with_metadata(metadata);
        }
        self.log(collection, entry).await;
    }

    /// Delegates to the Batch Manager's `flush_all`.
    pub async fn flush(&self) {
        self.batch.flush_all().await;
    }

    /// Delegates to the Batch Manager's `shutdown`.
    pub async fn shutdown(&self, timeout: Option<std::time::Duration>) {
        self.batch.shutdown(timeout).await;
    }
}
