//! Shared error taxonomy for the log shipper.
//!
//! A small set of classifiable error kinds threaded through `thiserror`,
//! tuned to the handful of ways this crate's callers need to react: fail
//! startup, trip the breaker, retry a flush, or dead-letter a record.

use std::fmt;

use mongodb::bson::Document;
use thiserror::Error;

/// Errors surfaced across crate boundaries.
#[derive(Debug, Error)]
pub enum LogShipperError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("database connect failed: {0}")]
    Connect(#[source] mongodb::error::Error),

    #[error("circuit breaker is open, acquire failed fast")]
    CircuitOpen,

    #[error("database handle unavailable: {0}")]
    Unavailable(String),
}

/// One record's worth of write failure, as reported by a bulk insert.
#[derive(Debug, Clone)]
pub struct FailedWrite {
    pub index: usize,
    pub code: i32,
    pub message: String,
}

/// A flush's outcome once the driver has returned, classified the way the
/// Batch Manager needs in order to decide retry-vs-DLQ.
#[derive(Debug)]
pub enum FlushFailure {
    /// The driver rejected specific documents by index; the rest were
    /// persisted. Failed indices become dead-letter records.
    Partial(Vec<FailedWrite>),
    /// Nothing in the batch could be confirmed persisted (connection loss,
    /// timeout, transient transaction error, ...). The whole batch is
    /// retried.
    Transient(mongodb::error::Error),
}

impl fmt::Display for FlushFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushFailure::Partial(failed) => {
                write!(f, "partial bulk write failure, {} record(s) rejected", failed.len())
            },
            FlushFailure::Transient(e) => write!(f, "transient flush failure: {e}"),
        }
    }
}

/// Classifies an `insert_many` error into a partial per-record failure or a
/// whole-batch transient failure, based on whether the driver reports a
/// `BulkWriteError` exposing `write_errors: [{index, ...}]`.
pub fn classify_insert_many_error(err: mongodb::error::Error) -> FlushFailure {
    if let Some(failure) = err.kind.as_write_failure() {
        if !failure.is_empty() {
            return FlushFailure::Partial(failure);
        }
    }
    FlushFailure::Transient(err)
}

/// Adapter trait kept narrow on purpose: the concrete `ErrorKind` enum in
/// the `mongodb` crate isn't guaranteed stable across driver minor
/// versions, so the one pattern-match that depends on its shape lives here.
trait AsWriteFailure {
    fn as_write_failure(&self) -> Option<Vec<FailedWrite>>;
}

impl AsWriteFailure for mongodb::error::ErrorKind {
    fn as_write_failure(&self) -> Option<Vec<FailedWrite>> {
        use mongodb::error::ErrorKind;
        match self {
            ErrorKind::BulkWrite(failure) => Some(
                failure
                    .write_errors
                    .iter()
                    .flatten()
                    .map(|e| FailedWrite {
                        index: e.index,
                        code: e.code,
                        message: e.message.clone(),
                    })
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// Shape of a dead-letter record written to a collection's DLQ.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeadLetterRecord {
    pub original_log: Document,
    pub error_details: String,
    pub failed_at: mongodb::bson::DateTime,
    pub source_collection: String,
}
