//! Log Entry data model.
//!
//! The attribute bag is genuinely open-shaped, so rather than a fixed
//! struct with a catch-all map (which would force a merge step on every
//! read), entries are a thin wrapper over a `bson::Document` with
//! convenience accessors for the well-known fields.

use mongodb::bson::{
    doc,
    Document,
};

const BATCH_ID_KEY: &str = "_batchId";
const RETRY_COUNT_KEY: &str = "_retryCount";
const COLLECTION_KEY: &str = "collection";
const TIMESTAMP_KEY: &str = "timestamp";

/// A Log Entry as accepted at ingress.
#[derive(Debug, Clone, Default)]
pub struct LogEntry(pub Document);

impl LogEntry {
    pub fn new() -> Self {
        Self(Document::new())
    }

    pub fn from_document(doc: Document) -> Self {
        Self(doc)
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.0.insert(COLLECTION_KEY, collection.into());
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.0.insert("level", level.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.0.insert("message", message.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.0.insert("stack", stack.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Document) -> Self {
        self.0.insert("metadata", metadata);
        self
    }

    pub fn collection(&self) -> Option<&str> {
        self.0.get_str(COLLECTION_KEY).ok()
    }

    pub fn set_collection(&mut self, collection: impl Into<String>) {
        self.0.insert(COLLECTION_KEY, collection.into());
    }

    /// Ingress always (re)stamps the timestamp; an explicit `timestamp`
    /// supplied by the caller is overwritten.
    pub fn set_timestamp(&mut self, timestamp: mongodb::bson::DateTime) {
        self.0.insert(TIMESTAMP_KEY, timestamp);
    }

    pub fn into_document(self) -> Document {
        self.0
    }
}

/// Tags a Log Entry with the fields that make it a Batched Log Entry: a
/// unique `_batchId` and a `_retryCount` starting at 0.
pub fn stamp_for_batch(mut entry: Document) -> Document {
    entry.insert(BATCH_ID_KEY, uuid::Uuid::new_v4().to_string());
    entry.insert(RETRY_COUNT_KEY, 0i64);
    entry
}

/// Strips the batching-only fields before a document is written to the
/// database.
pub fn strip_batch_fields(entry: &Document) -> Document {
    let mut stripped = entry.clone();
    stripped.remove(BATCH_ID_KEY);
    stripped.remove(RETRY_COUNT_KEY);
    stripped
}

/// Cheap upper-bound byte estimate for a staged entry: its JSON-serialized
/// length, doubled.
pub fn estimate_size(entry: &Document) -> u64 {
    serde_json::to_vec(entry).map(|bytes| bytes.len() as u64 * 2).unwrap_or(0)
}

pub fn dead_letter_document(
    original: &Document,
    error_details: String,
    source_collection: &str,
) -> Document {
    doc! {
        "originalLog": original.clone(),
        "errorDetails": error_details,
        "failedAt": mongodb::bson::DateTime::now(),
        "sourceCollection": source_collection,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_adds_batch_id_and_zero_retry_count() {
        let entry = LogEntry::new().with_message("hi").into_document();
        let stamped = stamp_for_batch(entry);
        assert!(stamped.get_str(BATCH_ID_KEY).is_ok());
        assert_eq!(stamped.get_i64(RETRY_COUNT_KEY).unwrap(), 0);
    }

    #[test]
    fn strip_removes_only_batch_fields() {
        let entry = LogEntry::new().with_message("hi").into_document();
        let stamped = stamp_for_batch(entry);
        let stripped = strip_batch_fields(&stamped);
        assert!(stripped.get_str(BATCH_ID_KEY).is_err());
        assert!(stripped.get_i64(RETRY_COUNT_KEY).is_err());
        assert_eq!(stripped.get_str("message").unwrap(), "hi");
    }

    #[test]
    fn estimate_size_is_positive_for_nonempty_entry() {
        let entry = LogEntry::new().with_message("hello world").into_document();
        assert!(estimate_size(&entry) > 0);
    }
}
