//! The log source abstraction.
//!
//! A [`LogSource`] yields one topic's records in partition-offset order
//! with replay-from-beginning and commit semantics. The production
//! implementation consumes Kafka ([`crate::kafka::KafkaLogSource`]); the
//! `testing` module provides an in-memory source.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::error::EngineError;

/// The provenance of a record timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampKind {
    /// The source did not provide a timestamp.
    #[default]
    NotAvailable,
    /// The producer set the timestamp.
    CreateTime,
    /// The log appended the timestamp.
    LogAppendTime,
}

/// Record headers: multi-valued, insertion-ordered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, Vec<Vec<u8>>)>);

impl Headers {
    /// Creates an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header value, merging repeated keys in order.
    pub fn append(&mut self, key: &str, value: Vec<u8>) {
        if let Some((_, values)) = self.0.iter_mut().find(|(k, _)| k == key) {
            values.push(value);
        } else {
            self.0.push((key.to_string(), vec![value]));
        }
    }

    /// Returns all values recorded for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[Vec<u8>]> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, values)| values.as_slice())
    }

    /// Returns the number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when no headers are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One record pulled from the log.
#[derive(Debug, Clone, Default)]
pub struct SourceRecord {
    /// Record headers.
    pub headers: Headers,
    /// The key bytes; `None` or empty for keyless records.
    pub key: Option<Vec<u8>>,
    /// The value bytes; `None` marks a delete tombstone.
    pub value: Option<Vec<u8>>,
    /// The partition the record came from.
    pub partition: i32,
    /// The record's offset within its partition.
    pub offset: i64,
    /// The record timestamp, milliseconds since the Unix epoch.
    pub timestamp: Option<i64>,
    /// The timestamp's provenance.
    pub timestamp_kind: TimestampKind,
    /// The leader epoch, when the source provides one.
    pub leader_epoch: Option<i32>,
}

/// A pull source over one topic's records.
#[async_trait]
pub trait LogSource: Send {
    /// Awaits the next record. `None` means the source is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Source`] for transient consumer errors; the
    /// caller decides whether to retry.
    async fn next(&mut self) -> Result<Option<SourceRecord>, EngineError>;

    /// Marks a record as processed, to be committed later.
    fn mark_processed(&mut self, partition: i32, offset: i64);

    /// Commits all marked offsets back to the log.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Source`] when the commit fails.
    async fn commit(&mut self) -> Result<(), EngineError>;

    /// Snapshots the source's high-water mark per partition (the next
    /// offset to be produced).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Source`] when the marks cannot be fetched.
    async fn high_water_marks(&mut self) -> Result<HashMap<i32, i64>, EngineError>;
}

/// Creates one [`LogSource`] per topic at engine init.
pub trait SourceFactory: Send + Sync {
    /// Opens a source for the topic.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Source`] when the source cannot be opened.
    fn create(&self, topic: &str, config: &EngineConfig)
        -> Result<Box<dyn LogSource>, EngineError>;
}
