//! Testing utilities: an in-memory log broker and payload helpers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::decode::MAGIC_BYTE;
use crate::error::EngineError;
use crate::source::{LogSource, SourceFactory, SourceRecord, TimestampKind};

/// Frames a body as a schema-bearing wire payload.
#[must_use]
pub fn frame_payload(schema_id: i32, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(5 + body.len());
    payload.push(MAGIC_BYTE);
    payload.extend_from_slice(&schema_id.to_be_bytes());
    payload.extend_from_slice(body);
    payload
}

#[derive(Default)]
struct TopicState {
    sender: Option<mpsc::UnboundedSender<SourceRecord>>,
    receiver: Option<mpsc::UnboundedReceiver<SourceRecord>>,
    /// Next offset per partition; doubles as the high-water mark.
    next_offsets: Arc<Mutex<HashMap<i32, i64>>>,
    committed: Arc<Mutex<HashMap<i32, i64>>>,
}

impl TopicState {
    fn ensure_channel(&mut self) {
        if self.sender.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            self.sender = Some(tx);
            self.receiver = Some(rx);
        }
    }
}

/// An in-memory multi-topic log for tests.
///
/// Records produced before or after a source is opened are delivered in
/// order; high-water marks reflect everything produced so far.
#[derive(Default)]
pub struct MockLogBroker {
    topics: Mutex<HashMap<String, TopicState>>,
}

impl MockLogBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Produces a record, returning its assigned offset.
    ///
    /// # Panics
    ///
    /// Panics if the topic's source has been dropped.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
    ) -> i64 {
        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();
        state.ensure_channel();

        let offset = {
            let mut next = state.next_offsets.lock();
            let slot = next.entry(partition).or_insert(0);
            let offset = *slot;
            *slot += 1;
            offset
        };

        let record = SourceRecord {
            key,
            value,
            partition,
            offset,
            timestamp: Some(0),
            timestamp_kind: TimestampKind::CreateTime,
            ..SourceRecord::default()
        };
        state
            .sender
            .as_ref()
            .expect("channel just ensured")
            .send(record)
            .expect("mock source dropped");
        offset
    }

    /// Returns the committed offset for a topic partition, if any.
    #[must_use]
    pub fn committed_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        let topics = self.topics.lock();
        topics
            .get(topic)
            .and_then(|state| state.committed.lock().get(&partition).copied())
    }
}

impl SourceFactory for MockLogBroker {
    fn create(
        &self,
        topic: &str,
        _config: &EngineConfig,
    ) -> Result<Box<dyn LogSource>, EngineError> {
        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();
        state.ensure_channel();
        let receiver = state.receiver.take().ok_or_else(|| {
            EngineError::Source(format!("topic '{topic}' already has a consumer"))
        })?;
        Ok(Box::new(MockLogSource {
            receiver,
            next_offsets: state.next_offsets.clone(),
            committed: state.committed.clone(),
            processed: HashMap::new(),
        }))
    }
}

/// The consuming side of one mock topic.
pub struct MockLogSource {
    receiver: mpsc::UnboundedReceiver<SourceRecord>,
    next_offsets: Arc<Mutex<HashMap<i32, i64>>>,
    committed: Arc<Mutex<HashMap<i32, i64>>>,
    processed: HashMap<i32, i64>,
}

#[async_trait::async_trait]
impl LogSource for MockLogSource {
    async fn next(&mut self) -> Result<Option<SourceRecord>, EngineError> {
        Ok(self.receiver.recv().await)
    }

    fn mark_processed(&mut self, partition: i32, offset: i64) {
        self.processed.insert(partition, offset);
    }

    async fn commit(&mut self) -> Result<(), EngineError> {
        let mut committed = self.committed.lock();
        for (partition, offset) in &self.processed {
            committed.insert(*partition, offset + 1);
        }
        Ok(())
    }

    async fn high_water_marks(&mut self) -> Result<HashMap<i32, i64>, EngineError> {
        Ok(self.next_offsets.lock().clone())
    }
}
