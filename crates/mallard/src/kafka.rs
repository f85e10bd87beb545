//! Kafka implementation of the log source.
//!
//! One [`KafkaLogSource`] per topic, wrapping an rdkafka `StreamConsumer`
//! subscribed from the beginning of the topic. Pass-through configuration
//! keys land in the rdkafka client config unchanged; processed offsets are
//! committed as `offset + 1` per Kafka convention.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Headers as _, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::source::{Headers, LogSource, SourceFactory, SourceRecord, TimestampKind};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// A Kafka consumer for one topic.
pub struct KafkaLogSource {
    consumer: StreamConsumer,
    topic: String,
    /// Last processed offset per partition; committed as offset + 1.
    processed: HashMap<i32, i64>,
}

impl KafkaLogSource {
    /// Opens a consumer for the topic, reading from the beginning.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Source`] when the consumer cannot be created
    /// or the subscription fails.
    pub fn open(topic: &str, config: &EngineConfig) -> Result<Self, EngineError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("group.id", config.group_id())
            .set("client.id", format!("{}-{topic}", config.group_id()))
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");
        for (key, value) in config.passthrough() {
            client_config.set(key, value);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| EngineError::Source(format!("failed to create consumer: {e}")))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| EngineError::Source(format!("failed to subscribe: {e}")))?;

        debug!(topic, group = config.group_id(), "opened kafka source");
        Ok(Self {
            consumer,
            topic: topic.to_string(),
            processed: HashMap::new(),
        })
    }
}

#[async_trait]
impl LogSource for KafkaLogSource {
    async fn next(&mut self) -> Result<Option<SourceRecord>, EngineError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| EngineError::Source(format!("consumer error: {e}")))?;

        let mut headers = Headers::new();
        if let Some(borrowed) = message.headers() {
            for header in borrowed.iter() {
                headers.append(header.key, header.value.unwrap_or_default().to_vec());
            }
        }

        let (timestamp, timestamp_kind) = match message.timestamp() {
            rdkafka::Timestamp::NotAvailable => (None, TimestampKind::NotAvailable),
            rdkafka::Timestamp::CreateTime(ms) => (Some(ms), TimestampKind::CreateTime),
            rdkafka::Timestamp::LogAppendTime(ms) => (Some(ms), TimestampKind::LogAppendTime),
        };

        Ok(Some(SourceRecord {
            headers,
            key: message.key().map(<[u8]>::to_vec),
            value: message.payload().map(<[u8]>::to_vec),
            partition: message.partition(),
            offset: message.offset(),
            timestamp,
            timestamp_kind,
            leader_epoch: None,
        }))
    }

    fn mark_processed(&mut self, partition: i32, offset: i64) {
        self.processed.insert(partition, offset);
    }

    async fn commit(&mut self) -> Result<(), EngineError> {
        if self.processed.is_empty() {
            return Ok(());
        }
        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in &self.processed {
            tpl.add_partition_offset(&self.topic, *partition, Offset::Offset(offset + 1))
                .map_err(|e| EngineError::Source(format!("bad offset list: {e}")))?;
        }
        self.consumer
            .commit(&tpl, rdkafka::consumer::CommitMode::Async)
            .map_err(|e| EngineError::Source(format!("offset commit failed: {e}")))?;
        debug!(topic = %self.topic, partitions = self.processed.len(), "committed offsets");
        Ok(())
    }

    async fn high_water_marks(&mut self) -> Result<HashMap<i32, i64>, EngineError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(&self.topic), METADATA_TIMEOUT)
            .map_err(|e| EngineError::Source(format!("metadata fetch failed: {e}")))?;
        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.topic)
            .map(|t| t.partitions().iter().map(rdkafka::metadata::MetadataPartition::id).collect())
            .unwrap_or_default();

        let mut marks = HashMap::with_capacity(partitions.len());
        for partition in partitions {
            let (_, high) = self
                .consumer
                .fetch_watermarks(&self.topic, partition, METADATA_TIMEOUT)
                .map_err(|e| {
                    EngineError::Source(format!("watermark fetch failed: {e}"))
                })?;
            marks.insert(partition, high);
        }
        Ok(marks)
    }
}

impl Drop for KafkaLogSource {
    fn drop(&mut self) {
        self.consumer.unsubscribe();
    }
}

impl std::fmt::Debug for KafkaLogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaLogSource")
            .field("topic", &self.topic)
            .field("partitions", &self.processed.len())
            .finish_non_exhaustive()
    }
}

/// Opens a [`KafkaLogSource`] per topic.
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaSourceFactory;

impl SourceFactory for KafkaSourceFactory {
    fn create(
        &self,
        topic: &str,
        config: &EngineConfig,
    ) -> Result<Box<dyn LogSource>, EngineError> {
        Ok(Box::new(KafkaLogSource::open(topic, config)?))
    }
}
