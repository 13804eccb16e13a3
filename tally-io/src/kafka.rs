//! Kafka source and sink (feature `kafka`).
//!
//! The source maps each topic partition onto a tally partition and assigns it
//! manually at the checkpointed offset; consumer-group commits are not used.

use anyhow::Context as _;
use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, TopicPartitionList};
use tally_core::{Error, EventSource, Offset, PartitionId, PartitionReader, RawRecord, Result, SinkAdapter, WindowResult};
use tracing::debug;

pub struct KafkaSource {
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
    pub partitions: u32,
}

impl KafkaSource {
    pub fn new(
        brokers: impl Into<String>,
        group_id: impl Into<String>,
        topic: impl Into<String>,
        partitions: u32,
    ) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            topic: topic.into(),
            partitions,
        }
    }

    fn consumer(&self) -> anyhow::Result<StreamConsumer> {
        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "10000");
        cfg.create().context("failed to create kafka consumer")
    }
}

struct KafkaReader {
    partition: PartitionId,
    consumer: StreamConsumer,
}

#[async_trait]
impl PartitionReader for KafkaReader {
    async fn next(&mut self) -> Result<Option<RawRecord>> {
        let m = self
            .consumer
            .recv()
            .await
            .map_err(|e| Error::SourceUnavailable(format!("kafka partition {}: {e}", self.partition)))?;
        let payload = m.payload().map(|p| p.to_vec()).unwrap_or_default();
        Ok(Some(RawRecord::new(self.partition, m.offset().max(0) as Offset, payload)))
    }
}

#[async_trait]
impl EventSource for KafkaSource {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn open(&self, partition: PartitionId, start_offset: Offset) -> Result<Box<dyn PartitionReader>> {
        let consumer = self
            .consumer()
            .map_err(|e| Error::SourceUnavailable(e.to_string()))?;
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, partition as i32, rdkafka::Offset::Offset(start_offset as i64))
            .map_err(|e| Error::SourceUnavailable(e.to_string()))?;
        consumer
            .assign(&tpl)
            .map_err(|e| Error::SourceUnavailable(format!("assign {}/{partition}: {e}", self.topic)))?;
        debug!(topic = %self.topic, partition, start_offset, "assigned kafka partition");
        Ok(Box::new(KafkaReader { partition, consumer }))
    }
}

/// Publishes window results as JSON, keyed by the grouping key.
pub struct KafkaSink {
    pub brokers: String,
    pub topic: String,
    pub acks: Option<String>,
    producer: Option<FutureProducer>,
}

impl KafkaSink {
    pub fn new(brokers: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            topic: topic.into(),
            acks: Some("all".into()),
            producer: None,
        }
    }

    fn ensure_producer(&mut self) -> anyhow::Result<&FutureProducer> {
        if self.producer.is_none() {
            let mut cfg = ClientConfig::new();
            cfg.set("bootstrap.servers", &self.brokers);
            if let Some(a) = &self.acks {
                cfg.set("acks", a);
            }
            self.producer = Some(cfg.create().context("failed to create kafka producer")?);
        }
        self.producer.as_ref().context("kafka producer not initialised")
    }
}

#[async_trait]
impl SinkAdapter for KafkaSink {
    async fn emit(&mut self, result: WindowResult) -> Result<()> {
        let payload = serde_json::to_string(&result)?;
        let topic = self.topic.clone();
        let producer = self
            .ensure_producer()
            .map_err(|e| Error::SinkUnavailable(e.to_string()))?;
        let record = FutureRecord::to(&topic).payload(&payload).key(&result.key);
        producer
            .send(record, std::time::Duration::from_secs(5))
            .await
            .map_err(|(e, _)| Error::SinkUnavailable(e.to_string()))?;
        tally_core::metrics::BYTES_WRITTEN
            .with_label_values(&["kafka"])
            .inc_by(payload.len() as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_reports_configured_partitions() {
        let src = KafkaSource::new("b:9092", "g1", "t1", 3);
        assert_eq!(src.partitions(), 3);
    }

    #[tokio::test]
    async fn producer_is_created_lazily() {
        let mut sink = KafkaSink::new("localhost:9092", "results");
        assert!(sink.producer.is_none());
        assert!(sink.ensure_producer().is_ok());
        assert!(sink.producer.is_some());
    }
}
