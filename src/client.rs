//! Capability interfaces of the log client.
//!
//! The runtime does not talk to any concrete log implementation; it consumes
//! partition streams, an async producer, and an offset manager through the
//! interfaces below. [MemLog](crate::mem::MemLog) is the bundled reference
//! implementation; bindings to a real log provide the same handles over their
//! own transport.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::RequiredAcks;
use crate::error::{Error, Result};
use crate::message::{ConsumerRecord, ProducerMessage};

/// Starting position when consuming a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    Offset(i64),
    Oldest,
    Newest,
}

/// Stream of records for one (topic, partition), delivered in offset order.
pub struct PartitionConsumer {
    pub topic: String,
    pub partition: i32,
    pub messages: mpsc::Receiver<ConsumerRecord>,
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub client_id: String,
    pub required_acks: RequiredAcks,
}

/// Per-message send failure delivered on the producer error stream.
#[derive(Debug)]
pub struct ProducerError {
    pub message: ProducerMessage,
    pub error: Error,
}

/// Handles to an async producer with success acknowledgements enabled and
/// manual partitioning: messages go to exactly the partition they name.
///
/// Dropping `input` closes the producer. The backend then finishes every
/// outstanding send and closes `successes` and `errors`. Each successfully
/// written message is delivered on `successes` exactly once; consumers must
/// keep draining it, or the producer stalls once its buffer fills.
pub struct Producer {
    pub input: mpsc::Sender<ProducerMessage>,
    pub successes: mpsc::Receiver<ProducerMessage>,
    pub errors: mpsc::Receiver<ProducerError>,
}

/// Connection to the log.
#[async_trait]
pub trait LogClient: Send + Sync + 'static {
    /// Opens a consumer for one partition of one topic.
    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        start: StartFrom,
    ) -> Result<PartitionConsumer>;

    /// Creates an async producer.
    async fn producer(&self, config: ProducerConfig) -> Result<Producer>;

    /// Opens the offset store of a consumer group.
    async fn offset_manager(&self, consumer_group: &str) -> Result<Arc<dyn OffsetManager>>;

    /// Releases the connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Consumer-group offset storage.
#[async_trait]
pub trait OffsetManager: Send + Sync {
    /// Records `next_offset` as the next offset to consume for the
    /// partition. Marks are monotonic per partition in normal operation but
    /// the store does not enforce it.
    async fn mark_offset(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()>;

    /// Next offset to consume according to the stored group state, if any.
    async fn next_offset(&self, topic: &str, partition: i32) -> Result<Option<i64>>;

    /// Persists marks that are not yet durable.
    async fn flush(&self) -> Result<()>;
}
