//! Message types that flow through a topic processor. A [ConsumerRecord] is
//! what a partition consumer delivers; it is deserialized into an
//! [IncomingMessage] at partition ingest and handed to user code. Outputs are
//! emitted as [OutgoingMessage]s and submitted to the producer as
//! [ProducerMessage]s, each holding a reference-counted handle back to the
//! message that was being processed when it was emitted. That handle is how
//! producer acknowledgements find their way back to the right in-flight group,
//! and it is released once the group has no outstanding acks.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Opaque deserialized key or value. User code downcasts to the concrete type
/// its serdes produce.
pub type Value = Box<dyn Any + Send + Sync>;

/// Raw record read from an input topic, before deserialization.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Bytes,
    pub value: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// A deserialized record from an input topic, as seen by user code.
pub struct IncomingMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Value,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// An output record emitted by user code via
/// [Sender](crate::processor::Sender). Key and value are already serialized.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    pub partition: i32,
    pub key: Bytes,
    pub value: Bytes,
}

impl OutgoingMessage {
    pub fn new(topic: impl Into<String>, partition: i32, key: Bytes, value: Bytes) -> Self {
        OutgoingMessage {
            topic: topic.into(),
            partition,
            key,
            value,
        }
    }
}

/// An [OutgoingMessage] on its way to the log, tagged with the message whose
/// processing produced it. The producer success stream returns the same
/// message once the write is acknowledged.
#[derive(Debug, Clone)]
pub struct ProducerMessage {
    pub topic: String,
    pub partition: i32,
    pub key: Bytes,
    pub value: Bytes,
    /// Message being processed when this output was emitted. Acks are routed
    /// to its partition's in-flight state through this handle.
    pub origin: Arc<IncomingMessage>,
    /// Times this message has been resubmitted after a produce failure.
    pub retries: u32,
}
