//! In-memory log, the reference implementation of the client interfaces.
//!
//! Backs the integration test suite and is handy for unit-testing message
//! processors without a broker. Records live in per-(topic, partition)
//! vectors, group offsets in a map, and each producer runs as a dispatcher
//! task fanning out to one worker task per output partition so that a stalled
//! partition never head-blocks the others.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tracing::debug;

use crate::client::{
    LogClient, OffsetManager, PartitionConsumer, Producer, ProducerConfig, ProducerError,
    StartFrom,
};
use crate::error::{Error, Result};
use crate::message::{ConsumerRecord, ProducerMessage};

/// Channel capacities and failure controls.
#[derive(Debug, Clone)]
pub struct MemLogOptions {
    pub input_buffer: usize,
    pub success_buffer: usize,
    pub error_buffer: usize,
    /// Artificial delay before each success acknowledgement.
    pub ack_delay: Option<Duration>,
}

impl Default for MemLogOptions {
    fn default() -> Self {
        MemLogOptions {
            input_buffer: 256,
            success_buffer: 256,
            error_buffer: 64,
            ack_delay: None,
        }
    }
}

/// A record stored in a partition.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub key: Bytes,
    pub value: Bytes,
    pub timestamp: DateTime<Utc>,
}

struct PartitionLog {
    records: Vec<StoredRecord>,
    appended: Arc<Notify>,
}

impl Default for PartitionLog {
    fn default() -> Self {
        PartitionLog {
            records: Vec::new(),
            appended: Arc::new(Notify::new()),
        }
    }
}

struct MemLogState {
    partitions: Mutex<HashMap<(String, i32), PartitionLog>>,
    /// (group, topic, partition) -> next offset to consume.
    offsets: Mutex<HashMap<(String, String, i32), i64>>,
    /// true = acks withheld for that (topic, partition).
    ack_gates: Mutex<HashMap<(String, i32), watch::Sender<bool>>>,
    failing_topics: Mutex<HashSet<String>>,
    options: MemLogOptions,
}

impl MemLogState {
    fn append_record(&self, topic: &str, partition: i32, key: Bytes, value: Bytes) -> i64 {
        let mut partitions = self.partitions.lock();
        let log = partitions
            .entry((topic.to_string(), partition))
            .or_default();
        let offset = log.records.len() as i64;
        log.records.push(StoredRecord {
            key,
            value,
            timestamp: Utc::now(),
        });
        log.appended.notify_waiters();
        offset
    }

    fn append_notify(&self, topic: &str, partition: i32) -> Arc<Notify> {
        let mut partitions = self.partitions.lock();
        Arc::clone(
            &partitions
                .entry((topic.to_string(), partition))
                .or_default()
                .appended,
        )
    }

    fn subscribe_gate(&self, topic: &str, partition: i32) -> watch::Receiver<bool> {
        let mut gates = self.ack_gates.lock();
        gates
            .entry((topic.to_string(), partition))
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }
}

/// An in-memory log. Cloning yields another handle to the same storage.
#[derive(Clone)]
pub struct MemLog {
    state: Arc<MemLogState>,
}

impl MemLog {
    pub fn new() -> Self {
        Self::with_options(MemLogOptions::default())
    }

    pub fn with_options(options: MemLogOptions) -> Self {
        MemLog {
            state: Arc::new(MemLogState {
                partitions: Mutex::new(HashMap::new()),
                offsets: Mutex::new(HashMap::new()),
                ack_gates: Mutex::new(HashMap::new()),
                failing_topics: Mutex::new(HashSet::new()),
                options,
            }),
        }
    }

    /// Appends a record directly, bypassing any producer. Returns its offset.
    pub fn append(
        &self,
        topic: &str,
        partition: i32,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> i64 {
        self.state
            .append_record(topic, partition, key.into(), value.into())
    }

    /// Snapshot of the records stored for one partition.
    pub fn records(&self, topic: &str, partition: i32) -> Vec<StoredRecord> {
        let partitions = self.state.partitions.lock();
        partitions
            .get(&(topic.to_string(), partition))
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Next offset a consumer group would resume from, if one was marked.
    pub fn committed(&self, consumer_group: &str, topic: &str, partition: i32) -> Option<i64> {
        let offsets = self.state.offsets.lock();
        offsets
            .get(&(consumer_group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Withholds success acknowledgements for one (topic, partition). The
    /// records are still written.
    pub fn pause_acks(&self, topic: &str, partition: i32) {
        let mut gates = self.state.ack_gates.lock();
        gates
            .entry((topic.to_string(), partition))
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(true);
    }

    /// Releases acknowledgements withheld by [pause_acks](Self::pause_acks).
    pub fn resume_acks(&self, topic: &str, partition: i32) {
        let gates = self.state.ack_gates.lock();
        if let Some(gate) = gates.get(&(topic.to_string(), partition)) {
            gate.send_replace(false);
        }
    }

    /// Every produce to `topic` fails until [heal_topic](Self::heal_topic).
    pub fn fail_topic(&self, topic: &str) {
        self.state.failing_topics.lock().insert(topic.to_string());
    }

    pub fn heal_topic(&self, topic: &str) {
        self.state.failing_topics.lock().remove(topic);
    }
}

impl Default for MemLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogClient for MemLog {
    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        start: StartFrom,
    ) -> Result<PartitionConsumer> {
        let next = match start {
            StartFrom::Offset(offset) => offset,
            StartFrom::Oldest => 0,
            StartFrom::Newest => {
                let partitions = self.state.partitions.lock();
                partitions
                    .get(&(topic.to_string(), partition))
                    .map(|log| log.records.len() as i64)
                    .unwrap_or(0)
            }
        };
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(consume_task(
            Arc::clone(&self.state),
            topic.to_string(),
            partition,
            next,
            tx,
        ));
        Ok(PartitionConsumer {
            topic: topic.to_string(),
            partition,
            messages: rx,
        })
    }

    async fn producer(&self, config: ProducerConfig) -> Result<Producer> {
        let options = &self.state.options;
        let (input_tx, input_rx) = mpsc::channel(options.input_buffer);
        let (success_tx, success_rx) = mpsc::channel(options.success_buffer);
        let (error_tx, error_rx) = mpsc::channel(options.error_buffer);
        debug!(client_id = %config.client_id, "starting in-memory producer");
        tokio::spawn(producer_dispatch(
            Arc::clone(&self.state),
            input_rx,
            success_tx,
            error_tx,
        ));
        Ok(Producer {
            input: input_tx,
            successes: success_rx,
            errors: error_rx,
        })
    }

    async fn offset_manager(&self, consumer_group: &str) -> Result<Arc<dyn OffsetManager>> {
        Ok(Arc::new(MemOffsetManager {
            state: Arc::clone(&self.state),
            consumer_group: consumer_group.to_string(),
        }))
    }

    async fn close(&self) -> Result<()> {
        // Storage is shared by every handle and outlives any one client;
        // consumers and producers wind down when their channels close.
        Ok(())
    }
}

struct MemOffsetManager {
    state: Arc<MemLogState>,
    consumer_group: String,
}

#[async_trait]
impl OffsetManager for MemOffsetManager {
    async fn mark_offset(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        let mut offsets = self.state.offsets.lock();
        offsets.insert(
            (self.consumer_group.clone(), topic.to_string(), partition),
            next_offset,
        );
        Ok(())
    }

    async fn next_offset(&self, topic: &str, partition: i32) -> Result<Option<i64>> {
        let offsets = self.state.offsets.lock();
        Ok(offsets
            .get(&(self.consumer_group.clone(), topic.to_string(), partition))
            .copied())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

async fn consume_task(
    state: Arc<MemLogState>,
    topic: String,
    partition: i32,
    mut next: i64,
    tx: mpsc::Sender<ConsumerRecord>,
) {
    let notify = state.append_notify(&topic, partition);
    loop {
        // Register for wakeups before scanning so an append between the scan
        // and the await still wakes us.
        let notified = notify.notified();
        let batch: Vec<ConsumerRecord> = {
            let partitions = state.partitions.lock();
            match partitions.get(&(topic.clone(), partition)) {
                Some(log) if (log.records.len() as i64) > next => log.records
                    [next as usize..]
                    .iter()
                    .enumerate()
                    .map(|(i, record)| ConsumerRecord {
                        topic: topic.clone(),
                        partition,
                        offset: next + i as i64,
                        key: record.key.clone(),
                        value: record.value.clone(),
                        timestamp: record.timestamp,
                    })
                    .collect(),
                _ => Vec::new(),
            }
        };
        if batch.is_empty() {
            tokio::select! {
                _ = tx.closed() => return,
                _ = notified => {}
            }
            continue;
        }
        for record in batch {
            let offset = record.offset;
            if tx.send(record).await.is_err() {
                return;
            }
            next = offset + 1;
        }
    }
}

async fn producer_dispatch(
    state: Arc<MemLogState>,
    mut input: mpsc::Receiver<ProducerMessage>,
    successes: mpsc::Sender<ProducerMessage>,
    errors: mpsc::Sender<ProducerError>,
) {
    let mut workers: HashMap<(String, i32), mpsc::UnboundedSender<ProducerMessage>> =
        HashMap::new();
    while let Some(message) = input.recv().await {
        let key = (message.topic.clone(), message.partition);
        let worker = workers.entry(key).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(partition_worker(
                Arc::clone(&state),
                message.topic.clone(),
                message.partition,
                rx,
                successes.clone(),
                errors.clone(),
            ));
            tx
        });
        // A worker only exits once its queue closes, so this cannot fail
        // while the dispatcher holds the sender.
        let _ = worker.send(message);
    }
    // Input closed: dropping the worker senders lets each worker drain its
    // queue and finish, which in turn closes the success and error streams.
}

async fn partition_worker(
    state: Arc<MemLogState>,
    topic: String,
    partition: i32,
    mut queue: mpsc::UnboundedReceiver<ProducerMessage>,
    successes: mpsc::Sender<ProducerMessage>,
    errors: mpsc::Sender<ProducerError>,
) {
    while let Some(message) = queue.recv().await {
        if state.failing_topics.lock().contains(&topic) {
            let failure = ProducerError {
                error: Error::Producer(format!("injected failure for topic '{topic}'")),
                message,
            };
            if errors.send(failure).await.is_err() {
                return;
            }
            continue;
        }
        state.append_record(&topic, partition, message.key.clone(), message.value.clone());
        if let Some(delay) = state.options.ack_delay {
            tokio::time::sleep(delay).await;
        }
        let mut gate = state.subscribe_gate(&topic, partition);
        while *gate.borrow() {
            if gate.changed().await.is_err() {
                break;
            }
        }
        if successes.send(message).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consumer_tails_appends() {
        let log = MemLog::new();
        log.append("events", 0, "k0", "v0");
        let mut consumer = log
            .consume_partition("events", 0, StartFrom::Oldest)
            .await
            .unwrap();
        let first = consumer.messages.recv().await.unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(&first.value[..], b"v0");

        log.append("events", 0, "k1", "v1");
        let second = consumer.messages.recv().await.unwrap();
        assert_eq!(second.offset, 1);
        assert_eq!(&second.value[..], b"v1");
    }

    #[tokio::test]
    async fn consumer_starts_from_offset() {
        let log = MemLog::new();
        for i in 0..5 {
            log.append("events", 0, "", format!("v{i}"));
        }
        let mut consumer = log
            .consume_partition("events", 0, StartFrom::Offset(3))
            .await
            .unwrap();
        assert_eq!(consumer.messages.recv().await.unwrap().offset, 3);
        assert_eq!(consumer.messages.recv().await.unwrap().offset, 4);
    }

    #[tokio::test]
    async fn producer_acks_written_messages() {
        let log = MemLog::new();
        let mut producer = log
            .producer(ProducerConfig {
                client_id: "test".to_string(),
                required_acks: crate::config::RequiredAcks::WaitForAll,
            })
            .await
            .unwrap();

        let origin = Arc::new(crate::message::IncomingMessage {
            topic: "events".to_string(),
            partition: 0,
            offset: 0,
            key: Box::new(()),
            value: Box::new(()),
            timestamp: Utc::now(),
        });
        producer
            .input
            .send(ProducerMessage {
                topic: "out".to_string(),
                partition: 0,
                key: Bytes::new(),
                value: Bytes::from_static(b"v"),
                origin,
                retries: 0,
            })
            .await
            .unwrap();

        let ack = producer.successes.recv().await.unwrap();
        assert_eq!(ack.topic, "out");
        assert_eq!(log.records("out", 0).len(), 1);

        // Dropping the input closes both streams.
        drop(producer.input);
        assert!(producer.successes.recv().await.is_none());
        assert!(producer.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn offsets_round_trip() {
        let log = MemLog::new();
        let manager = log.offset_manager("group").await.unwrap();
        assert_eq!(manager.next_offset("events", 0).await.unwrap(), None);
        manager.mark_offset("events", 0, 10).await.unwrap();
        manager.flush().await.unwrap();
        assert_eq!(manager.next_offset("events", 0).await.unwrap(), Some(10));
        assert_eq!(log.committed("group", "events", 0), Some(10));
    }
}
