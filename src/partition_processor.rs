//! Per-partition processing state.
//!
//! A partition processor owns everything the runtime knows about one assigned
//! partition: the user's [MessageProcessor], the serdes of its input topics,
//! and, per topic, the queue of in-flight message groups. A group is the set
//! of outputs produced while processing one input message plus the count of
//! producer acks still outstanding. Groups complete in any order, but the
//! commit watermark only advances over a fully acknowledged prefix, so an
//! offset is never marked while an earlier offset still has outstanding acks.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::client::{OffsetManager, PartitionConsumer};
use crate::error::Result;
use crate::message::{ConsumerRecord, IncomingMessage, ProducerMessage};
use crate::metrics::{topic_partition_labels, ProcessorMetrics};
use crate::processor::{Coordinator, MessageProcessor, Sender};
use crate::serdes::TopicSerde;

struct InFlightGroup {
    offset: i64,
    outstanding: usize,
    /// Whether this group is counted in the shared in-flight total. Groups
    /// born without outputs never are; counted groups leave the total the
    /// moment their last ack arrives.
    counted: bool,
    /// Held until the group is retired so the origin outlives every ack.
    #[allow(dead_code)]
    origin: Arc<IncomingMessage>,
}

/// Offset bookkeeping for one input topic on this partition. Offsets are only
/// ordered per (topic, partition), so each topic tracks its own queue and
/// watermark.
#[derive(Default)]
struct TopicState {
    in_flight: VecDeque<InFlightGroup>,
    /// Highest offset whose group and all older groups are ack-complete.
    commit_watermark: Option<i64>,
    /// Watermark as of the last mark sent to the offset manager.
    last_marked: Option<i64>,
    last_processed: Option<i64>,
}

pub(crate) struct PartitionProcessor {
    partition: i32,
    processor: Box<dyn MessageProcessor>,
    serdes: HashMap<String, TopicSerde>,
    topics: HashMap<String, TopicState>,
    consumers: Vec<PartitionConsumer>,
    offset_manager: Arc<dyn OffsetManager>,
    /// Groups with outstanding acks, shared across every partition processor
    /// of the topic processor. Only the coordinator loop mutates it.
    in_flight_groups: Arc<AtomicUsize>,
    max_in_flight_groups: usize,
    last_topic: Option<String>,
    metrics: Arc<ProcessorMetrics>,
}

impl PartitionProcessor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        partition: i32,
        processor: Box<dyn MessageProcessor>,
        serdes: HashMap<String, TopicSerde>,
        consumers: Vec<PartitionConsumer>,
        offset_manager: Arc<dyn OffsetManager>,
        in_flight_groups: Arc<AtomicUsize>,
        max_in_flight_groups: usize,
        metrics: Arc<ProcessorMetrics>,
    ) -> Self {
        let topics = serdes
            .keys()
            .map(|topic| (topic.clone(), TopicState::default()))
            .collect();
        PartitionProcessor {
            partition,
            processor,
            serdes,
            topics,
            consumers,
            offset_manager,
            in_flight_groups,
            max_in_flight_groups,
            last_topic: None,
            metrics,
        }
    }

    /// Hands the per-topic consumer streams to the fan-in.
    pub(crate) fn take_consumers(&mut self) -> Vec<PartitionConsumer> {
        std::mem::take(&mut self.consumers)
    }

    /// Whether one more in-flight group fits under the shared cap. Pure; the
    /// coordinator re-tests it after every serviced ack.
    pub(crate) fn is_ready_for_message(&self) -> bool {
        self.in_flight_groups.load(Ordering::Relaxed) < self.max_in_flight_groups
    }

    /// Deserializes the record, runs user processing, and records the
    /// resulting in-flight group. Returns the outputs in emission order and
    /// whether user code requested a commit synchronized on this message.
    pub(crate) fn process(&mut self, record: ConsumerRecord) -> (Vec<ProducerMessage>, bool) {
        let serde = self
            .serdes
            .get(&record.topic)
            .expect("serde coverage is validated at construction");
        let incoming = Arc::new(IncomingMessage {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: serde.key_serde.deserialize(&record.key),
            value: serde.value_serde.deserialize(&record.value),
            timestamp: record.timestamp,
        });

        let state = self
            .topics
            .get_mut(&record.topic)
            .expect("every input topic has state from construction");
        if let Some(last) = state.last_processed {
            if record.offset <= last {
                warn!(
                    topic = %record.topic,
                    partition = self.partition,
                    offset = record.offset,
                    last,
                    "input offset did not advance"
                );
            }
        }
        state.last_processed = Some(record.offset);
        self.last_topic = Some(record.topic.clone());
        self.metrics
            .read_total
            .get_or_create(&topic_partition_labels(&record.topic, self.partition))
            .inc();

        let mut sender = Sender::new();
        let mut coordinator = Coordinator::new();
        self.processor
            .process(&incoming, &mut sender, &mut coordinator);

        let messages: Vec<ProducerMessage> = sender
            .into_messages()
            .into_iter()
            .map(|message| ProducerMessage {
                topic: message.topic,
                partition: message.partition,
                key: message.key,
                value: message.value,
                origin: Arc::clone(&incoming),
                retries: 0,
            })
            .collect();

        let counted = !messages.is_empty();
        if counted {
            self.in_flight_groups.fetch_add(1, Ordering::Relaxed);
        }
        state.in_flight.push_back(InFlightGroup {
            offset: record.offset,
            outstanding: messages.len(),
            counted,
            origin: incoming,
        });

        (messages, coordinator.must_commit())
    }

    /// Housekeeping once the outputs of the last processed message have been
    /// submitted: retire any groups that are already ack-complete (a message
    /// without outputs is born that way).
    pub(crate) fn on_process_completed(&mut self) {
        if let Some(topic) = self.last_topic.clone() {
            self.advance(&topic);
        }
    }

    /// Routes one producer success (or drop) back to its group.
    pub(crate) fn on_producer_ack(&mut self, message: &ProducerMessage) {
        let origin = &message.origin;
        {
            let Some(state) = self.topics.get_mut(&origin.topic) else {
                warn!(topic = %origin.topic, partition = self.partition, "ack for unknown topic");
                return;
            };
            let Ok(index) = state
                .in_flight
                .binary_search_by_key(&origin.offset, |group| group.offset)
            else {
                warn!(
                    topic = %origin.topic,
                    partition = self.partition,
                    offset = origin.offset,
                    "ack for unknown in-flight group"
                );
                return;
            };
            let group = &mut state.in_flight[index];
            group.outstanding = group.outstanding.saturating_sub(1);
            if group.outstanding == 0 && group.counted {
                group.counted = false;
                self.in_flight_groups.fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.metrics
            .ack_total
            .get_or_create(&topic_partition_labels(&origin.topic, self.partition))
            .inc();
        let topic = origin.topic.clone();
        self.advance(&topic);
    }

    /// Pops ack-complete groups off the front of the queue and moves the
    /// commit watermark over them.
    fn advance(&mut self, topic: &str) {
        let Some(state) = self.topics.get_mut(topic) else {
            return;
        };
        while state
            .in_flight
            .front()
            .is_some_and(|group| group.outstanding == 0)
        {
            if let Some(group) = state.in_flight.pop_front() {
                state.commit_watermark = Some(group.offset);
            }
        }
    }

    /// True when every processed offset on this partition is ack-complete.
    pub(crate) fn is_ready_to_commit(&self) -> bool {
        self.topics.values().all(|state| state.in_flight.is_empty())
    }

    /// Marks the current watermarks and asks the offset manager to persist
    /// them.
    pub(crate) async fn commit(&mut self) -> Result<()> {
        self.mark_offsets().await?;
        self.offset_manager.flush().await
    }

    /// Best-effort mark of the current watermarks.
    pub(crate) async fn on_mark_offsets_tick(&mut self) -> Result<()> {
        self.mark_offsets().await
    }

    /// Final mark, then let the offset manager flush.
    pub(crate) async fn on_shutdown(&mut self) -> Result<()> {
        self.mark_offsets().await?;
        self.offset_manager.flush().await
    }

    async fn mark_offsets(&mut self) -> Result<()> {
        for (topic, state) in &mut self.topics {
            let Some(watermark) = state.commit_watermark else {
                continue;
            };
            if state.last_marked == Some(watermark) {
                continue;
            }
            // The mark names the next offset to consume.
            self.offset_manager
                .mark_offset(topic, self.partition, watermark + 1)
                .await?;
            state.last_marked = Some(watermark);
            self.metrics
                .marked_total
                .get_or_create(&topic_partition_labels(topic, self.partition))
                .inc();
            debug!(
                topic = %topic,
                partition = self.partition,
                next_offset = watermark + 1,
                "marked offset"
            );
        }
        Ok(())
    }
}
