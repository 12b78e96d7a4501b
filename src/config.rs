//! Configuration of a topic processor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::serdes::TopicSerde;

const DEFAULT_MAX_IN_FLIGHT_MESSAGE_GROUPS: usize = 5000;
const DEFAULT_AUTO_MARK_OFFSETS_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_PRODUCER_RETRY_MAX_ATTEMPTS: u32 = 16;
const DEFAULT_PRODUCER_RETRY_INITIAL_INTERVAL_MS: u64 = 100;
const DEFAULT_PRODUCER_RETRY_MAX_INTERVAL_MS: u64 = 10_000;
const DEFAULT_PRODUCER_RETRY_FACTOR: f64 = 2.0;

/// Durability level required from the log before a produced message is
/// acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAcks {
    /// Fire and forget.
    None,
    /// The partition leader has written the message.
    WaitForLocal,
    /// All in-sync replicas have written the message.
    WaitForAll,
}

/// Where to start consuming a partition for which the consumer group has no
/// stored offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialOffset {
    Oldest,
    Newest,
}

/// Policy applied when the producer reports a per-message send failure.
#[derive(Debug, Clone, PartialEq)]
pub enum OnProducerError {
    /// Terminate the run loop. Uncommitted input is redelivered on restart.
    Abort,
    /// Resubmit with exponential backoff; aborts once attempts are exhausted.
    /// A resubmitted message re-enters the producer input behind anything
    /// submitted in the meantime.
    Retry(ProducerRetryConfig),
    /// Count the message as acknowledged and keep going. Its payload is not
    /// durably written.
    Drop,
}

/// Backoff applied between producer resubmissions.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRetryConfig {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub factor: f64,
}

impl Default for ProducerRetryConfig {
    fn default() -> Self {
        ProducerRetryConfig {
            max_attempts: DEFAULT_PRODUCER_RETRY_MAX_ATTEMPTS,
            initial_interval: Duration::from_millis(DEFAULT_PRODUCER_RETRY_INITIAL_INTERVAL_MS),
            max_interval: Duration::from_millis(DEFAULT_PRODUCER_RETRY_MAX_INTERVAL_MS),
            factor: DEFAULT_PRODUCER_RETRY_FACTOR,
        }
    }
}

/// Callback invoked immediately before offsets are marked.
pub type MarkOffsetsHook = Arc<dyn Fn() + Send + Sync>;

/// Tunables of the processing runtime.
#[derive(Clone)]
pub struct Config {
    pub required_acks: RequiredAcks,
    /// Mark committable offsets on a timer in addition to explicit commits.
    pub mark_offsets_automatically: bool,
    pub auto_mark_offsets_interval: Duration,
    pub mark_offsets_hook: MarkOffsetsHook,
    /// Cap on the total number of in-flight message groups across all
    /// assigned partitions. This is the sole backpressure knob.
    pub max_in_flight_message_groups: usize,
    pub initial_offset: InitialOffset,
    pub on_producer_error: OnProducerError,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            required_acks: RequiredAcks::WaitForAll,
            mark_offsets_automatically: true,
            auto_mark_offsets_interval: DEFAULT_AUTO_MARK_OFFSETS_INTERVAL,
            mark_offsets_hook: Arc::new(|| {}),
            max_in_flight_message_groups: DEFAULT_MAX_IN_FLIGHT_MESSAGE_GROUPS,
            initial_offset: InitialOffset::Oldest,
            on_producer_error: OnProducerError::Abort,
        }
    }
}

/// Static description of one topic processor deployment: what to consume,
/// how to interpret it, and which container owns which partitions.
#[derive(Clone)]
pub struct TopicProcessorConfig {
    pub topic_processor_name: String,
    pub broker_list: Vec<String>,
    pub input_topics: Vec<String>,
    /// Serde per topic. Must cover every input topic.
    pub topic_serdes: HashMap<String, TopicSerde>,
    pub container_count: usize,
    /// Static partition to container assignment, shared by all input topics.
    pub partition_to_container_id: HashMap<i32, usize>,
    pub config: Config,
}

impl TopicProcessorConfig {
    /// Partitions assigned to `container_id`, in ascending order.
    pub fn partitions_for_container(&self, container_id: usize) -> Vec<i32> {
        let mut partitions: Vec<i32> = self
            .partition_to_container_id
            .iter()
            .filter(|(_, &container)| container == container_id)
            .map(|(&partition, _)| partition)
            .collect();
        partitions.sort_unstable();
        partitions
    }

    /// Consumer group shared by every container of this topic processor.
    pub fn consumer_group(&self) -> String {
        format!("tributary-topic-processor-{}", self.topic_processor_name)
    }

    pub(crate) fn producer_client_id(&self, container_id: usize) -> String {
        format!(
            "tributary-topic-processor-{}-{}",
            self.topic_processor_name, container_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(name: &str) -> TopicProcessorConfig {
        TopicProcessorConfig {
            topic_processor_name: name.to_string(),
            broker_list: vec!["localhost:9092".to_string()],
            input_topics: vec![],
            topic_serdes: HashMap::new(),
            container_count: 2,
            partition_to_container_id: HashMap::from([(0, 0), (1, 1), (2, 0), (3, 1)]),
            config: Config::default(),
        }
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        (config.mark_offsets_hook)();
        assert_eq!(config.required_acks, RequiredAcks::WaitForAll);
        assert_eq!(config.max_in_flight_message_groups, 5000);
        assert_eq!(config.on_producer_error, OnProducerError::Abort);
        assert_eq!(config.initial_offset, InitialOffset::Oldest);
    }

    #[test]
    fn partitions_for_container_filters_and_sorts() {
        let config = minimal("words");
        assert_eq!(config.partitions_for_container(0), vec![0, 2]);
        assert_eq!(config.partitions_for_container(1), vec![1, 3]);
        assert!(config.partitions_for_container(7).is_empty());
    }

    #[test]
    fn derived_names() {
        let config = minimal("words");
        assert_eq!(config.consumer_group(), "tributary-topic-processor-words");
        assert_eq!(
            config.producer_client_id(1),
            "tributary-topic-processor-words-1"
        );
    }
}
