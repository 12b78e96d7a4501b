//! Processing metrics, kept as explicit dependencies and registered into a
//! caller-supplied registry.

use std::sync::Arc;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

const TOPIC_LABEL: &str = "topic";
const PARTITION_LABEL: &str = "partition";

/// Counters and gauges published by a topic processor.
#[derive(Default)]
pub struct ProcessorMetrics {
    /// Records read from input topics.
    pub read_total: Family<Vec<(String, String)>, Counter>,
    /// Messages submitted to the producer.
    pub write_total: Family<Vec<(String, String)>, Counter>,
    /// Producer success acknowledgements received.
    pub ack_total: Family<Vec<(String, String)>, Counter>,
    /// Messages discarded by the drop-on-producer-error policy.
    pub dropped_total: Family<Vec<(String, String)>, Counter>,
    /// Offset marks sent to the offset manager.
    pub marked_total: Family<Vec<(String, String)>, Counter>,
    /// Message groups with outstanding acknowledgements, across partitions.
    pub in_flight_groups: Gauge,
}

impl ProcessorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers all metrics under the `topic_processor` prefix.
    pub fn register(registry: &mut Registry) -> Arc<Self> {
        let metrics = Self::new();
        let sub = registry.sub_registry_with_prefix("topic_processor");
        sub.register(
            "read",
            "Records read from input topics",
            metrics.read_total.clone(),
        );
        sub.register(
            "write",
            "Messages submitted to the producer",
            metrics.write_total.clone(),
        );
        sub.register(
            "ack",
            "Producer success acknowledgements received",
            metrics.ack_total.clone(),
        );
        sub.register(
            "dropped",
            "Messages discarded after a produce failure",
            metrics.dropped_total.clone(),
        );
        sub.register(
            "marked",
            "Offset marks sent to the offset manager",
            metrics.marked_total.clone(),
        );
        sub.register(
            "in_flight_groups",
            "Message groups with outstanding acknowledgements",
            metrics.in_flight_groups.clone(),
        );
        Arc::new(metrics)
    }
}

pub(crate) fn topic_partition_labels(topic: &str, partition: i32) -> Vec<(String, String)> {
    vec![
        (TOPIC_LABEL.to_string(), topic.to_string()),
        (PARTITION_LABEL.to_string(), partition.to_string()),
    ]
}
