//! The topic processor and its coordinator run loop.
//!
//! All partition state is mutated from a single task: the run loop selects
//! over the merged consumer stream, the producer success stream, the drainer
//! events, the offset-mark timer, and the shutdown signal, and handles one
//! event to completion per iteration. No locks guard partition state because
//! nothing else touches it.
//!
//! The producer's success stream has a bounded buffer, so the loop must keep
//! draining it at every point where it can block: while waiting for a free
//! in-flight slot, while submitting outputs to a full producer input, and
//! while waiting for commit readiness. Each of those paths funnels through
//! [RunLoop::service_ack].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prometheus_client::registry::Registry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::client::{
    LogClient, PartitionConsumer, Producer, ProducerConfig, ProducerError, StartFrom,
};
use crate::config::{InitialOffset, OnProducerError, ProducerRetryConfig, TopicProcessorConfig};
use crate::error::{Error, Result};
use crate::message::{ConsumerRecord, ProducerMessage};
use crate::metrics::{topic_partition_labels, ProcessorMetrics};
use crate::partition_processor::PartitionProcessor;
use crate::processor::MessageProcessor;

/// A topic processor: consumes the partitions assigned to this container,
/// runs the user's processing function over every message, produces the
/// outputs, and marks input offsets once everything derived from them has
/// been acknowledged.
pub struct TopicProcessor {
    shutdown: CancellationToken,
    tasks: TaskTracker,
    parts: Option<RunParts>,
    handle: Option<JoinHandle<Result<()>>>,
}

/// Everything [TopicProcessor::start] moves into the spawned run loop.
struct RunParts {
    config: TopicProcessorConfig,
    client: Arc<dyn LogClient>,
    producer: Producer,
    partition_processors: HashMap<i32, PartitionProcessor>,
    in_flight_groups: Arc<AtomicUsize>,
    metrics: Arc<ProcessorMetrics>,
}

impl TopicProcessor {
    /// Builds a topic processor for `container_id`. Validates the
    /// configuration, connects the producer and offset manager, and opens a
    /// consumer for every (input topic, assigned partition) pair, resuming
    /// from the consumer group's stored offset when one exists.
    pub async fn new(
        config: TopicProcessorConfig,
        client: Arc<dyn LogClient>,
        mut make_processor: impl FnMut() -> Box<dyn MessageProcessor>,
        container_id: usize,
        registry: &mut Registry,
    ) -> Result<TopicProcessor> {
        if container_id >= config.container_count {
            return Err(Error::Config(format!(
                "container id expected to be between 0 and {}, got {}",
                config.container_count.saturating_sub(1),
                container_id
            )));
        }
        for topic in &config.input_topics {
            if !config.topic_serdes.contains_key(topic) {
                return Err(Error::Config(format!(
                    "could not find serde for topic '{topic}'"
                )));
            }
        }
        for (&partition, &container) in &config.partition_to_container_id {
            if container >= config.container_count {
                return Err(Error::Config(format!(
                    "partition {partition} mapped to container {container}, expected less than {}",
                    config.container_count
                )));
            }
        }

        let partitions = config.partitions_for_container(container_id);
        if partitions.is_empty() {
            warn!(container_id, "no partitions assigned to this container");
        }

        let metrics = ProcessorMetrics::register(registry);
        let producer = client
            .producer(ProducerConfig {
                client_id: config.producer_client_id(container_id),
                required_acks: config.config.required_acks,
            })
            .await?;
        let offset_manager = client.offset_manager(&config.consumer_group()).await?;
        let in_flight_groups = Arc::new(AtomicUsize::new(0));

        let mut partition_processors = HashMap::with_capacity(partitions.len());
        for &partition in &partitions {
            let mut consumers = Vec::with_capacity(config.input_topics.len());
            for topic in &config.input_topics {
                let start = match offset_manager.next_offset(topic, partition).await? {
                    Some(offset) => StartFrom::Offset(offset),
                    None => match config.config.initial_offset {
                        InitialOffset::Oldest => StartFrom::Oldest,
                        InitialOffset::Newest => StartFrom::Newest,
                    },
                };
                consumers.push(client.consume_partition(topic, partition, start).await?);
            }
            partition_processors.insert(
                partition,
                PartitionProcessor::new(
                    partition,
                    make_processor(),
                    config.topic_serdes.clone(),
                    consumers,
                    Arc::clone(&offset_manager),
                    Arc::clone(&in_flight_groups),
                    config.config.max_in_flight_message_groups,
                    Arc::clone(&metrics),
                ),
            );
        }

        info!(
            container_id,
            consumer_group = %config.consumer_group(),
            ?partitions,
            "topic processor created"
        );
        Ok(TopicProcessor {
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            parts: Some(RunParts {
                config,
                client,
                producer,
                partition_processors,
                in_flight_groups,
                metrics,
            }),
            handle: None,
        })
    }

    /// Launches the coordinator loop. Returns immediately.
    pub fn start(&mut self) {
        let Some(parts) = self.parts.take() else {
            warn!("topic processor already started");
            return;
        };
        let RunParts {
            config,
            client,
            producer,
            mut partition_processors,
            in_flight_groups,
            metrics,
        } = parts;
        let Producer {
            input,
            successes,
            errors,
        } = producer;

        // Fan-in: one forwarder per consumed (topic, partition) stream onto a
        // rendezvous channel. The fan-in token releases forwarders parked on
        // send at shutdown.
        let fanin = CancellationToken::new();
        let (merged_tx, merged) = mpsc::channel(1);
        for pp in partition_processors.values_mut() {
            for consumer in pp.take_consumers() {
                self.tasks
                    .spawn(forward(consumer, merged_tx.clone(), fanin.clone()));
            }
        }
        drop(merged_tx);

        let (drain_tx, drain_events) = mpsc::channel(16);
        self.tasks.spawn(drain_producer_errors(
            errors,
            input.clone(),
            drain_tx,
            config.config.on_producer_error.clone(),
            self.shutdown.clone(),
        ));

        let run_loop = RunLoop {
            config,
            client,
            input: Some(input),
            successes,
            drain_events,
            partition_processors,
            in_flight_groups,
            metrics,
            shutdown: self.shutdown.clone(),
            fanin,
        };
        self.handle = Some(self.tasks.spawn(run_loop.run(merged)));
    }

    /// Signals the coordinator to stop at the next safe point and waits for
    /// every task to finish and the producer and client to be closed.
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel();
        self.tasks.close();
        let result = match self.handle.take() {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Runtime(format!("run loop task failed: {e}")))?,
            None => Ok(()),
        };
        self.tasks.wait().await;
        result
    }
}

/// State owned by the coordinator loop task.
struct RunLoop {
    config: TopicProcessorConfig,
    client: Arc<dyn LogClient>,
    /// Dropped at shutdown to close the producer.
    input: Option<mpsc::Sender<ProducerMessage>>,
    successes: mpsc::Receiver<ProducerMessage>,
    drain_events: mpsc::Receiver<DrainEvent>,
    partition_processors: HashMap<i32, PartitionProcessor>,
    in_flight_groups: Arc<AtomicUsize>,
    metrics: Arc<ProcessorMetrics>,
    shutdown: CancellationToken,
    fanin: CancellationToken,
}

/// What the producer error drainer reports back to the coordinator.
enum DrainEvent {
    /// Failed message counted as acknowledged under the drop policy.
    Dropped(ProducerMessage),
    Fatal(Error),
}

impl RunLoop {
    async fn run(mut self, merged: mpsc::Receiver<ConsumerRecord>) -> Result<()> {
        let result = self.dispatch(merged).await;
        self.fanin.cancel();
        if let Err(error) = &result {
            error!(%error, "topic processor run loop terminated");
            let _ = self.client.close().await;
        }
        result
    }

    async fn dispatch(&mut self, mut merged: mpsc::Receiver<ConsumerRecord>) -> Result<()> {
        let auto_mark = self.config.config.mark_offsets_automatically;
        let period = if auto_mark {
            self.config.config.auto_mark_offsets_interval
        } else {
            Duration::from_secs(3600)
        };
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let shutdown = self.shutdown.clone();
        let mut merged_open = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    return self.on_shutdown().await;
                }
                maybe = self.successes.recv() => match maybe {
                    Some(message) => self.on_producer_ack(message),
                    None => {
                        return Err(Error::Producer(
                            "producer success stream closed".to_string(),
                        ))
                    }
                },
                maybe = self.drain_events.recv() => match maybe {
                    Some(event) => self.on_drain_event(event)?,
                    None => {
                        return Err(Error::Producer(
                            "producer error drainer terminated".to_string(),
                        ))
                    }
                },
                _ = ticker.tick(), if auto_mark => self.on_mark_offsets_tick().await?,
                maybe = merged.recv(), if merged_open => match maybe {
                    Some(record) => self.process_consumer_message(record).await?,
                    None => merged_open = false,
                },
            }
        }
    }

    /// Handles one consumer record to completion: wait for an in-flight
    /// slot, run user processing, submit the outputs in order, and honor a
    /// commit request. Acks are serviced at every point this can block.
    async fn process_consumer_message(&mut self, record: ConsumerRecord) -> Result<()> {
        let partition = record.partition;
        if !self.partition_processors.contains_key(&partition) {
            warn!(topic = %record.topic, partition, "record for unassigned partition");
            return Ok(());
        }

        loop {
            let ready = self
                .partition_processors
                .get(&partition)
                .is_some_and(|pp| pp.is_ready_for_message());
            if ready {
                break;
            }
            self.service_ack().await?;
        }

        let Some(pp) = self.partition_processors.get_mut(&partition) else {
            return Ok(());
        };
        let (messages, must_commit) = pp.process(record);

        let Some(input) = self.input.clone() else {
            return Err(Error::Producer("producer input closed".to_string()));
        };
        let mut queue = VecDeque::from(messages);
        while !queue.is_empty() {
            tokio::select! {
                permit = input.reserve() => {
                    let permit = permit
                        .map_err(|_| Error::Producer("producer input closed".to_string()))?;
                    if let Some(message) = queue.pop_front() {
                        self.metrics
                            .write_total
                            .get_or_create(&topic_partition_labels(
                                &message.topic,
                                message.partition,
                            ))
                            .inc();
                        permit.send(message);
                    }
                }
                serviced = self.service_ack() => serviced?,
            }
        }

        if let Some(pp) = self.partition_processors.get_mut(&partition) {
            pp.on_process_completed();
        }
        self.sync_in_flight_gauge();

        if must_commit {
            loop {
                let ready = self
                    .partition_processors
                    .get(&partition)
                    .map_or(true, |pp| pp.is_ready_to_commit());
                if ready {
                    break;
                }
                self.service_ack().await?;
            }
            (self.config.config.mark_offsets_hook)();
            if let Some(pp) = self.partition_processors.get_mut(&partition) {
                pp.commit().await?;
            }
            debug!(partition, "synchronous commit completed");
        }
        Ok(())
    }

    /// Waits for exactly one producer acknowledgement (or drainer event) and
    /// applies it.
    async fn service_ack(&mut self) -> Result<()> {
        tokio::select! {
            maybe = self.successes.recv() => {
                let message = maybe.ok_or_else(|| {
                    Error::Producer("producer success stream closed".to_string())
                })?;
                self.on_producer_ack(message);
                Ok(())
            }
            Some(event) = self.drain_events.recv() => self.on_drain_event(event),
        }
    }

    /// Routes a producer success to the partition processor that owns the
    /// originating message.
    fn on_producer_ack(&mut self, message: ProducerMessage) {
        let partition = message.origin.partition;
        match self.partition_processors.get_mut(&partition) {
            Some(pp) => pp.on_producer_ack(&message),
            None => warn!(partition, "producer ack for unassigned partition"),
        }
        self.sync_in_flight_gauge();
    }

    fn on_drain_event(&mut self, event: DrainEvent) -> Result<()> {
        match event {
            DrainEvent::Dropped(message) => {
                self.metrics
                    .dropped_total
                    .get_or_create(&topic_partition_labels(&message.topic, message.partition))
                    .inc();
                self.on_producer_ack(message);
                Ok(())
            }
            DrainEvent::Fatal(error) => Err(error),
        }
    }

    async fn on_mark_offsets_tick(&mut self) -> Result<()> {
        (self.config.config.mark_offsets_hook)();
        for pp in self.partition_processors.values_mut() {
            pp.on_mark_offsets_tick().await?;
        }
        Ok(())
    }

    /// Close the producer and drain every outstanding acknowledgement, then
    /// let each partition processor mark and flush, then close the client.
    async fn on_shutdown(&mut self) -> Result<()> {
        info!("shutting down, draining producer");
        self.input = None;
        loop {
            tokio::select! {
                maybe = self.successes.recv() => match maybe {
                    Some(message) => self.on_producer_ack(message),
                    None => break,
                },
                Some(event) = self.drain_events.recv() => self.on_drain_event(event)?,
            }
        }
        while let Some(event) = self.drain_events.recv().await {
            self.on_drain_event(event)?;
        }
        for pp in self.partition_processors.values_mut() {
            pp.on_shutdown().await?;
        }
        self.client.close().await?;
        info!("topic processor stopped");
        Ok(())
    }

    fn sync_in_flight_gauge(&self) {
        self.metrics
            .in_flight_groups
            .set(self.in_flight_groups.load(Ordering::Relaxed) as i64);
    }
}

/// Forwards one partition consumer stream onto the merged stream. Never
/// reorders within the stream; exits when the stream ends, the coordinator
/// goes away, or the fan-in token fires.
async fn forward(
    mut consumer: PartitionConsumer,
    merged: mpsc::Sender<ConsumerRecord>,
    fanin: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = fanin.cancelled() => return,
            maybe = consumer.messages.recv() => {
                let Some(record) = maybe else { return };
                tokio::select! {
                    _ = fanin.cancelled() => return,
                    sent = merged.send(record) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Drains the producer error stream and applies the configured policy.
/// Holds its own producer input handle for resubmissions and releases it at
/// shutdown so the producer can close.
async fn drain_producer_errors(
    mut errors: mpsc::Receiver<ProducerError>,
    input: mpsc::Sender<ProducerMessage>,
    events: mpsc::Sender<DrainEvent>,
    policy: OnProducerError,
    shutdown: CancellationToken,
) {
    let mut input = Some(input);
    let mut fatal_sent = false;
    loop {
        tokio::select! {
            _ = shutdown.cancelled(), if input.is_some() => {
                input = None;
            }
            maybe = errors.recv() => {
                let Some(failure) = maybe else { return };
                if fatal_sent {
                    continue;
                }
                match &policy {
                    OnProducerError::Abort => {
                        error!(
                            error = %failure.error,
                            topic = %failure.message.topic,
                            "producer error, aborting"
                        );
                        let _ = events.send(DrainEvent::Fatal(failure.error)).await;
                        fatal_sent = true;
                    }
                    OnProducerError::Drop => {
                        warn!(
                            error = %failure.error,
                            topic = %failure.message.topic,
                            "producer error, dropping message"
                        );
                        let _ = events.send(DrainEvent::Dropped(failure.message)).await;
                    }
                    OnProducerError::Retry(retry) => {
                        let mut message = failure.message;
                        if message.retries >= retry.max_attempts {
                            error!(
                                error = %failure.error,
                                topic = %message.topic,
                                retries = message.retries,
                                "producer retries exhausted, aborting"
                            );
                            let _ = events.send(DrainEvent::Fatal(failure.error)).await;
                            fatal_sent = true;
                            continue;
                        }
                        let delay = backoff_delay(retry, message.retries);
                        debug!(
                            topic = %message.topic,
                            retries = message.retries,
                            ?delay,
                            "retrying failed produce"
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                input = None;
                                continue;
                            }
                            _ = time::sleep(delay) => {}
                        }
                        message.retries += 1;
                        if let Some(sender) = &input {
                            if sender.send(message).await.is_err() {
                                warn!("producer closed before a retry could be resubmitted");
                            }
                        }
                    }
                }
            }
        }
    }
}

fn backoff_delay(config: &ProducerRetryConfig, attempt: u32) -> Duration {
    let factor = config.factor.max(1.0);
    let millis = config.initial_interval.as_millis() as f64 * factor.powi(attempt.min(24) as i32);
    Duration::from_millis(millis as u64).min(config.max_interval)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::Config;
    use crate::mem::MemLog;
    use crate::message::IncomingMessage;
    use crate::processor::{Coordinator, Sender};
    use crate::serdes::{StringSerde, TopicSerde};

    struct Noop;

    impl MessageProcessor for Noop {
        fn process(&mut self, _: &IncomingMessage, _: &mut Sender, _: &mut Coordinator) {}
    }

    fn config_with(topics: Vec<&str>, serde_topics: Vec<&str>) -> TopicProcessorConfig {
        let serdes = serde_topics
            .into_iter()
            .map(|topic| {
                (
                    topic.to_string(),
                    TopicSerde {
                        key_serde: Arc::new(StringSerde),
                        value_serde: Arc::new(StringSerde),
                    },
                )
            })
            .collect();
        TopicProcessorConfig {
            topic_processor_name: "setup".to_string(),
            broker_list: vec!["mem://".to_string()],
            input_topics: topics.into_iter().map(String::from).collect(),
            topic_serdes: serdes,
            container_count: 1,
            partition_to_container_id: HashMap::from([(0, 0)]),
            config: Config::default(),
        }
    }

    #[tokio::test]
    async fn rejects_out_of_range_container_id() {
        let config = config_with(vec!["events"], vec!["events"]);
        let result = TopicProcessor::new(
            config,
            Arc::new(MemLog::new()),
            || Box::new(Noop) as Box<dyn MessageProcessor>,
            3,
            &mut Registry::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn rejects_missing_serde() {
        let config = config_with(vec!["events"], vec![]);
        let result = TopicProcessor::new(
            config,
            Arc::new(MemLog::new()),
            || Box::new(Noop) as Box<dyn MessageProcessor>,
            0,
            &mut Registry::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn rejects_unmapped_container_in_assignment() {
        let mut config = config_with(vec!["events"], vec!["events"]);
        config.partition_to_container_id.insert(1, 9);
        let result = TopicProcessor::new(
            config,
            Arc::new(MemLog::new()),
            || Box::new(Noop) as Box<dyn MessageProcessor>,
            0,
            &mut Registry::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = ProducerRetryConfig {
            max_attempts: 5,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(450),
            factor: 2.0,
        };
        assert_eq!(backoff_delay(&retry, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&retry, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&retry, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(&retry, 3), Duration::from_millis(450));
    }
}
