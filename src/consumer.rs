use crate::config::KafkaConfig;
use crate::handler::HandlerRegistry;
use crate::message::DeliveryUnit;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use parking_lot::Mutex;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

/// Position of a delivery unit in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryId {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Acknowledges delivery units back to the log
pub trait Acknowledger: Send + Sync {
    fn acknowledge(&self, delivery: &DeliveryId) -> Result<(), ConsumerError>;

    /// Called for a unit that is left unacknowledged
    fn withhold(&self, _delivery: &DeliveryId) {}
}

/// How a delivery unit was disposed of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Acknowledged,
    /// The handler reported failure
    Declined,
    DecodeFailed,
    NoHandler,
    HandlerFailed,
    /// The handler succeeded but the acknowledgment could not be sent
    AckFailed,
}

impl DispatchOutcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, DispatchOutcome::Acknowledged)
    }
}

/// Decodes delivery units and routes them to model handlers
#[derive(Clone)]
pub struct JobDispatcher {
    registry: Arc<HandlerRegistry>,
}

impl JobDispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// Handle one delivery unit. It is acknowledged iff its handler returns `Ok(true)`.
    #[instrument(skip(self, payload, ack), fields(partition = delivery.partition, offset = delivery.offset))]
    pub async fn on_message(
        &self,
        delivery: &DeliveryId,
        payload: &[u8],
        ack: &dyn Acknowledger,
    ) -> DispatchOutcome {
        let outcome = self.dispatch(payload).await;

        let outcome = match outcome {
            DispatchOutcome::Acknowledged => match ack.acknowledge(delivery) {
                Ok(()) => DispatchOutcome::Acknowledged,
                Err(e) => {
                    warn!(error = %e, "Failed to acknowledge delivery unit");
                    DispatchOutcome::AckFailed
                }
            },
            other => {
                ack.withhold(delivery);
                other
            }
        };

        match outcome {
            DispatchOutcome::Acknowledged => {
                metrics::counter!("jobs.messages.acknowledged").increment(1)
            }
            DispatchOutcome::DecodeFailed => {
                metrics::counter!("jobs.messages.decode_failed").increment(1)
            }
            _ => metrics::counter!("jobs.messages.unacknowledged").increment(1),
        }

        outcome
    }

    async fn dispatch(&self, payload: &[u8]) -> DispatchOutcome {
        let unit = match DeliveryUnit::decode(payload) {
            Ok(unit) => unit,
            Err(e) => {
                error!(error = %e, "Failed to decode delivery unit");
                return DispatchOutcome::DecodeFailed;
            }
        };

        let model_code = unit.model_code();
        let Some(handler) = self.registry.get(model_code) else {
            debug!(model_code = %model_code, "No handler registered, leaving unit unacknowledged");
            return DispatchOutcome::NoHandler;
        };

        let ctx = unit.user_context();
        let result = match &unit {
            DeliveryUnit::Single(message) => handler.handle(&ctx, message).await,
            DeliveryUnit::Batch(messages) => handler.handle_batch(&ctx, messages).await,
        };

        match result {
            Ok(true) => DispatchOutcome::Acknowledged,
            Ok(false) => {
                info!(model_code = %model_code, size = unit.len(), "Handler declined delivery unit");
                DispatchOutcome::Declined
            }
            Err(e) => {
                error!(
                    model_code = %model_code,
                    user_id = ctx.user_id,
                    error = %e,
                    "Handler failed"
                );
                DispatchOutcome::HandlerFailed
            }
        }
    }
}

/// Keeps partition commits from passing a unit that was never acknowledged.
///
/// Kafka offsets are cumulative, so committing offset `n + 1` would also
/// acknowledge every earlier unit. Once a unit is withheld, later successes on
/// its partition are not committed until that unit is acknowledged, which
/// happens when the log delivers it again after a restart or rebalance.
#[derive(Debug, Default)]
pub struct CommitTracker {
    withheld: Mutex<HashMap<(String, i32), BTreeSet<i64>>>,
}

impl CommitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn withhold(&self, delivery: &DeliveryId) {
        self.withheld
            .lock()
            .entry((delivery.topic.clone(), delivery.partition))
            .or_default()
            .insert(delivery.offset);
    }

    /// Offset to commit after acknowledging `delivery`, if any
    pub fn acknowledge(&self, delivery: &DeliveryId) -> Option<i64> {
        let mut withheld = self.withheld.lock();
        let key = (delivery.topic.clone(), delivery.partition);
        let Some(offsets) = withheld.get_mut(&key) else {
            return Some(delivery.offset + 1);
        };

        offsets.remove(&delivery.offset);
        let blocked = offsets.first().is_some_and(|&lowest| lowest < delivery.offset);
        if offsets.is_empty() {
            withheld.remove(&key);
        }

        (!blocked).then_some(delivery.offset + 1)
    }

    /// Lowest withheld offset of a partition
    pub fn lowest_withheld(&self, topic: &str, partition: i32) -> Option<i64> {
        self.withheld
            .lock()
            .get(&(topic.to_string(), partition))
            .and_then(|offsets| offsets.first().copied())
    }
}

/// Commits the next offset of a partition
pub trait OffsetSink: Send + Sync {
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), ConsumerError>;
}

/// Acknowledger that commits through a [`CommitTracker`]
pub struct TrackedAcknowledger<S> {
    sink: S,
    tracker: CommitTracker,
}

impl<S: OffsetSink> TrackedAcknowledger<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            tracker: CommitTracker::new(),
        }
    }

    pub fn tracker(&self) -> &CommitTracker {
        &self.tracker
    }
}

impl<S: OffsetSink> Acknowledger for TrackedAcknowledger<S> {
    fn acknowledge(&self, delivery: &DeliveryId) -> Result<(), ConsumerError> {
        match self.tracker.acknowledge(delivery) {
            Some(next_offset) => self.sink.commit(&delivery.topic, delivery.partition, next_offset),
            None => {
                debug!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Earlier unit still unacknowledged, holding commit"
                );
                Ok(())
            }
        }
    }

    fn withhold(&self, delivery: &DeliveryId) {
        self.tracker.withhold(delivery);
        warn!(
            partition = delivery.partition,
            offset = delivery.offset,
            "Delivery unit left unacknowledged, partition commits held at this offset"
        );
    }
}

/// Commits offsets on an rdkafka consumer
struct OffsetCommitter<'a> {
    consumer: &'a StreamConsumer,
}

impl OffsetSink for OffsetCommitter<'_> {
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), ConsumerError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(topic, partition, Offset::Offset(next_offset))?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }
}

/// Kafka consumer for model job messages
pub struct JobStreamConsumer {
    consumer: StreamConsumer,
    dispatcher: JobDispatcher,
}

impl JobStreamConsumer {
    pub fn new(config: &KafkaConfig, dispatcher: JobDispatcher) -> Result<Self, ConsumerError> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[&config.job_topic])?;

        info!(
            topic = %config.job_topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            dispatcher,
        })
    }

    /// Consume until cancelled. Units are handled one at a time.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        info!("Starting job stream consumer");

        let committer = TrackedAcknowledger::new(OffsetCommitter {
            consumer: &self.consumer,
        });
        let mut message_stream = self.consumer.stream();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Job stream consumer cancelled");
                    break;
                }
                next = message_stream.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    let delivery = DeliveryId {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                    };
                    let payload = message.payload().unwrap_or_default();
                    self.dispatcher
                        .on_message(&delivery, payload, &committer)
                        .await;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("jobs.kafka.errors").increment(1);
                }
                None => break,
            }
        }

        Ok(())
    }
}
