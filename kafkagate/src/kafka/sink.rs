// kafkagate/src/kafka/sink.rs
//
// Kafka producer sink.
//
// Owns the process-wide producer handle. Sessions hand in record batches;
// every record carries a clone of its payload handle as the delivery opaque,
// and the delivery callback drops that clone, so a chunk buffer shared by
// several records is freed exactly when the last of them is delivered (or
// permanently fails). Production errors are logged at most once per five
// minutes per error kind.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientContext;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::DecoderError;
use crate::kafka::batch::MessageBatch;
use crate::kafka::topics::TopicHandle;
use crate::util::LogThrottle;

/// Producer context whose delivery opaque is the record's payload handle.
/// Dropping it in the delivery callback releases the shared chunk reference.
struct DeliveryContext {
    throttle: Arc<LogThrottle>,
}

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<Bytes>;

    fn delivery(&self, result: &DeliveryResult<'_>, payload: Self::DeliveryOpaque) {
        if let Err((err, _)) = result {
            if self.throttle.should_log(&format!("delivery:{err}")) {
                error!("message delivery failed: {err}");
            }
        } else {
            trace!("message delivered ({} bytes)", payload.len());
        }
        // The payload handle drops here; the last drop frees the chunk.
    }
}

/// Map a producer error to a decoder error kind.
fn map_kafka_error(err: &KafkaError) -> DecoderError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::QueueFull) => DecoderError::BufferFull,
        Some(RDKafkaErrorCode::MessageSizeTooLarge) => DecoderError::MsgTooLarge,
        Some(RDKafkaErrorCode::UnknownPartition) => DecoderError::UnknownPartition,
        Some(RDKafkaErrorCode::UnknownTopic)
        | Some(RDKafkaErrorCode::UnknownTopicOrPartition) => DecoderError::UnknownTopic,
        _ => DecoderError::GenericError,
    }
}

/// The Kafka sink. Cheap to share behind an Arc; the underlying producer is
/// internally thread-safe and polled by its own thread.
pub struct KafkaSink {
    producer: ThreadedProducer<DeliveryContext>,
    throttle: Arc<LogThrottle>,
}

impl KafkaSink {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let brokers = config
            .brokers
            .as_deref()
            .context("no kafka brokers configured")?;

        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", brokers);
        for (key, value) in &config.rdkafka {
            client_config.set(key, value);
        }
        // librdkafka folds topic-level properties into the default topic
        // configuration when set on the global handle.
        for (key, value) in &config.rdkafka_topic {
            client_config.set(key, value);
        }

        let throttle = Arc::new(LogThrottle::default());
        let producer: ThreadedProducer<DeliveryContext> = client_config
            .create_with_context(DeliveryContext {
                throttle: throttle.clone(),
            })
            .context("cannot create kafka producer")?;

        info!("kafka producer configured, brokers={brokers}");
        Ok(Self { producer, throttle })
    }

    /// Queue a whole batch on `topic`. Returns how many records the producer
    /// accepted; rejected records are inspected individually and logged with
    /// per-error-kind throttling.
    pub fn produce_batch(&self, topic: &TopicHandle, batch: MessageBatch) -> usize {
        let mut queued = 0;
        for payload in batch.into_records() {
            match self.enqueue(topic.name(), &payload) {
                Ok(()) => queued += 1,
                Err(err) => {
                    if self.throttle.should_log(&format!("produce:{err:?}")) {
                        error!("can't produce to topic {}: {err}", topic.name());
                    }
                }
            }
        }
        queued
    }

    /// Queue a single record, mapping the failure to a decoder error.
    pub fn produce_record(&self, topic_name: &str, payload: Bytes) -> Result<(), DecoderError> {
        self.enqueue(topic_name, &payload).map_err(|err| {
            let mapped = map_kafka_error(&err);
            if self.throttle.should_log(&format!("produce:{mapped:?}")) {
                error!("can't produce to topic {topic_name}: {err}");
            }
            mapped
        })
    }

    fn enqueue(&self, topic_name: &str, payload: &Bytes) -> Result<(), KafkaError> {
        let record = BaseRecord::<(), [u8], _>::with_opaque_to(
            topic_name,
            Box::new(payload.clone()),
        )
        .payload(payload.as_ref());

        // The failed record (and its opaque payload handle) drops right here.
        self.producer.send(record).map_err(|(err, _record)| err)
    }

    /// Decoder error for a batch that was only partially accepted.
    pub fn partial_batch_error(&self) -> DecoderError {
        DecoderError::BufferFull
    }

    pub fn in_flight(&self) -> i32 {
        self.producer.in_flight_count()
    }

    /// Drain the outbound queue before process exit.
    pub fn shutdown(&self, timeout: Duration) {
        info!("waiting for kafka producer to drain");
        if let Err(err) = self.producer.flush(timeout) {
            warn!("kafka flush did not complete: {err}");
        }
        let remaining = self.producer.in_flight_count();
        if remaining > 0 {
            warn!("{remaining} messages still in flight at shutdown");
        } else {
            debug!("kafka producer drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::topics::TopicRegistry;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;
    use std::time::Instant;

    fn mock_sink() -> (MockCluster<'static, DefaultProducerContext>, KafkaSink) {
        let cluster = MockCluster::new(1).expect("failed to create mock cluster");
        let config = Config {
            brokers: Some(cluster.bootstrap_servers()),
            ..Default::default()
        };
        let sink = KafkaSink::new(&config).expect("failed to create sink");
        (cluster, sink)
    }

    #[test]
    fn error_mapping_is_the_corrected_table() {
        let cases = [
            (RDKafkaErrorCode::QueueFull, DecoderError::BufferFull),
            (RDKafkaErrorCode::MessageSizeTooLarge, DecoderError::MsgTooLarge),
            (RDKafkaErrorCode::UnknownPartition, DecoderError::UnknownPartition),
            (RDKafkaErrorCode::UnknownTopic, DecoderError::UnknownTopic),
            (
                RDKafkaErrorCode::UnknownTopicOrPartition,
                DecoderError::UnknownTopic,
            ),
            (RDKafkaErrorCode::BrokerNotAvailable, DecoderError::GenericError),
        ];
        for (code, expected) in cases {
            let err = KafkaError::MessageProduction(code);
            assert_eq!(map_kafka_error(&err), expected, "{code:?}");
        }
    }

    #[test]
    fn missing_brokers_is_a_startup_error() {
        let err = KafkaSink::new(&Config::default()).unwrap_err();
        assert!(err.to_string().contains("brokers"));
    }

    #[test]
    fn batch_is_accepted_against_mock_cluster() {
        let (_cluster, sink) = mock_sink();
        let registry = TopicRegistry::new();
        let topic = registry.get("events", Instant::now()).unwrap();

        let chunk = Bytes::from(b"{\"a\":1}{\"a\":2}".to_vec());
        let mut batch = MessageBatch::new();
        batch.push(chunk.slice(0..7));
        batch.push(chunk.slice(7..14));

        let queued = sink.produce_batch(&topic, batch);
        assert_eq!(queued, 2);
        sink.shutdown(Duration::from_secs(10));
    }

    #[test]
    fn delivery_releases_the_shared_chunk() {
        let (_cluster, sink) = mock_sink();
        let registry = TopicRegistry::new();
        let topic = registry.get("events", Instant::now()).unwrap();

        let chunk = Bytes::from(b"{\"a\":1}{\"a\":2}".to_vec());
        let mut batch = MessageBatch::new();
        batch.push(chunk.slice(0..7));
        batch.push(chunk.slice(7..14));
        assert_eq!(sink.produce_batch(&topic, batch), 2);

        sink.shutdown(Duration::from_secs(10));
        // All in-flight clones are gone after delivery; ours is the last one.
        assert!(chunk.is_unique());
    }

    #[test]
    fn single_record_roundtrip() {
        let (_cluster, sink) = mock_sink();
        let payload = Bytes::from_static(b"line one");
        sink.produce_record("raw", payload).unwrap();
        sink.shutdown(Duration::from_secs(10));
    }
}
