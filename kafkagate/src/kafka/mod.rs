// kafkagate/src/kafka/mod.rs
//
// Kafka-facing side of the gateway: the producer sink, the topic handle
// registry and the pending record batch type.

pub mod batch;
pub mod sink;
pub mod topics;

pub use batch::MessageBatch;
pub use sink::KafkaSink;
pub use topics::{TopicHandle, TopicRegistry};
