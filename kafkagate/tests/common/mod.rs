// Shared fixtures for the integration tests: a gateway App wired to a mock
// Kafka cluster, a free-port helper and a consumer that reads records back.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::mocking::MockCluster;
use rdkafka::producer::DefaultProducerContext;
use rdkafka::{ClientConfig, Message};

use kafkagate::app::App;
use kafkagate::config::Config;

pub struct Fixture {
    pub cluster: MockCluster<'static, DefaultProducerContext>,
    pub app:     Arc<App>,
}

pub fn fixture_with(config_extra: impl FnOnce(&mut Config)) -> Fixture {
    let cluster = MockCluster::new(1).expect("failed to create mock cluster");
    let mut config = Config {
        brokers: Some(cluster.bootstrap_servers()),
        ..Default::default()
    };
    config_extra(&mut config);
    let app = App::new(&config).expect("failed to build app");
    Fixture { cluster, app }
}

pub fn fixture() -> Fixture {
    fixture_with(|_| {})
}

/// Reserve an ephemeral port. Tiny race with other tests, good enough here.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    listener.local_addr().expect("local addr").port()
}

pub fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Read up to `expected` record payloads from `topic`, giving up at the
/// deadline so a missing record fails the assertion instead of hanging.
pub fn consume(fixture: &Fixture, topic: &str, expected: usize) -> Vec<Vec<u8>> {
    let consumer: BaseConsumer = ClientConfig::new()
        .set("bootstrap.servers", fixture.cluster.bootstrap_servers())
        .set("group.id", "kafkagate-test")
        .set("auto.offset.reset", "earliest")
        .create()
        .expect("failed to create consumer");
    consumer.subscribe(&[topic]).expect("subscribe");

    let mut collected = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(20);
    while collected.len() < expected && Instant::now() < deadline {
        if let Some(Ok(message)) = consumer.poll(Duration::from_millis(250)) {
            collected.push(message.payload().unwrap_or_default().to_vec());
        }
    }
    collected
}

/// Assert that no record arrives on `topic` within a short window.
pub fn assert_no_records(fixture: &Fixture, topic: &str) {
    let records = consume_for(fixture, topic, Duration::from_secs(2));
    assert!(records.is_empty(), "unexpected records: {records:?}");
}

fn consume_for(fixture: &Fixture, topic: &str, window: Duration) -> Vec<Vec<u8>> {
    let consumer: BaseConsumer = ClientConfig::new()
        .set("bootstrap.servers", fixture.cluster.bootstrap_servers())
        .set("group.id", "kafkagate-test-none")
        .set("auto.offset.reset", "earliest")
        .create()
        .expect("failed to create consumer");
    consumer.subscribe(&[topic]).expect("subscribe");

    let mut collected = Vec::new();
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        if let Some(Ok(message)) = consumer.poll(Duration::from_millis(250)) {
            collected.push(message.payload().unwrap_or_default().to_vec());
        }
    }
    collected
}
