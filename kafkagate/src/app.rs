// kafkagate/src/app.rs
//
// Root application value.
//
// Everything listeners and sessions share lives here and travels by Arc:
// the Kafka sink, the topic registry, the default topic, the accept-time
// blacklist, the one-shot TCP greeting and the log throttle. There is no
// process-wide mutable state; reload swaps listeners, not the App.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::kafka::{KafkaSink, TopicRegistry};
use crate::util::{read_file_to_bytes, LogThrottle};

/// How long shutdown waits for the producer queue to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct App {
    pub sink:          Arc<KafkaSink>,
    pub topics:        TopicRegistry,
    pub default_topic: Option<String>,
    pub blacklist:     Blacklist,
    pub greeting:      Option<Bytes>,
    pub throttle:      LogThrottle,
}

impl App {
    pub fn new(config: &Config) -> anyhow::Result<Arc<Self>> {
        let sink = Arc::new(KafkaSink::new(config)?);
        let greeting = config
            .response_path
            .as_deref()
            .map(read_file_to_bytes)
            .transpose()?;

        Ok(Arc::new(App {
            sink,
            topics: TopicRegistry::new(),
            default_topic: config.default_topic.clone(),
            blacklist: config.blacklist.clone(),
            greeting,
            throttle: LogThrottle::default(),
        }))
    }

    /// Release cached topic handles and drain the producer.
    pub fn shutdown(&self) {
        self.topics.shutdown();
        self.sink.shutdown(DRAIN_TIMEOUT);
    }
}
