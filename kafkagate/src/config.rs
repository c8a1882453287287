// kafkagate/src/config.rs
//
// JSON configuration file parsing.
//
// Recognized top-level options:
//   listeners   — array of listener entries (see ListenerConfig)
//   brokers     — Kafka bootstrap list
//   topic       — default record destination (dumb/passthrough decoders)
//   response    — path to a file sent as a one-shot TCP greeting
//   blacklist   — array of IPv4 strings rejected at accept time
//   debug       — integer; > 0 raises log verbosity
//   rdkafka.*   — passed through to the producer configuration; keys under
//                 rdkafka.topic.* go to the topic-config side
//
// Environment variables override the file for every TLS/auth path, so
// credentials can be injected without editing the config:
//   HTTP_TLS_KEY_FILE, HTTP_TLS_CERT_FILE, HTTP_TLS_KEY_PASSWORD,
//   HTTP_TLS_CLIENTS_CA_FILE, HTTP_HTPASSWD_FILE

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing::warn;

use crate::blacklist::Blacklist;
use crate::decode::DecoderKind;

const RDKAFKA_PREFIX: &str = "rdkafka.";
const RDKAFKA_TOPIC_PREFIX: &str = "topic.";

const ENV_TLS_KEY: &str = "HTTP_TLS_KEY_FILE";
const ENV_TLS_CERT: &str = "HTTP_TLS_CERT_FILE";
const ENV_TLS_KEY_PASSWORD: &str = "HTTP_TLS_KEY_PASSWORD";
const ENV_TLS_CLIENTS_CA: &str = "HTTP_TLS_CLIENTS_CA_FILE";
const ENV_HTPASSWD: &str = "HTTP_HTPASSWD_FILE";

// ── Parsed configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub brokers:       Option<String>,
    pub default_topic: Option<String>,
    pub response_path: Option<PathBuf>,
    pub blacklist:     Blacklist,
    pub debug:         i64,
    pub listeners:     Vec<ListenerConfig>,
    /// rdkafka.* keys, producer side
    pub rdkafka:       BTreeMap<String, String>,
    /// rdkafka.topic.* keys
    pub rdkafka_topic: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Http,
    Tcp,
    Udp,
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Proto::Http => write!(f, "http"),
            Proto::Tcp  => write!(f, "tcp"),
            Proto::Udp  => write!(f, "udp"),
        }
    }
}

/// Socket listener event engine. All of these are served by the async
/// reactor; the value is accepted for config compatibility and recorded.
/// `thread_per_connection` is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadMode {
    Select,
    Poll,
    #[default]
    Epoll,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    pub proto:   Proto,
    pub port:    u16,
    pub decoder: DecoderKind,
    pub num_threads: usize,
    /// Listener-scoped destination topic, overriding the global `topic` for
    /// the dumb/passthrough decoders.
    pub topic:   Option<String>,
    pub socket:  SocketOptions,
    pub http:    HttpOptions,
}

impl ListenerConfig {
    pub fn key(&self) -> (Proto, u16) {
        (self.proto, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SocketOptions {
    pub mode:          ThreadMode,
    pub tcp_keepalive: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpOptions {
    pub tls_key_file:        Option<PathBuf>,
    pub tls_cert_file:       Option<PathBuf>,
    /// Key password, already resolved ("@path" values are read from the file).
    pub tls_key_password:    Option<String>,
    pub tls_clients_ca_file: Option<PathBuf>,
    pub htpasswd_file:       Option<PathBuf>,

    pub connection_memory_limit:  Option<usize>,
    pub connection_limit:         Option<usize>,
    pub connection_timeout:       Duration,
    pub per_ip_connection_limit:  Option<usize>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            tls_key_file:            None,
            tls_cert_file:           None,
            tls_key_password:        None,
            tls_clients_ca_file:     None,
            htpasswd_file:           None,
            connection_memory_limit: None,
            connection_limit:        None,
            connection_timeout:      DEFAULT_CONNECTION_TIMEOUT,
            per_ip_connection_limit: None,
        }
    }
}

impl HttpOptions {
    pub fn tls_enabled(&self) -> bool {
        self.tls_key_file.is_some() || self.tls_cert_file.is_some()
    }
}

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

// ── Raw (serde) layer ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    listeners: Vec<RawListener>,
    brokers:   Option<String>,
    topic:     Option<String>,
    response:  Option<String>,
    #[serde(default)]
    blacklist: Vec<String>,
    #[serde(default)]
    debug:     i64,
    #[serde(flatten)]
    extra:     BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawListener {
    proto: String,
    port:  u16,
    #[serde(default)]
    decode_as:     Option<String>,
    #[serde(default)]
    topic:         Option<String>,
    #[serde(default)]
    num_threads:   Option<usize>,
    #[serde(default)]
    mode:          Option<String>,
    #[serde(default)]
    tcp_keepalive: bool,

    // HTTP specific
    https_key_filename:        Option<String>,
    https_cert_filename:       Option<String>,
    https_key_password:        Option<String>,
    https_clients_ca_filename: Option<String>,
    htpasswd_filename:         Option<String>,
    connection_memory_limit:   Option<usize>,
    connection_limit:          Option<usize>,
    connection_timeout:        Option<u64>,
    per_ip_connection_limit:   Option<usize>,

    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

// ── Parsing ───────────────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let raw: RawConfig =
            serde_json::from_str(contents).context("config file is not valid JSON")?;

        let mut config = Config {
            brokers:       raw.brokers,
            default_topic: raw.topic,
            response_path: raw.response.map(PathBuf::from),
            debug:         raw.debug,
            ..Default::default()
        };

        for addr in &raw.blacklist {
            let parsed: Ipv4Addr = addr
                .parse()
                .with_context(|| format!("blacklist entry {addr:?} is not an IPv4 address"))?;
            config.blacklist.add(parsed);
        }

        for (key, value) in raw.extra {
            let Some(kafka_key) = key.strip_prefix(RDKAFKA_PREFIX) else {
                warn!("ignoring unknown config key {key:?}");
                continue;
            };
            let value = json_config_value(&key, &value)?;
            match kafka_key.strip_prefix(RDKAFKA_TOPIC_PREFIX) {
                Some(topic_key) => {
                    config.rdkafka_topic.insert(topic_key.to_string(), value);
                }
                None => {
                    config.rdkafka.insert(kafka_key.to_string(), value);
                }
            }
        }

        let mut seen = HashSet::new();
        for raw_listener in raw.listeners {
            let listener = parse_listener(raw_listener)?;
            if !seen.insert(listener.key()) {
                bail!(
                    "duplicate listener for {}:{}",
                    listener.proto,
                    listener.port
                );
            }
            config.listeners.push(listener);
        }

        Ok(config)
    }
}

/// rdkafka values may be strings or scalars; scalars are forwarded in their
/// string form, the same treatment kafkacat applies.
fn json_config_value(key: &str, value: &serde_json::Value) -> anyhow::Result<String> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        _ => bail!("{key} value must be a string in config file"),
    }
}

fn parse_listener(raw: RawListener) -> anyhow::Result<ListenerConfig> {
    let proto = match raw.proto.as_str() {
        "http" => Proto::Http,
        "tcp" => Proto::Tcp,
        "udp" => Proto::Udp,
        // Historical alias kept so old config files keep working.
        "ucp" => {
            warn!("listener proto \"ucp\" is deprecated, use \"udp\"");
            Proto::Udp
        }
        other => bail!("unknown listener proto {other:?}"),
    };

    if raw.port == 0 {
        bail!("listener port must be > 0");
    }

    for key in raw.extra.keys() {
        warn!("ignoring unknown listener key {key:?}");
    }

    let decoder = match raw.decode_as.as_deref() {
        None | Some("") | Some("dumb") => DecoderKind::Dumb,
        Some("passthrough") => DecoderKind::Passthrough,
        Some("streaming_json") => DecoderKind::StreamingJson,
        Some("streaming_json_xml") => DecoderKind::StreamingJsonFromXml,
        Some(other) => bail!("unknown decode_as value {other:?}"),
    };

    if proto != Proto::Http && decoder.is_streaming() {
        bail!(
            "decoder {} requires an http listener (socket listeners carry no URL to route on)",
            decoder.name()
        );
    }

    let mode = match raw.mode.as_deref() {
        None | Some("epoll") => ThreadMode::Epoll,
        Some("select") => ThreadMode::Select,
        Some("poll") => ThreadMode::Poll,
        Some("thread_per_connection") => {
            bail!("thread_per_connection mode is not supported; use select, poll or epoll")
        }
        Some(other) => bail!("unknown listener mode {other:?}"),
    };

    let num_threads = match raw.num_threads {
        Some(0) => {
            warn!("listener num_threads must be > 0, using 1");
            1
        }
        Some(n) => n,
        None => 1,
    };

    let http = HttpOptions {
        tls_key_file: env_or(ENV_TLS_KEY, raw.https_key_filename).map(PathBuf::from),
        tls_cert_file: env_or(ENV_TLS_CERT, raw.https_cert_filename).map(PathBuf::from),
        tls_key_password: env_or(ENV_TLS_KEY_PASSWORD, raw.https_key_password)
            .map(|v| resolve_secret(&v))
            .transpose()?,
        tls_clients_ca_file: env_or(ENV_TLS_CLIENTS_CA, raw.https_clients_ca_filename)
            .map(PathBuf::from),
        htpasswd_file: env_or(ENV_HTPASSWD, raw.htpasswd_filename).map(PathBuf::from),
        connection_memory_limit: raw.connection_memory_limit,
        connection_limit: raw.connection_limit,
        connection_timeout: raw
            .connection_timeout
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
        per_ip_connection_limit: raw.per_ip_connection_limit,
    };

    if http.tls_key_file.is_some() != http.tls_cert_file.is_some() {
        bail!("https_key_filename and https_cert_filename must be configured together");
    }

    Ok(ListenerConfig {
        proto,
        port: raw.port,
        decoder,
        num_threads,
        topic: raw.topic,
        socket: SocketOptions {
            mode,
            tcp_keepalive: raw.tcp_keepalive,
        },
        http,
    })
}

fn env_or(env_name: &str, file_value: Option<String>) -> Option<String> {
    std::env::var(env_name).ok().or(file_value)
}

/// Secrets may be given inline or as "@path" pointing to a file holding the
/// value (trailing newline stripped).
fn resolve_secret(value: &str) -> anyhow::Result<String> {
    match value.strip_prefix('@') {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read secret file {path}"))?;
            Ok(contents.trim_end_matches('\n').to_string())
        }
        None => Ok(value.to_string()),
    }
}
