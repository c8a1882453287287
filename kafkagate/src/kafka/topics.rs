// kafkagate/src/kafka/topics.rs
//
// Pool of producer topic handles keyed by effective topic name.
//
// Handles are created lazily on first use, kept hot in an LRU order and
// evicted once idle for longer than the TTL. Sessions hold a strong reference
// for their whole lifetime; the registry holds one more while the handle is
// cached, so an evicted handle stays valid for every session still using it
// and dies exactly when the last reference drops.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

/// Topics idle longer than this are swept from the registry.
pub const TOPIC_LIVE_TIME: Duration = Duration::from_secs(15 * 60);

/// Kafka's limit on topic name length.
const MAX_TOPIC_NAME_LEN: usize = 249;

#[derive(Debug, thiserror::Error)]
pub enum TopicError {
    #[error("invalid topic name {0:?}")]
    InvalidName(String),
}

/// Refcounted wrapper around a producer topic. The producer addresses topics
/// by name per record, so the handle owns the validated, interned name; the
/// Arc it travels in is the reference count.
#[derive(Debug)]
pub struct TopicHandle {
    name: String,
}

impl TopicHandle {
    fn create(name: &str) -> Result<Self, TopicError> {
        if !valid_topic_name(name) {
            return Err(TopicError::InvalidName(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn valid_topic_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_TOPIC_NAME_LEN
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

struct Entry {
    handle:    Arc<TopicHandle>,
    last_used: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Names in least-recently-used-first order. Kept in sync with `entries`.
    lru:     VecDeque<String>,
}

impl Inner {
    fn touch(&mut self, name: &str, now: Instant) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.last_used = now;
        }
        if let Some(pos) = self.lru.iter().position(|n| n == name) {
            self.lru.remove(pos);
        }
        self.lru.push_back(name.to_string());
    }

    fn evict_older_than(&mut self, deadline: Instant) {
        while let Some(name) = self.lru.front() {
            let stale = self
                .entries
                .get(name)
                .map(|e| e.last_used < deadline)
                .unwrap_or(true);
            if !stale {
                break;
            }
            let name = self.lru.pop_front().unwrap();
            if self.entries.remove(&name).is_some() {
                debug!("evicted idle topic handle {name}");
            }
        }
    }
}

/// Thread-safe topic handle registry.
pub struct TopicRegistry {
    inner: RwLock<Inner>,
    ttl:   Duration,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::with_ttl(TOPIC_LIVE_TIME)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            ttl,
        }
    }

    /// Fetch (or lazily create) the handle for `name`, refreshing its
    /// last-use time and sweeping handles idle beyond the TTL.
    pub fn get(&self, name: &str, now: Instant) -> Result<Arc<TopicHandle>, TopicError> {
        let found = {
            let inner = self.inner.read();
            inner.entries.get(name).map(|e| e.handle.clone())
        };

        let handle = match found {
            Some(handle) => handle,
            None => {
                // Construct outside any lock; creation may be slow or fail.
                let fresh = Arc::new(TopicHandle::create(name)?);
                let mut inner = self.inner.write();
                match inner.entries.get(name) {
                    // A concurrent insertion won; drop the fresh handle.
                    Some(existing) => existing.handle.clone(),
                    None => {
                        inner.entries.insert(
                            name.to_string(),
                            Entry {
                                handle: fresh.clone(),
                                last_used: now,
                            },
                        );
                        inner.lru.push_back(name.to_string());
                        fresh
                    }
                }
            }
        };

        let mut inner = self.inner.write();
        inner.touch(name, now);
        if let Some(deadline) = now.checked_sub(self.ttl) {
            inner.evict_older_than(deadline);
        }

        Ok(handle)
    }

    /// Number of currently cached handles (external references not counted).
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the registry's reference on every cached handle. Outstanding
    /// external references keep their handles alive until released.
    pub fn shutdown(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.lru.clear();
    }
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}
