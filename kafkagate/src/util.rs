// kafkagate/src/util.rs
//
// Small shared helpers: file slurping for config-referenced files and a
// per-key log throttle so repeated failures don't saturate the log output.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use dashmap::DashMap;

/// Read a whole file into an immutable byte buffer.
pub fn read_file_to_bytes(path: &Path) -> anyhow::Result<Bytes> {
    let contents = std::fs::read(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    Ok(Bytes::from(contents))
}

// ── Log throttle ──────────────────────────────────────────────────────────────

/// Default throttle window: one warning per key every five minutes.
pub const WARN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Rate limiter for log lines keyed by an arbitrary string (client address,
/// error kind, ...). `should_log` returns true at most once per window per key.
pub struct LogThrottle {
    window: Duration,
    last:   DashMap<String, Instant>,
}

impl LogThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: DashMap::new(),
        }
    }

    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut fire = false;
        self.last
            .entry(key.to_string())
            .and_modify(|t| {
                if now.duration_since(*t) >= self.window {
                    *t = now;
                    fire = true;
                }
            })
            .or_insert_with(|| {
                fire = true;
                now
            });
        fire
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(WARN_INTERVAL)
    }
}
