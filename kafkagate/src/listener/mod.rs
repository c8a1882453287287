// kafkagate/src/listener/mod.rs
//
// Listener registry.
//
// Holds every running listener keyed by (proto, port) — exactly one per key.
// Reload diffs the desired config against the running set: unchanged entries
// keep their listener untouched (no dropped connections), removed or changed
// entries are cancelled and awaited, added entries are spawned.

pub mod http;
pub mod socket;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::app::App;
use crate::config::{ListenerConfig, Proto};

pub struct Listener {
    config: ListenerConfig,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Listener {
    pub async fn spawn(app: Arc<App>, config: ListenerConfig) -> anyhow::Result<Listener> {
        let cancel = CancellationToken::new();
        let handle = match config.proto {
            Proto::Http => http::spawn(app, config.clone(), cancel.clone()).await?,
            Proto::Tcp => socket::spawn_tcp(app, config.clone(), cancel.clone()).await?,
            Proto::Udp => socket::spawn_udp(app, config.clone(), cancel.clone()).await?,
        };
        Ok(Listener {
            config,
            cancel,
            handle,
        })
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

#[derive(Default)]
pub struct ListenerSet {
    listeners: HashMap<(Proto, u16), Listener>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Start every configured listener; any failure is a startup error.
    pub async fn start(&mut self, app: &Arc<App>, configs: &[ListenerConfig]) -> anyhow::Result<()> {
        for config in configs {
            let listener = Listener::spawn(app.clone(), config.clone()).await?;
            self.listeners.insert(config.key(), listener);
        }
        Ok(())
    }

    /// Apply a new listener set in place. Reloading an identical config keeps
    /// every listener (and its connections) untouched.
    pub async fn reload(&mut self, app: &Arc<App>, configs: &[ListenerConfig]) {
        let desired: HashMap<(Proto, u16), &ListenerConfig> =
            configs.iter().map(|c| (c.key(), c)).collect();

        // Stop listeners that vanished or changed.
        let stale: Vec<(Proto, u16)> = self
            .listeners
            .iter()
            .filter(|(key, listener)| {
                desired
                    .get(key)
                    .map(|config| **config != listener.config)
                    .unwrap_or(true)
            })
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            if let Some(listener) = self.listeners.remove(&key) {
                info!("stopping {} listener on port {}", key.0, key.1);
                listener.shutdown().await;
            }
        }

        // Spawn the new ones.
        let running: HashSet<(Proto, u16)> = self.listeners.keys().copied().collect();
        for (key, config) in desired {
            if running.contains(&key) {
                continue;
            }
            match Listener::spawn(app.clone(), (*config).clone()).await {
                Ok(listener) => {
                    self.listeners.insert(key, listener);
                }
                Err(err) => {
                    error!("cannot start {} listener on port {}: {err:#}", key.0, key.1);
                }
            }
        }

        info!("listener reload complete, {} active", self.listeners.len());
    }

    pub async fn shutdown(&mut self) {
        for (_, listener) in self.listeners.drain() {
            listener.shutdown().await;
        }
    }
}
