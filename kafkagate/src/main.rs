// kafkagate/src/main.rs
//
// kafkagate — streaming network-to-Kafka ingest gateway.
//
// Accepts event payloads over HTTP/HTTPS (TCP and UDP as fallbacks), splits
// the incoming byte stream into one Kafka record per top-level JSON object
// (or XML element) without buffering whole requests, and produces them with
// backpressure-aware batching.
//
// Usage:
//   kafkagate config.json
//
// Signals:
//   SIGINT / SIGTERM — graceful drain and exit 0
//   SIGHUP           — reread the config file and reload listeners in place

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kafkagate::app::App;
use kafkagate::config::Config;
use kafkagate::listener::ListenerSet;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "kafkagate",
    about   = "Streaming network-to-Kafka ingest gateway",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Path to the JSON configuration file
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("kafkagate: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config)?;

    let default_level = if config.debug > 0 {
        "kafkagate=debug"
    } else {
        "kafkagate=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.parse()?))
        .compact()
        .init();

    if cli.check {
        println!("configuration OK: {} listeners", config.listeners.len());
        return Ok(());
    }

    let app = App::new(&config)?;
    let mut listeners = ListenerSet::new();
    listeners
        .start(&app, &config.listeners)
        .await
        .context("cannot start listeners")?;
    info!(
        "kafkagate {} running, {} listeners",
        env!("CARGO_PKG_VERSION"),
        listeners.len()
    );

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading listeners");
                match Config::load(&cli.config) {
                    Ok(new_config) => {
                        if new_config.brokers != config.brokers {
                            error!("brokers changed in config; a restart is required for that");
                        }
                        listeners.reload(&app, &new_config.listeners).await;
                    }
                    Err(err) => error!("reload failed, keeping current listeners: {err:#}"),
                }
            }
        }
    }

    info!("shutting down");
    listeners.shutdown().await;
    app.shutdown();
    Ok(())
}
