//! sharkwatch - shark alert gateway
//!
//! Resolves shark detections to the nearest monitored beach zone, persists
//! a notification and fans it out to every live session subscribed to that
//! zone.
//!
//! Module structure:
//! - `domain/` - Core types (Zone, DetectionEvent, Notification, geo)
//! - `io/` - External interfaces (HTTP API, push sessions, MQTT egress, journal)
//! - `services/` - Business logic (directory, resolver, notifier, fan-out, pipeline)
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use sharkwatch::infra::{broker, Config, Metrics};
use sharkwatch::io::{
    create_egress_channel, start_http_server, start_session_listener, ApiState, Journal,
    MqttPublisher,
};
use sharkwatch::services::{AlertPipeline, InMemoryNotificationStore, ZoneDirectory};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "+", env!("GIT_HASH"));

/// sharkwatch - geofenced shark alert fan-out
#[derive(Parser, Debug)]
#[command(name = "sharkwatch", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

/// Structured logging, level via RUST_LOG (default: info)
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn socket_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", host, port))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = Config::resolve_path(args.config);
    let config = Config::load_from_path(&config_path);
    init_tracing(config.log_json());

    info!(version = %VERSION, "sharkwatch starting");
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        http_port = %config.http_port(),
        sessions_port = %config.sessions_port(),
        alert_threshold = %config.alert_confidence_threshold(),
        resolve_timeout_ms = %config.resolve_timeout_ms(),
        store_timeout_ms = %config.store_timeout_ms(),
        journal = ?config.journal_file(),
        mqtt_egress = %config.mqtt_egress_enabled(),
        "config_loaded"
    );

    broker::start_embedded_broker(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Zone directory, seeded from config
    let zones = Arc::new(ZoneDirectory::new(config.zone_default_ttl()));
    let now = Utc::now();
    for seed in config.zone_seeds() {
        if let Err(e) = zones.create_at(seed.to_spec(now), now) {
            warn!(name = %seed.name, error = %e, "zone_seed_rejected");
        }
    }

    // Notification store, restored from the journal
    let store = Arc::new(InMemoryNotificationStore::new(config.journal_file().map(Journal::new)));
    if let Err(e) = store.restore_from_journal() {
        error!(error = %e, "journal_restore_failed");
    }

    // MQTT egress mirror (if enabled)
    let egress = if config.mqtt_egress_enabled() {
        let (egress_sender, egress_rx) =
            create_egress_channel(1000, config.site_id().to_string(), metrics.clone());

        let publisher = MqttPublisher::new(&config, egress_rx);
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });

        Some(egress_sender)
    } else {
        None
    };

    let (pipeline, presence_worker) =
        AlertPipeline::new(&config, zones, store, egress.clone(), metrics.clone());
    let pipeline = Arc::new(pipeline);
    tokio::spawn(presence_worker.run());

    // Periodic metrics log
    let metrics_pipeline = pipeline.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_pipeline.metrics_summary().log();
        }
    });

    // Periodic metrics snapshot to MQTT (separate from logging)
    if let Some(egress) = egress {
        let egress_pipeline = pipeline.clone();
        let egress_interval = config.mqtt_egress_metrics_interval_secs().max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(egress_interval));
            loop {
                interval.tick().await;
                egress.send_metrics(&egress_pipeline.metrics_summary());
            }
        });
    }

    // Push sessions
    if config.sessions_enabled() {
        let addr = socket_addr(config.http_bind_address(), config.sessions_port())?;
        let session_pipeline = pipeline.clone();
        let session_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_session_listener(addr, session_pipeline, session_shutdown).await {
                error!(error = %format!("{:#}", e), "session_listener_error");
            }
        });
    }

    // Shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // HTTP API runs on the main task until shutdown
    let addr = socket_addr(config.http_bind_address(), config.http_port())?;
    let state = Arc::new(ApiState::new(pipeline, config.site_id(), VERSION));
    start_http_server(addr, state, shutdown_rx).await?;

    info!("sharkwatch shutdown complete");
    Ok(())
}
