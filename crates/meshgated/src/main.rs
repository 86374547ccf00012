//! meshgated — mesh-network ingestion and fan-out daemon.
//!
//! Startup order: config → tracing → schema/writer → broker connection →
//! spawn one task per pipeline stage → select over every task plus the
//! shutdown signal, draining bounded by a timeout (§4.K, §5).

mod broker;
mod periodic;
mod queue_drain;
mod snapshot;
mod supervisor;

use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use meshgate_core::broadcast::Broadcaster;
use meshgate_core::config::{ConfigError, MeshgateConfig};
use meshgate_core::metrics::Metrics;
use meshgate_ingest::channel_index::InMemoryChannelIndex;
use meshgate_ingest::{Classifier, KeyRing, PriorityQueue};
use meshgate_store::{BatchWriter, WriterCommand};

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

fn exit_config_error(err: ConfigError) -> ExitCode {
    tracing::error!(error = %err, "fatal configuration error");
    ExitCode::from(1)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match MeshgateConfig::load() {
        Ok(c) => c,
        Err(err) => return exit_config_error(err),
    };

    tracing::info!(broker = %config.broker.url, db = ?config.storage.database_path, "meshgated starting");

    let metrics = Arc::new(Metrics::new());
    let channel_store = InMemoryChannelIndex::new();
    let keys = KeyRing::new();
    let classifier = Classifier::new(channel_store.clone(), keys, metrics.clone());

    let database_path = config.storage.database_path.to_string_lossy().to_string();

    let writer = match BatchWriter::open(
        &database_path,
        config.ingest.batch_max_size,
        Duration::from_millis(config.ingest.batch_max_wait_ms),
        config.storage.retention_days as i64,
        metrics.clone(),
    ) {
        Ok(w) => w,
        Err(err) => {
            tracing::error!(error = %err, "failed to open database");
            return ExitCode::from(2);
        }
    };
    let writer_stats = writer.stats_handle();

    let snapshot_provider = match snapshot::SqliteSnapshotProvider::open(
        &database_path,
        config.api.broadcaster_snapshot_max_nodes,
        config.api.broadcaster_snapshot_max_events,
    ) {
        Ok(p) => Arc::new(p),
        Err(err) => {
            tracing::error!(error = %err, "failed to open snapshot connection");
            return ExitCode::from(3);
        }
    };

    let queue = Arc::new(Mutex::new(PriorityQueue::new(config.ingest.max_queue_capacity)));
    let broadcaster = Arc::new(Broadcaster::new());

    let (writer_tx, writer_rx) = mpsc::channel::<WriterCommand>(1024);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let (broker_handle, eventloop) = match broker::connect(&config.broker) {
        Ok(pair) => pair,
        Err(err) => {
            tracing::error!(error = %err, "failed to build broker client");
            return ExitCode::from(4);
        }
    };

    let sup = Arc::new(supervisor::Supervisor {
        queue: queue.clone(),
        queue_capacity: config.ingest.max_queue_capacity,
        broker_connected: broker_handle.connected.clone(),
        last_message_at: broker_handle.last_message_at.clone(),
        writer_stats,
    });

    let api_state = meshgate_api::ApiState {
        broadcaster: broadcaster.clone(),
        snapshot: snapshot_provider,
        metrics: metrics.clone(),
        health: sup,
        snapshot_max_nodes: config.api.broadcaster_snapshot_max_nodes,
        snapshot_max_events: config.api.broadcaster_snapshot_max_events,
    };

    let api_task = tokio::spawn(meshgate_api::serve(api_state, config.api.port));

    let writer_task = tokio::spawn(meshgate_store::run(
        writer,
        writer_rx,
        shutdown_tx.subscribe(),
        SHUTDOWN_DRAIN_TIMEOUT,
    ));

    let drain_task = tokio::spawn(queue_drain::run(
        queue.clone(),
        writer_tx.clone(),
        broadcaster.clone(),
        metrics.clone(),
        shutdown_tx.subscribe(),
    ));

    let broker_task = tokio::spawn(broker::run_receive_loop(
        eventloop,
        broker_handle.client.clone(),
        config.broker.topic_pattern.clone(),
        Duration::from_millis(config.broker.reconnect_period_ms),
        channel_store,
        classifier,
        queue.clone(),
        broadcaster.clone(),
        metrics.clone(),
        broker_handle.connected.clone(),
        broker_handle.last_message_at.clone(),
        Duration::from_millis(config.ingest.dedupe_window_ms),
        config.ingest.rate_limit_window_ms,
        config.ingest.rate_limit_max_per_window,
        shutdown_tx.subscribe(),
    ));

    let coalesce_task = tokio::spawn(periodic::run_broadcast_coalesce(
        broadcaster.clone(),
        Duration::from_millis(250),
        shutdown_tx.subscribe(),
    ));

    let heartbeat_task = tokio::spawn(periodic::run_heartbeat_sweep(
        broadcaster.clone(),
        Duration::from_millis(config.api.broadcaster_heartbeat_ms),
        shutdown_tx.subscribe(),
    ));

    let retention_task = tokio::spawn(periodic::run_retention_sweep(
        writer_tx,
        Duration::from_secs(24 * 60 * 60),
        shutdown_tx.subscribe(),
    ));

    let shutdown_signal = async {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        #[cfg(unix)]
        let terminate = async {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            sigterm.recv().await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
    };

    tokio::select! {
        _ = shutdown_signal => {
            tracing::info!("shutdown signal received, draining");
        }
        r = api_task => tracing::error!(result = ?r, "api task exited"),
        r = broker_task => tracing::error!(result = ?r, "broker task exited"),
        r = writer_task => tracing::error!(result = ?r, "writer task exited"),
        r = drain_task => tracing::error!(result = ?r, "queue-drain task exited"),
        r = coalesce_task => tracing::error!(result = ?r, "coalesce task exited"),
        r = heartbeat_task => tracing::error!(result = ?r, "heartbeat task exited"),
        r = retention_task => tracing::error!(result = ?r, "retention task exited"),
    }

    let _ = shutdown_tx.send(());
    broadcaster.shutdown();
    tokio::time::sleep(Duration::from_millis(200)).await;

    ExitCode::SUCCESS
}
