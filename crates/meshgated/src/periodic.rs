//! Periodic maintenance tasks that don't belong to any single pipeline
//! stage: coalesced broadcast flush, session heartbeat eviction, and the
//! daily retention sweep (§4.K).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use meshgate_core::broadcast::Broadcaster;
use meshgate_store::WriterCommand;

pub async fn run_broadcast_coalesce(
    broadcaster: Arc<Broadcaster>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => broadcaster.flush_coalesced(),
            _ = shutdown.recv() => break,
        }
    }
}

pub async fn run_heartbeat_sweep(
    broadcaster: Arc<Broadcaster>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => broadcaster.heartbeat_sweep(),
            _ = shutdown.recv() => break,
        }
    }
}

pub async fn run_retention_sweep(
    writer_tx: mpsc::Sender<WriterCommand>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if writer_tx.send(WriterCommand::RetentionSweep).await.is_err() {
                    break;
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
