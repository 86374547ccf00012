//! Queue-drain task (§4.K) — the single consumer of the shared priority
//! queue. Ticks every 500ms, dequeues up to 100 events in strict priority
//! order, and hands each to both the writer (persistence) and the
//! broadcaster (fan-out) without blocking on either.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use meshgate_core::broadcast::Broadcaster;
use meshgate_core::metrics::Metrics;
use meshgate_ingest::PriorityQueue;
use meshgate_store::WriterCommand;

pub const DRAIN_INTERVAL: Duration = Duration::from_millis(500);
pub const DRAIN_BATCH: usize = 100;

pub async fn run(
    queue: Arc<Mutex<PriorityQueue>>,
    writer_tx: mpsc::Sender<WriterCommand>,
    broadcaster: Arc<Broadcaster>,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(DRAIN_INTERVAL);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                drain_once(&queue, &writer_tx, &broadcaster, &metrics).await;
            }
            _ = shutdown.recv() => {
                tracing::info!("queue-drain task stopping, draining remaining events");
                // Final drain pass; the supervisor bounds total shutdown time.
                loop {
                    let drained = drain_once(&queue, &writer_tx, &broadcaster, &metrics).await;
                    if drained == 0 {
                        break;
                    }
                }
                break;
            }
        }
    }
}

async fn drain_once(
    queue: &Arc<Mutex<PriorityQueue>>,
    writer_tx: &mpsc::Sender<WriterCommand>,
    broadcaster: &Arc<Broadcaster>,
    metrics: &Arc<Metrics>,
) -> usize {
    let batch = {
        let mut q = queue.lock().unwrap();
        q.dequeue(DRAIN_BATCH)
    };
    let drained = batch.len();
    for queued in batch {
        broadcaster.dispatch(queued.event.clone());
        if writer_tx.send(WriterCommand::Event(queued.event)).await.is_err() {
            tracing::warn!(queue_id = %queued.queue_id, "writer channel closed, dropping event");
        } else {
            Metrics::incr(&metrics.admitted);
        }
    }
    drained
}
