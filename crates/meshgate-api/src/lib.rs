//! meshgate-api — the fan-out's externally-visible surface (§6).
//!
//! The dashboard client connection is a single websocket endpoint, not a
//! REST surface: read-only queries over stored state are deliberately out
//! of core scope (SPEC_FULL §1). What this crate does own is the health
//! endpoint §7 requires as the ingestion pipeline's user-visible error
//! surface, alongside the websocket upgrade.

pub mod health;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use meshgate_core::broadcast::{Broadcaster, SnapshotProvider};
use meshgate_core::metrics::Metrics;

pub use health::HealthStatus;

/// Shared state handed to every handler — the teacher's `ApiState`
/// composition (one struct, every shared handle, `Clone` via `Arc` fields)
/// generalized from peer/session/trust registries to the fan-out's own
/// shared handles.
#[derive(Clone)]
pub struct ApiState {
    pub broadcaster: Arc<Broadcaster>,
    pub snapshot: Arc<dyn SnapshotProvider>,
    pub metrics: Arc<Metrics>,
    pub health: Arc<dyn health::HealthSource>,
    pub snapshot_max_nodes: usize,
    pub snapshot_max_events: usize,
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws::upgrade))
        .route("/healthz", get(health::handle_health))
        .route("/metrics", get(health::handle_metrics))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "fan-out API listening");
    axum::serve(listener, app).await?;
    Ok(())
}
