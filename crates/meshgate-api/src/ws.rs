//! Websocket handler for the single dashboard-facing connection (§6).
//!
//! One task per session reads `ClientFrame`s off the socket and mutates
//! the session's registration in `Broadcaster`; a second task drains the
//! session's outbox (built by `Broadcaster::register`) and writes frames
//! back. Neither task touches the database — `ApiState::snapshot` is the
//! only read path into storage, and it's called once per
//! connect/`request_snapshot`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};

use meshgate_core::broadcast::{ClientFrame, SnapshotData};

use crate::ApiState;

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

fn truncated_snapshot(data: SnapshotData, max_nodes: usize, max_events: usize) -> SnapshotData {
    SnapshotData {
        nodes: data.nodes.into_iter().take(max_nodes).collect(),
        positions: data.positions.into_iter().take(max_events).collect(),
        recent_messages: data.recent_messages.into_iter().take(max_events).collect(),
    }
}

async fn handle_session(socket: WebSocket, state: ApiState) {
    let (mut sink, mut stream) = socket.split();
    let mut outbox = state.broadcaster.register();
    let session_id = outbox.session_id;

    let initial = truncated_snapshot(
        state.snapshot.build_snapshot(),
        state.snapshot_max_nodes,
        state.snapshot_max_events,
    );
    state.broadcaster.send_snapshot(session_id, initial);

    let mut writer = tokio::spawn(async move {
        while let Some((frame, byte_len)) = outbox.rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
            outbox.ack_sent(byte_len);
        }
    });

    let reader_state = state.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            let text = match msg {
                Message::Text(t) => t.to_string(),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
            };
            reader_state.broadcaster.touch(session_id);
            match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Ping) => {}
                Ok(ClientFrame::Subscribe { filter }) => {
                    reader_state.broadcaster.set_filter(session_id, filter);
                }
                Ok(ClientFrame::Unsubscribe) => {
                    reader_state.broadcaster.clear_filter(session_id);
                }
                Ok(ClientFrame::RequestSnapshot) => {
                    let snap = truncated_snapshot(
                        reader_state.snapshot.build_snapshot(),
                        reader_state.snapshot_max_nodes,
                        reader_state.snapshot_max_events,
                    );
                    reader_state.broadcaster.send_snapshot(session_id, snap);
                }
                Err(err) => {
                    tracing::debug!(session_id = session_id.0, error = %err, "unrecognized client frame");
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
    state.broadcaster.unregister(session_id);
}
