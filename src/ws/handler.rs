//! WebSocket session handling.
//!
//! One task per connection owns the socket, an outbound channel filled by
//! the room, and the heartbeat. The room name is the request path stripped
//! of its leading slash (the query string never reaches the matcher).

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ws::registry::RoomRegistry;
use crate::ws::room::{AttachError, SESSION_CHANNEL_CAPACITY};

/// WebSocket handler
pub async fn websocket_handler(
    Path(room_name): Path<String>,
    ws: WebSocketUpgrade,
    State(registry): State<Arc<RoomRegistry>>,
) -> Response {
    info!("New WebSocket connection attempt for room: {}", room_name);
    ws.on_upgrade(move |socket| handle_socket(socket, room_name, registry))
}

/// What the heartbeat decides on each tick.
#[derive(Debug, PartialEq)]
enum ProbeAction {
    SendPing,
    Disconnect,
}

/// Liveness tracking for one session: a probe is sent every interval, and a
/// tick that finds the previous probe unacknowledged disconnects the peer.
#[derive(Debug)]
struct LivenessProbe {
    acked: bool,
}

impl LivenessProbe {
    fn new() -> Self {
        Self { acked: true }
    }

    fn ack(&mut self) {
        self.acked = true;
    }

    fn tick(&mut self) -> ProbeAction {
        if !self.acked {
            return ProbeAction::Disconnect;
        }
        self.acked = false;
        ProbeAction::SendPing
    }
}

async fn handle_socket(mut socket: WebSocket, room_name: String, registry: Arc<RoomRegistry>) {
    let conn_id = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(SESSION_CHANNEL_CAPACITY);

    // The handle can be a leftover from a room that finished tearing down
    // between lookup and attach; re-resolve and retry.
    let mut attached = None;
    for _ in 0..3 {
        let handle = registry.get_or_create(&room_name).await;
        match handle.attach(conn_id, out_tx.clone()).await {
            Ok(()) => {
                attached = Some(handle);
                break;
            }
            Err(AttachError::RoomClosed) => continue,
        }
    }
    let Some(handle) = attached else {
        warn!(
            "Failed to attach connection {} to room '{}'",
            conn_id, room_name
        );
        return;
    };
    info!(
        "WebSocket connection established for room: {} with connection_id: {}",
        room_name, conn_id
    );

    let ping_interval = registry.ping_interval();
    let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);
    let mut probe = LivenessProbe::new();

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    if handle.inbound(conn_id, Bytes::from(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    // Some clients ship the binary protocol in text frames;
                    // route the bytes and let the room judge them.
                    if handle.inbound(conn_id, Bytes::from(text.into_bytes())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => probe.ack(),
                Some(Ok(Message::Ping(_))) => {} // axum answers pings itself
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("Socket error on connection {}: {}", conn_id, e);
                    break;
                }
            },
            outgoing = out_rx.recv() => match outgoing {
                Some(frame) => {
                    if socket.send(Message::Binary(frame.to_vec())).await.is_err() {
                        break;
                    }
                }
                None => {
                    debug!("Connection {} closed by room '{}'", conn_id, room_name);
                    break;
                }
            },
            _ = interval.tick() => match probe.tick() {
                ProbeAction::SendPing => {
                    if socket.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                ProbeAction::Disconnect => {
                    warn!(
                        "Connection {} missed its liveness probe, closing",
                        conn_id
                    );
                    break;
                }
            },
        }
    }

    handle.detach(conn_id).await;
    info!(
        "WebSocket connection terminated for room: {} ({})",
        room_name, conn_id
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_pings_while_acknowledged() {
        let mut probe = LivenessProbe::new();
        assert_eq!(probe.tick(), ProbeAction::SendPing);
        probe.ack();
        assert_eq!(probe.tick(), ProbeAction::SendPing);
        probe.ack();
        assert_eq!(probe.tick(), ProbeAction::SendPing);
    }

    #[test]
    fn unacknowledged_probe_disconnects_on_next_tick() {
        let mut probe = LivenessProbe::new();
        assert_eq!(probe.tick(), ProbeAction::SendPing);
        // No pong between the two probe rounds.
        assert_eq!(probe.tick(), ProbeAction::Disconnect);
    }

    #[test]
    fn late_ack_recovers_the_session() {
        let mut probe = LivenessProbe::new();
        assert_eq!(probe.tick(), ProbeAction::SendPing);
        probe.ack();
        assert_eq!(probe.tick(), ProbeAction::SendPing);
        assert_eq!(probe.tick(), ProbeAction::Disconnect);
    }
}
