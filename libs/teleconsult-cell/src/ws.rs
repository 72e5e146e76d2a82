// libs/teleconsult-cell/src/ws.rs
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::TeleconsultError;
use crate::services::relay::{RelayGrant, RoomEvent};
use crate::TeleconsultState;

#[derive(Debug, Deserialize)]
pub struct RoomWsQuery {
    pub token: String,
}

/// Messages accepted from a connected room member.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Signal { payload: Value },
    Chat { body: String },
    Leave,
    LatencyReport { average_ms: f64 },
}

/// Room connection endpoint. Admission is by relay token minted at REST
/// join; any other identity is rejected before the upgrade completes.
pub async fn room_ws(
    State(state): State<Arc<TeleconsultState>>,
    Path(room_id): Path<String>,
    Query(query): Query<RoomWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(grant) = state.relay.redeem_token(&query.token, &room_id).await else {
        return TeleconsultError::Forbidden.into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, grant))
}

async fn handle_socket(socket: WebSocket, state: Arc<TeleconsultState>, grant: RelayGrant) {
    let RelayGrant {
        session_id, role, ..
    } = grant;

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RoomEvent>();

    // Forward room events out to the socket. A superseded notice is the
    // last thing an evicted connection sees before the close frame.
    let forward = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let superseded = matches!(event, RoomEvent::Superseded);
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialize room event: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
            if superseded {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    });

    let connection_id = state
        .presence
        .register(session_id, role, grant.user_id.clone(), tx)
        .await;
    state
        .relay
        .broadcast(session_id, RoomEvent::PresenceJoined { role })
        .await;

    let mut explicit_leave = false;
    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(text) => {
                let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
                match parsed {
                    Ok(ClientMessage::Signal { payload }) => {
                        // Fire-and-forget: never blocks on the lifecycle
                        // engine's critical section.
                        state.relay.send_signal(session_id, role, payload).await;
                    }
                    Ok(ClientMessage::Chat { body }) => {
                        match state.lifecycle.append_chat(session_id, role, body).await {
                            Ok(message) => {
                                state
                                    .relay
                                    .broadcast(session_id, RoomEvent::Chat { message })
                                    .await;
                            }
                            Err(e) => debug!("Chat rejected on session {}: {}", session_id, e),
                        }
                    }
                    Ok(ClientMessage::Leave) => {
                        explicit_leave = true;
                        if let Err(e) = state.lifecycle.leave_as(session_id, role).await {
                            warn!("Leave failed on session {}: {}", session_id, e);
                        }
                        break;
                    }
                    Ok(ClientMessage::LatencyReport { average_ms }) => {
                        if let Err(e) = state
                            .telemetry
                            .record_latency_sample(session_id, average_ms)
                            .await
                        {
                            debug!("Latency report rejected on session {}: {}", session_id, e);
                        }
                    }
                    Err(e) => debug!("Unparseable client message: {}", e),
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    let authoritative = if explicit_leave {
        state.presence.unregister(connection_id).await
    } else {
        // Transport drop without a leave message: grace-period handling.
        state.presence.connection_dropped(connection_id).await
    };

    // A superseded socket's teardown says nothing about the role, which is
    // still connected on the replacement device.
    if authoritative {
        state
            .relay
            .broadcast(session_id, RoomEvent::PresenceLeft { role })
            .await;
    }

    forward.abort();
}
