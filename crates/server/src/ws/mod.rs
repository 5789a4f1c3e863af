// WebSocket upgrade, session loop, and event fan-out.
//
// The upgrade is authenticated by a single-use subscription token passed as
// a query parameter. Validation happens after the protocol upgrade so
// failures can be signalled with close codes — the only error surface a
// WebSocket client gets:
//   4001 token expired, 4002 token invalid or already used, 4003 key
//   revoked, 4004 per-key connection limit, 4005 workspace at capacity.

pub mod registry;
pub mod token;

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use handoff_common::protocol::ws::{close_code, WsFrame};

use crate::api::AppState;
use crate::auth;
use crate::bus::{events_for_tier, EventBus};
use crate::ws::registry::{AdmissionError, ConnectionRegistry, EventSink, WsConnection};
use crate::ws::token::TokenError;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// `GET /ws?token=…` — upgrade and hand off to the session loop.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, query.token, socket))
}

/// Outbound side of a connection: the registry writes frames into the
/// channel, the session loop drains it onto the socket.
struct ChannelSink {
    sender: mpsc::UnboundedSender<WsFrame>,
}

impl EventSink for ChannelSink {
    fn send(&self, frame: &WsFrame) -> bool {
        self.sender.send(frame.clone()).is_ok()
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

async fn handle_socket(state: AppState, token: Option<String>, mut socket: WebSocket) {
    let claims = match token.as_deref().map(|raw| state.tokens.validate(raw)) {
        Some(Ok(claims)) => claims,
        Some(Err(TokenError::Expired)) => {
            close_with(&mut socket, close_code::TOKEN_EXPIRED, "TOKEN_EXPIRED").await;
            return;
        }
        Some(Err(TokenError::Invalid)) | None => {
            close_with(&mut socket, close_code::TOKEN_INVALID, "TOKEN_INVALID").await;
            return;
        }
    };

    let token_expires_at = Utc
        .timestamp_opt(claims.exp, 0)
        .single()
        .unwrap_or_else(Utc::now);
    if !state.registry.redeem_token(&claims.jti, token_expires_at) {
        close_with(&mut socket, close_code::TOKEN_INVALID, "TOKEN_ALREADY_USED").await;
        return;
    }

    // The token authenticated the upgrade; the key must still be live now.
    if let Some(code) = key_refusal(&state, &claims.key_hash) {
        let reason = if code == close_code::KEY_REVOKED { "KEY_REVOKED" } else { "TOKEN_INVALID" };
        close_with(&mut socket, code, reason).await;
        return;
    }

    let (sender, mut outbound) = mpsc::unbounded_channel::<WsFrame>();
    let events: HashSet<String> = events_for_tier(claims.tier).into_iter().collect();
    let connection = WsConnection {
        id: Uuid::new_v4(),
        workspace_id: claims.workspace_id.clone(),
        key_hash: claims.key_hash.clone(),
        tier: claims.tier,
        scope: claims.scope.clone(),
        events: events.clone(),
        sink: Arc::new(ChannelSink { sender }),
    };
    let connection_id = connection.id;

    match state.registry.register(connection) {
        Ok(()) => {}
        Err(AdmissionError::KeyLimit) => {
            close_with(
                &mut socket,
                close_code::KEY_CONNECTION_LIMIT,
                "CONNECTION_LIMIT_EXCEEDED",
            )
            .await;
            return;
        }
        Err(AdmissionError::WorkspaceBusy) => {
            close_with(&mut socket, close_code::WORKSPACE_BUSY, "SERVER_BUSY").await;
            return;
        }
    }

    let mut sorted_events: Vec<String> = events.into_iter().collect();
    sorted_events.sort();
    let connected = WsFrame::Connected {
        connection_id,
        events: sorted_events,
        scope: claims.scope.clone(),
    };
    if send_frame(&mut socket, &connected).await.is_err() {
        state.registry.unregister(connection_id);
        return;
    }

    info!(connection_id = %connection_id, scope = %claims.scope, "subscription connected");

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if send_frame(&mut socket, &frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let reply = reply_frame(&text);
                    if send_frame(&mut socket, &reply).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(connection_id = %connection_id, error = ?error, "websocket read failed");
                    break;
                }
            },
        }
    }

    state.registry.unregister(connection_id);
    info!(connection_id = %connection_id, "subscription disconnected");
}

/// Whether the key behind a token must be refused, and with which close code.
fn key_refusal(state: &AppState, key_hash: &str) -> Option<u16> {
    let conn = state.db.lock();
    let key = match auth::lookup_key_any(&conn, key_hash) {
        Ok(key) => key,
        Err(error) => {
            warn!(error = ?error, "capability key lookup failed during upgrade");
            return Some(close_code::TOKEN_INVALID);
        }
    };

    let Some(key) = key else {
        return Some(close_code::TOKEN_INVALID);
    };
    if key.revoked_at.is_some() {
        return Some(close_code::KEY_REVOKED);
    }
    if key.expires_at.is_some_and(|expires| expires <= Utc::now()) {
        return Some(close_code::TOKEN_INVALID);
    }

    match crate::store::workspaces::find_workspace(&conn, &key.workspace_id) {
        Ok(Some(workspace)) if workspace.deleted_at.is_none() => None,
        Ok(_) => Some(close_code::TOKEN_INVALID),
        Err(error) => {
            warn!(error = ?error, "workspace lookup failed during upgrade");
            Some(close_code::TOKEN_INVALID)
        }
    }
}

/// Protocol reply for one inbound text frame: `ping` gets `pong`, anything
/// unrecognized is echoed back as an ack.
fn reply_frame(text: &str) -> WsFrame {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) if value["type"] == "ping" => WsFrame::Pong,
        Ok(value) => WsFrame::Ack { received: value },
        Err(_) => WsFrame::Ack { received: serde_json::Value::String(text.to_string()) },
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &WsFrame) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(json.into())).await
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
        .await;
}

/// Drain the event bus into the connection registry for the lifetime of the
/// process. Lag is logged, never fatal.
pub fn spawn_broadcast(
    bus: EventBus,
    registry: Arc<ConnectionRegistry>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut receiver = bus.subscribe();
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    registry.deliver(&event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event fan-out lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use handoff_common::protocol::ws::WsFrame;
    use serde_json::json;

    use super::reply_frame;

    #[test]
    fn ping_gets_a_pong() {
        assert_eq!(reply_frame(r#"{"type":"ping"}"#), WsFrame::Pong);
    }

    #[test]
    fn unrecognized_json_is_echoed_as_ack() {
        let reply = reply_frame(r#"{"type":"mystery","n":7}"#);
        match reply {
            WsFrame::Ack { received } => {
                assert_eq!(received, json!({ "type": "mystery", "n": 7 }));
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_text_is_echoed_verbatim() {
        let reply = reply_frame("not json at all");
        match reply {
            WsFrame::Ack { received } => {
                assert_eq!(received, json!("not json at all"));
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }
}
