use crate::api::AppState;
use crate::auth;
use crate::delivery;
use crate::model::ClientEvent;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// Upgrade an authenticated request into the live event channel.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, claims.sub))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Uuid) {
    let (mut sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let conn_id = state.registry.register(user_id, tx);
    let mut events = UnboundedReceiverStream::new(rx);
    loop {
        tokio::select! {
            event = events.next() => {
                match event {
                    Some(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if sink.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // sender dropped: this connection was replaced
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => handle_client_text(&state, user_id, &text),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    // no-op if a newer connection already owns the registry entry
    state.registry.unregister(user_id, conn_id);
}

fn handle_client_text(state: &AppState, user_id: Uuid, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!("ignoring malformed client event: {err}");
            return;
        }
    };
    let conn = match state.conn() {
        Ok(conn) => conn,
        Err(err) => {
            tracing::warn!("dropping client event, no db connection: {err}");
            return;
        }
    };
    delivery::relay_client_event(&conn, &state.registry, &state.typing, user_id, event);
}
