//! WebSocket endpoint. One task drains the connection's outbound queue into
//! the socket while another feeds inbound frames to the broker.

use agora_shared::protocol::{ClientEvent, ServerEvent};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::api::AppState;
use crate::auth::AuthUser;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: agora_shared::Identity) {
    let broker = state.broker.clone();
    let (conn, mut rx) = broker.connect(identity).await;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(event = event.name(), error = %e, "failed to encode event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let inbound = broker.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => match ClientEvent::parse(&text) {
                    Ok(event) => inbound.handle(conn, &identity, event).await,
                    Err(e) => {
                        debug!(conn = %conn, error = %e, "unparseable frame");
                        inbound
                            .hub()
                            .send_to(conn, ServerEvent::error("invalid request"))
                            .await;
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    broker.disconnect(conn).await;
}
