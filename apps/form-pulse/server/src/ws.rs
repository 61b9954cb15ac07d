use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::gateway::FormGateway;
use crate::http::AppState;

pub(crate) async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| handle_connection(socket, gateway))
}

async fn handle_connection(socket: WebSocket, gateway: FormGateway) {
    if let Err(err) = serve_connection(socket, gateway).await {
        warn!("connection ended with error: {err}");
    }
}

/// Pump one socket until it closes. Teardown always runs, whatever ended
/// the read loop.
async fn serve_connection(socket: WebSocket, gateway: FormGateway) -> Result<(), TransportError> {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let handle = gateway.connect();
    let connection_id = handle.id;
    let mut outbound = handle.receiver;
    info!(connection_id = %connection_id, "websocket connection established");

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let payload = match serde_json::to_string(event.as_ref()) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(connection_id = %connection_id, error = %err, "failed to encode outbound event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    let mut result = Ok(());
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => gateway.handle_frame(connection_id, &text).await,
            Ok(Message::Binary(bytes)) => gateway.handle_binary_frame(connection_id, &bytes).await,
            Ok(Message::Close(frame)) => {
                info!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                result = Err(TransportError::Receive(err));
                break;
            }
        }
    }

    gateway.disconnect(connection_id).await;
    writer.abort();
    result
}
