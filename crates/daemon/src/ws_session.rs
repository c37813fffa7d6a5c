use crate::api::AppState;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use ops_types::ProtocolError;
use tracing::{debug, error, warn};

/// Serves one WebSocket client until it disconnects.
///
/// The writer task drains the client's outbox to the socket; this task reads
/// inbound frames and hands them to the registry. Either side ending removes
/// the client.
pub async fn serve_client(state: AppState, socket: WebSocket) {
    let registry = state.registry.clone();
    let (client_id, mut outbox) = registry.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!(client_id = %client_id, "Failed to serialize server message: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                // Client disconnected
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let supervisor = &state.supervisor;
                    registry.handle_inbound(&client_id, &text, |command_id| supervisor.is_active(command_id));
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(client_id = %client_id, "Dropping client message: {}", ProtocolError::BinaryFrame);
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(client_id = %client_id, "Client closed the connection.");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(client_id = %client_id, "Error receiving from client: {}", e);
                    break;
                }
            },
            _ = &mut writer => {
                debug!(client_id = %client_id, "Socket writer stopped.");
                break;
            }
        }
    }

    registry.unregister(&client_id);
    writer.abort();
}
