use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};

use super::hub::RealtimeHub;

/// 单个 WebSocket 连接的读写循环
pub async fn serve_socket(socket: WebSocket, hub: RealtimeHub) {
    let (client_id, mut outbound) = hub.connect();
    let (mut sink, mut stream) = socket.split();

    let writer_client = client_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(client_id = %writer_client, error = %e, "Failed to encode push message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => hub.handle_text(&client_id, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(client_id = %client_id, error = %e, "WebSocket read error");
                    break;
                }
            }
        }
    }

    hub.disconnect(&client_id);
    writer.abort();
}
