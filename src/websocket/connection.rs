use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::error::WebSocketError;
use crate::hub::{
    Hub, Mailbox, Message, KIND_CLOSE, KIND_ERROR, KIND_SERVER_SHUTDOWN, KIND_WELCOME,
};

pub type WsStream = WebSocketStream<TcpStream>;

/// Kinds only the server may originate.
const RESERVED_KINDS: [&str; 4] = [KIND_WELCOME, KIND_CLOSE, KIND_SERVER_SHUTDOWN, KIND_ERROR];

/// How long the write pump gets to flush a final close frame once the read side is done.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Decodes an inbound text frame and stamps it with the sending connection.
pub fn decode_inbound(text: &str, connection_id: &str) -> Result<Message, WebSocketError> {
    let mut message: Message = serde_json::from_str(text)?;
    if message.kind.trim().is_empty() {
        return Err(WebSocketError::InvalidFormat("message type is required".to_string()));
    }
    if RESERVED_KINDS.contains(&message.kind.as_str()) {
        return Err(WebSocketError::InvalidFormat(format!(
            "message type '{}' is reserved",
            message.kind
        )));
    }
    message.sender_id = Some(connection_id.to_string());
    Ok(message)
}

/// One upgraded WebSocket connection, bridging the socket and the hub.
pub struct Connection {
    connection_id: String,
    user_id: String,
    hub: Hub,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

impl Connection {
    pub fn new(
        connection_id: String,
        user_id: String,
        hub: Hub,
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            connection_id,
            user_id,
            hub,
            heartbeat_interval,
            heartbeat_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.connection_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Runs both pumps until either side finishes, then unregisters from the hub.
    pub async fn serve(self, ws_stream: WsStream, mailbox: Mailbox) {
        let (ws_sink, ws_stream) = ws_stream.split();

        let mut send_task = tokio::spawn(write_pump(
            ws_sink,
            mailbox,
            self.heartbeat_interval,
            self.connection_id.clone(),
        ));
        let mut receive_task = tokio::spawn(read_pump(
            ws_stream,
            self.hub.clone(),
            self.connection_id.clone(),
            self.heartbeat_timeout,
        ));

        let write_finished = tokio::select! {
            _ = &mut send_task => {
                debug!(connection_id = %self.connection_id, "Send task completed");
                true
            }
            _ = &mut receive_task => {
                debug!(connection_id = %self.connection_id, "Receive task completed");
                false
            }
        };

        self.hub.unregister(&self.connection_id).await;

        if write_finished {
            receive_task.abort();
        } else if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut send_task).await.is_err() {
            // Unregistering closes the mailbox, so this only trips on a stuck socket.
            send_task.abort();
        }

        info!(
            connection_id = %self.connection_id,
            user_id = %self.user_id,
            "Connection closed"
        );
    }
}

async fn send_json(
    sink: &mut SplitSink<WsStream, Frame>,
    message: &Message,
) -> Result<(), WebSocketError> {
    let text = serde_json::to_string(message)?;
    sink.send(Frame::Text(text)).await?;
    Ok(())
}

/// Drains the mailbox onto the socket and keeps the peer alive with pings.
/// Exits when the mailbox closes, after a `close` message, or on a write error.
async fn write_pump(
    mut sink: SplitSink<WsStream, Frame>,
    mut mailbox: Mailbox,
    heartbeat_interval: Duration,
    connection_id: String,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    // The first tick completes immediately.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            message = mailbox.recv() => {
                let Some(message) = message else {
                    debug!(connection_id = %connection_id, "Mailbox closed");
                    let _ = sink.send(Frame::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    }))).await;
                    break;
                };

                if let Err(e) = send_json(&mut sink, &message).await {
                    error!(connection_id = %connection_id, error = %e, "Error sending WebSocket message");
                    break;
                }

                if let Some((code, reason)) = message.close_details() {
                    let _ = sink.send(Frame::Close(Some(CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    }))).await;
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = sink.send(Frame::Ping(Vec::new())).await {
                    error!(connection_id = %connection_id, error = %e, "Failed to send heartbeat");
                    break;
                }
            }
        }
    }

    if let Err(e) = sink.close().await {
        debug!(connection_id = %connection_id, error = %e, "Error closing WebSocket sink");
    }
}

/// Reads frames from the peer and forwards decoded messages to the hub.
/// Any frame, including a pong, resets the heartbeat deadline.
async fn read_pump(
    mut stream: SplitStream<WsStream>,
    hub: Hub,
    connection_id: String,
    heartbeat_timeout: Duration,
) {
    loop {
        let frame = match tokio::time::timeout(heartbeat_timeout, stream.next()).await {
            Err(_) => {
                warn!(connection_id = %connection_id, "Heartbeat timeout");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                error!(connection_id = %connection_id, error = %e, "Error receiving WebSocket message");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Frame::Text(text) => match decode_inbound(&text, &connection_id) {
                Ok(message) => {
                    debug!(connection_id = %connection_id, kind = %message.kind, "Inbound message");
                    hub.broadcast(message);
                }
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "Rejected inbound message");
                    hub.reply(&connection_id, Message::error(&e.to_string()));
                }
            },
            Frame::Binary(bin) => {
                warn!(connection_id = %connection_id, bytes = bin.len(), "Binary messages are not supported");
                hub.reply(&connection_id, Message::error("Binary messages are not supported"));
            }
            Frame::Close(reason) => {
                info!(connection_id = %connection_id, reason = ?reason, "Client initiated close");
                break;
            }
            // Pings are answered by tungstenite; pongs only need to reset the deadline.
            _ => {}
        }
    }
}
