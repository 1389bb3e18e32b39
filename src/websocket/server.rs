use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::Uri;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::WebSocketSettings;
use crate::hub::{Client, Hub};
use crate::websocket::Connection;

/// Reads the `user_id` query parameter from an upgrade request URI.
pub fn user_id_from_uri(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "user_id")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Delay before retrying `accept` after `consecutive_errors` failures in a row.
fn accept_backoff(consecutive_errors: u32) -> Duration {
    ACCEPT_BACKOFF_BASE
        .saturating_mul(1 << consecutive_errors.saturating_sub(1).min(6))
        .min(ACCEPT_BACKOFF_MAX)
}

/// Accepts WebSocket connections and hands each one to the hub.
pub struct WebSocketServer {
    hub: Hub,
    settings: WebSocketSettings,
}

impl WebSocketServer {
    pub fn new(hub: Hub, settings: WebSocketSettings) -> Self {
        Self { hub, settings }
    }

    /// Accept loop. Runs until the task is aborted; accept errors such as
    /// running out of file descriptors are retried with a growing delay.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        let mut consecutive_errors = 0u32;
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    consecutive_errors = 0;
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let delay = accept_backoff(consecutive_errors);
                    error!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Error accepting WebSocket connection"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub async fn handle_connection(self: Arc<Self>, raw_stream: TcpStream, addr: SocketAddr) {
        if self.hub.is_stopped() {
            warn!("Hub stopped, refusing connection from {}", addr);
            return;
        }

        info!("New WebSocket connection from: {}", addr);

        let mut requested_user = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            requested_user = user_id_from_uri(request.uri());
            Ok(response)
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(raw_stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("Error during WebSocket handshake with {}: {}", addr, e);
                return;
            }
        };

        let connection_id = Uuid::new_v4().to_string();
        let user_id = requested_user.unwrap_or_else(|| connection_id.clone());
        let (client, mailbox) =
            Client::with_id(connection_id.clone(), user_id.clone(), self.hub.mailbox_capacity());

        let connection = Connection::new(
            connection_id,
            user_id,
            self.hub.clone(),
            self.settings.heartbeat_interval(),
            self.settings.heartbeat_timeout(),
        );
        info!(
            connection_id = %connection.id(),
            user_id = %connection.user_id(),
            peer = %addr,
            "WebSocket connection established"
        );

        self.hub.register(client);
        connection.serve(ws_stream, mailbox).await;
    }
}
