pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod websocket;

use std::sync::Arc;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;
pub use handlers::health_check;

pub use hub::{Client, Hub, HubConfig, HubState, Message, MetricsSnapshot};
pub use websocket::WebSocketServer;

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub hub: Hub,
}

impl AppState {
    /// Builds the state and starts the hub control loop on the current runtime.
    pub fn new(config: Settings) -> Self {
        let (hub, _) = Hub::spawn(HubConfig::from(&config.hub));

        Self {
            config: Arc::new(config),
            hub,
        }
    }

    /// Notifies every client and waits, up to the configured deadline, for the hub to stop.
    pub async fn shutdown(&self) -> Result<()> {
        self.hub
            .shutdown_with_timeout(self.config.hub.shutdown_timeout())
            .await?;
        Ok(())
    }
}
