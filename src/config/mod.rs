use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ws_port: u16,
    pub workers: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HubSettings {
    pub register_buffer: usize,
    pub unregister_buffer: usize,
    pub broadcast_buffer: usize,
    pub mailbox_capacity: usize,
    pub shutdown_grace_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl HubSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketSettings {
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
}

impl WebSocketSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_any_origin: bool,
    pub max_age: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub hub: HubSettings,
    pub websocket: WebSocketSettings,
    pub cors: CorsConfig,
}

fn defaults(environment: &str) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("environment", environment)?
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("server.ws_port", 8081)?
        .set_default("server.workers", num_cpus::get() as i64)?
        .set_default("hub.register_buffer", 256)?
        .set_default("hub.unregister_buffer", 256)?
        .set_default("hub.broadcast_buffer", 256)?
        .set_default("hub.mailbox_capacity", 256)?
        .set_default("hub.shutdown_grace_ms", 100)?
        .set_default("hub.shutdown_timeout_secs", 10)?
        .set_default("websocket.heartbeat_interval_secs", 30)?
        .set_default("websocket.heartbeat_timeout_secs", 60)?
        .set_default("cors.enabled", true)?
        .set_default("cors.allow_any_origin", false)?
        .set_default("cors.max_age", 3600)
}

/// `APP_` prefix, `__` between nested keys: `APP_HUB__MAILBOX_CAPACITY`.
fn environment() -> Environment {
    Environment::with_prefix("app")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = defaults("development")?
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add in settings from environment variables (with prefix "APP_")
            // E.g., `APP_HUB__MAILBOX_CAPACITY=64` would set `Settings.hub.mailbox_capacity`
            .add_source(environment())
            .build()?;

        s.try_deserialize()
    }

    pub fn new_for_test() -> Result<Self, ConfigError> {
        defaults("test")?
            .set_override("server.port", 0)?
            .set_override("server.ws_port", 0)?
            .set_override("hub.mailbox_capacity", 16)?
            .set_override("hub.shutdown_grace_ms", 10)?
            .set_override("hub.shutdown_timeout_secs", 2)?
            .build()?
            .try_deserialize()
    }
}
