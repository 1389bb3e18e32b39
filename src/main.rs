use actix_web::{web, App, HttpServer};
use actix_cors::Cors;
use buddybot_hub::config::CorsConfig;
use buddybot_hub::{handlers, AppState, Settings, WebSocketServer};
use dotenv::dotenv;
use std::net::TcpListener;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn build_cors(config: &CorsConfig) -> Cors {
    if !config.enabled {
        // CORS disabled - use most restrictive settings
        return Cors::default();
    }

    let cors_config = Cors::default();

    // Apply specific CORS rules based on configuration
    let cors_config = if config.allow_any_origin {
        cors_config
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .expose_any_header()
    } else {
        cors_config
            .allowed_origin("http://localhost:8080")
            .allowed_origin("http://127.0.0.1:8080")
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec!["Content-Type"])
    };

    cors_config.max_age(config.max_age as usize)
}

#[actix_web::main]
async fn main() -> buddybot_hub::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();

    // Load configuration
    let config = Settings::new()?;
    info!("Configuration loaded successfully");

    // Initialize application state; this starts the hub control loop
    let state = AppState::new(config.clone());

    let ws_listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.ws_port)).await?;
    let ws_server = Arc::new(WebSocketServer::new(state.hub.clone(), config.websocket.clone()));
    let accept_task = tokio::spawn(ws_server.run(ws_listener));
    info!(
        "WebSocket server ready to accept connections at ws://{}:{}/ws",
        config.server.host, config.server.ws_port
    );

    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))?;
    info!("Starting HTTP server at {}:{}", config.server.host, config.server.port);

    let app_state = web::Data::new(state.clone());
    let cors_config = config.cors.clone();

    // Runs until SIGINT/SIGTERM; actix handles the signals.
    HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&cors_config))
            .app_data(app_state.clone())
            .configure(handlers::configure)
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .run()
    .await?;

    info!("HTTP server stopped, shutting down hub");
    accept_task.abort();

    if let Err(e) = state.shutdown().await {
        error!("Hub shutdown not confirmed: {}", e);
        return Err(e);
    }

    info!("Shutdown complete");
    Ok(())
}
