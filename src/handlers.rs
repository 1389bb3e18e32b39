//! HTTP administrative surface for the hub.

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::error::{AppError, HubError};
use crate::hub::Message;
use crate::{AppState, Result};

/// Health check endpoint handler
/// Returns a JSON response with server status, timestamp and live connection count
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let status = if state.hub.is_stopped() { "stopped" } else { "healthy" };
    let connections = state.hub.get_connected_clients().await;

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "connections": connections,
    }))
}

/// Hub counters plus derived send/receive rates.
pub async fn metrics(state: web::Data<AppState>) -> Result<HttpResponse> {
    let snapshot = state.hub.get_metrics().await;
    let (send_rate, receive_rate) = snapshot.message_rate();

    let mut body = serde_json::to_value(&snapshot)
        .map_err(|e| AppError::InternalError(e.to_string()))?;
    body["send_rate"] = json!(send_rate);
    body["receive_rate"] = json!(receive_rate);

    Ok(HttpResponse::Ok().json(body))
}

/// Queues a server-originated message for delivery through the hub.
pub async fn broadcast(
    state: web::Data<AppState>,
    message: web::Json<Message>,
) -> Result<HttpResponse> {
    let message = message.into_inner();
    if message.kind.trim().is_empty() {
        return Err(AppError::ValidationError("message type is required".to_string()));
    }
    if state.hub.is_stopped() {
        return Err(HubError::Stopped.into());
    }

    let kind = message.kind.clone();
    state.hub.broadcast(message);

    Ok(HttpResponse::Accepted().json(json!({
        "status": "queued",
        "type": kind,
    })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/metrics", web::get().to(metrics))
        .route("/broadcast", web::post().to(broadcast));
}
