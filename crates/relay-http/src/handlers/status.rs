use axum::{extract::State, Json};
use serde_json::{json, Value};

use relay_core::utils::iso_timestamp_utc;

use crate::router::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let current = state.connection.current_state();
    Json(json!({
        "status": "ok",
        "whatsappReady": current.is_ready(),
        "hasQR": current.pairing_code().is_some(),
        "timestamp": iso_timestamp_utc(),
    }))
}

/// GET /qr-text
pub async fn qr_text(State(state): State<AppState>) -> Json<Value> {
    let current = state.connection.current_state();
    match current.pairing_code() {
        Some(code) => Json(json!({
            "qrCode": code.as_str(),
            "hasQR": true,
            "clientReady": current.is_ready(),
        })),
        None => Json(json!({
            "error": "No QR code available",
            "clientReady": current.is_ready(),
            "hasQR": false,
        })),
    }
}
