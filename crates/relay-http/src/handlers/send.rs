use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use relay_core::{
    address,
    dispatch::{DispatchStatus, NotificationPayload, RejectReason},
};

use crate::router::AppState;

fn bad_request(error: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": error.into() }))).into_response()
}

/// POST /send-whatsapp
pub async fn send_whatsapp(
    State(state): State<AppState>,
    payload: Result<Json<NotificationPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(p) => p,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "unreadable notification payload");
            return bad_request(RejectReason::EmptyBody.to_string());
        }
    };

    let outcome = state.dispatch.dispatch(&payload).await;
    let phone = outcome.normalized_address.as_ref().map(|a| a.e164());

    match outcome.status {
        DispatchStatus::Sent => Json(json!({
            "success": true,
            "message": "WhatsApp message sent successfully",
            "phoneNumber": phone,
        }))
        .into_response(),
        DispatchStatus::Rejected(reason) => bad_request(reason.to_string()),
        DispatchStatus::Failed(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Failed to send WhatsApp message",
                "details": e.to_string(),
            })),
        )
            .into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ExtractionRequest {
    #[serde(rename = "emailBody", default)]
    pub body: String,
}

/// POST /test-extraction
///
/// Dry run of address extraction; never sends anything.
pub async fn test_extraction(payload: Result<Json<ExtractionRequest>, JsonRejection>) -> Response {
    let body = match payload {
        Ok(Json(req)) if !req.body.trim().is_empty() => req.body,
        _ => return bad_request(RejectReason::EmptyBody.to_string()),
    };

    let preview = address::preview(&body);
    Json(json!({
        "success": true,
        "extractedPhone": preview.extracted_phone,
        "whatsappFormat": preview.chat_address.map(|c| c.0),
        "emailBodyPreview": preview.body_preview,
    }))
    .into_response()
}
