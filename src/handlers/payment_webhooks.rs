use crate::{
    errors::ServiceError,
    services::{payments::webhook::SIGNATURE_HEADER, reconciliation_service::WebhookOutcome},
    AppState,
};
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use serde_json::json;
use tracing::debug;

// POST /api/v1/payments/webhook
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let outcome = state
        .services
        .reconciliation
        .handle_webhook(signature, &body)
        .await?;
    if outcome == WebhookOutcome::Ignored {
        debug!("Payment webhook acknowledged without changes");
    }

    Ok(Json(json!({ "received": true })))
}
