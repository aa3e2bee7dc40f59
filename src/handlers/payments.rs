use crate::handlers::common::{success_response, JsonBody, QueryParams};
use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::{checkout_service::Buyer, orders::CreateOrderInput},
    AppState,
};
use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;

/// Payment routes. `/confirm` is keyed by the provider session id alone and
/// needs no caller token.
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/create-checkout-session", post(create_checkout_session))
        .route("/create-intent", post(create_payment_intent))
        .route("/confirm", get(confirm_payment))
        .route(
            "/webhook",
            post(crate::handlers::payment_webhooks::payment_webhook),
        )
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfirmParams {
    pub session_id: Option<String>,
}

async fn create_checkout_session(
    State(state): State<AppState>,
    user: AuthUser,
    JsonBody(payload): JsonBody<CreateOrderInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let buyer = Buyer {
        id: &user.user_id,
        email: user.email.as_deref(),
    };
    let session = state
        .services
        .checkout
        .create_checkout_session(buyer, &payload)
        .await?;
    Ok(success_response(session))
}

async fn create_payment_intent(
    State(state): State<AppState>,
    user: AuthUser,
    JsonBody(payload): JsonBody<CreateOrderInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let buyer = Buyer {
        id: &user.user_id,
        email: user.email.as_deref(),
    };
    let intent = state
        .services
        .checkout
        .create_payment_intent(buyer, &payload)
        .await?;
    Ok(success_response(intent))
}

async fn confirm_payment(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<ConfirmParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let confirmation = state
        .services
        .reconciliation
        .confirm_by_session(params.session_id.as_deref().unwrap_or_default())
        .await?;
    Ok(success_response(confirmation))
}
