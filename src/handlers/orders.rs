use crate::handlers::common::{created_response, success_response, JsonBody, QueryParams};
use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::{
        checkout_service::Buyer,
        orders::{CreateOrderInput, ListOrdersQuery, UpdateOrderInput},
    },
    AppState,
};
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use tracing::info;
use uuid::Uuid;

/// Creates the router for order endpoints
pub fn orders_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders).post(create_order))
        .route("/:id", get(get_order).patch(update_order))
}

/// Ids that are not UUIDs cannot name an order, so they read as absent.
fn parse_order_id(raw: &str) -> Result<Uuid, ServiceError> {
    Uuid::parse_str(raw).map_err(|_| ServiceError::NotFound(format!("Order {} not found", raw)))
}

async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    JsonBody(payload): JsonBody<CreateOrderInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let buyer = Buyer {
        id: &user.user_id,
        email: user.email.as_deref(),
    };
    let order = state.services.checkout.place_order(buyer, &payload).await?;

    info!(order_id = %order.id, "Order created via API");
    Ok(created_response(order))
}

async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
    QueryParams(query): QueryParams<ListOrdersQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let orders = state
        .services
        .orders
        .list_orders(&user.user_id, &query)
        .await?;
    Ok(success_response(orders))
}

async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let order_id = parse_order_id(&id)?;
    let order = state
        .services
        .orders
        .get_order(order_id, &user.user_id)
        .await?;
    Ok(success_response(order))
}

async fn update_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    JsonBody(payload): JsonBody<UpdateOrderInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let order_id = parse_order_id(&id)?;
    let order = state
        .services
        .orders
        .update_order(order_id, &user.user_id, payload)
        .await?;

    info!(order_id = %order.id, status = %order.status, "Order updated via API");
    Ok(success_response(order))
}
