use crate::handlers::common::{
    created_response, missing_field, success_response, JsonBody, QueryParams,
};
use crate::{
    auth::AuthUser, errors::ServiceError, services::cart_service::AddToCartInput, AppState,
};
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Creates the router for the caller's cart
pub fn cart_routes() -> Router<AppState> {
    Router::new().route(
        "/",
        get(get_cart)
            .post(add_to_cart)
            .put(update_cart_item)
            .delete(remove_from_cart),
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCartItemRequest {
    pub listing_id: Option<String>,
    pub seller_id: Option<String>,
    #[serde(alias = "quantity")]
    pub qty: Option<i32>,
    pub price_at_add: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCartItemRequest {
    pub listing_id: Option<String>,
    #[serde(alias = "quantity")]
    pub qty: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveCartItemParams {
    pub listing_id: Option<String>,
}

async fn get_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state.services.cart.get_cart(&user.user_id).await?;
    Ok(success_response(cart))
}

async fn add_to_cart(
    State(state): State<AppState>,
    user: AuthUser,
    JsonBody(payload): JsonBody<AddCartItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let input = AddToCartInput {
        listing_id: payload.listing_id.ok_or_else(|| missing_field("listingId"))?,
        seller_id: payload.seller_id.ok_or_else(|| missing_field("sellerId"))?,
        quantity: payload.qty.ok_or_else(|| missing_field("qty"))?,
        price_at_add: payload
            .price_at_add
            .ok_or_else(|| missing_field("priceAtAdd"))?,
    };

    let cart = state
        .services
        .cart
        .add_to_cart(&user.user_id, input)
        .await?;
    Ok(created_response(cart))
}

async fn update_cart_item(
    State(state): State<AppState>,
    user: AuthUser,
    JsonBody(payload): JsonBody<UpdateCartItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let listing_id = payload
        .listing_id
        .ok_or_else(|| missing_field("listingId"))?;
    let quantity = payload.qty.ok_or_else(|| missing_field("qty"))?;

    let cart = state
        .services
        .cart
        .update_cart_item(&user.user_id, &listing_id, quantity)
        .await?;
    Ok(success_response(cart))
}

/// Without `listingId` the whole cart is cleared.
async fn remove_from_cart(
    State(state): State<AppState>,
    user: AuthUser,
    QueryParams(params): QueryParams<RemoveCartItemParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = match params.listing_id.as_deref().filter(|id| !id.is_empty()) {
        Some(listing_id) => {
            state
                .services
                .cart
                .remove_from_cart(&user.user_id, listing_id)
                .await?
        }
        None => state.services.cart.clear_cart(&user.user_id).await?,
    };
    Ok(success_response(cart))
}
