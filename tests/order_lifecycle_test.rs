mod common;

use axum::http::{Method, StatusCode};
use common::{response_json, shipping_address, TestApp, BUYER, SELLER};
use marketplace_checkout::entities::OrderStatus;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use uuid::Uuid;

async fn place_order(app: &TestApp, token: &str, listing_id: &str, qty: i32) -> Value {
    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "cartItems": [{ "listingId": listing_id, "qty": qty, "priceAtAdd": "25.00" }],
                "shippingAddress": shipping_address(),
            })),
            Some(token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    response_json(response).await
}

async fn patch(app: &TestApp, id: &str, body: Value, token: &str) -> axum::response::Response {
    app.request(
        Method::PATCH,
        &format!("/api/v1/orders/{}", id),
        Some(body),
        Some(token),
    )
    .await
}

#[tokio::test]
async fn participants_can_read_an_order_and_others_cannot() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    let buyer = app.buyer_token();
    let order = place_order(&app, &buyer, "L1", 1).await;
    let id = order["id"].as_str().unwrap();
    let uri = format!("/api/v1/orders/{}", id);

    let response = app.request(Method::GET, &uri, None, Some(&buyer)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["id"], id);

    let seller = app.token_for(SELLER, None);
    let response = app.request(Method::GET, &uri, None, Some(&seller)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let stranger = app.token_for("someone-else", None);
    let response = app.request(Method::GET, &uri, None, Some(&stranger)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.request(Method::GET, &uri, None, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_and_malformed_order_ids_are_not_found() {
    let app = TestApp::new().await;
    let token = app.buyer_token();

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", Uuid::new_v4()),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .request(Method::GET, "/api/v1/orders/not-a-uuid", None, Some(&token))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn listing_filters_by_role_and_paginates() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 10).await;
    app.seed_listing("L2", "seller-2", dec!(25.00), 10).await;
    let buyer = app.buyer_token();

    for _ in 0..3 {
        place_order(&app, &buyer, "L1", 1).await;
    }
    place_order(&app, &buyer, "L2", 1).await;

    let response = app
        .request(Method::GET, "/api/v1/orders?limit=2", None, Some(&buyer))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let page = response_json(response).await;
    assert_eq!(page["total"], 4);
    assert_eq!(page["orders"].as_array().unwrap().len(), 2);
    assert_eq!(page["hasMore"], true);

    let page = response_json(
        app.request(
            Method::GET,
            "/api/v1/orders?limit=2&page=2",
            None,
            Some(&buyer),
        )
        .await,
    )
    .await;
    assert_eq!(page["orders"].as_array().unwrap().len(), 2);
    assert_eq!(page["hasMore"], false);

    let seller = app.token_for(SELLER, None);
    let page = response_json(
        app.request(Method::GET, "/api/v1/orders?type=seller", None, Some(&seller))
            .await,
    )
    .await;
    assert_eq!(page["total"], 3);

    // Sellers see nothing when listing as a buyer
    let page = response_json(
        app.request(Method::GET, "/api/v1/orders", None, Some(&seller))
            .await,
    )
    .await;
    assert_eq!(page["total"], 0);

    let response = app
        .request(Method::GET, "/api/v1/orders?limit=0", None, Some(&buyer))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .request(Method::GET, "/api/v1/orders?type=admin", None, Some(&buyer))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn page_numbers_past_the_offset_range_are_rejected() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    let buyer = app.buyer_token();
    place_order(&app, &buyer, "L1", 1).await;

    for uri in [
        "/api/v1/orders?page=18446744073709551615&limit=100",
        "/api/v1/orders?page=92233720368547759&limit=100",
    ] {
        let response = app.request(Method::GET, uri, None, Some(&buyer)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        let body = response_json(response).await;
        assert_eq!(body["error"], "Bad request: page is out of range");
    }

    // Far but representable pages are simply empty
    let page = response_json(
        app.request(
            Method::GET,
            "/api/v1/orders?page=1000000&limit=100",
            None,
            Some(&buyer),
        )
        .await,
    )
    .await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["orders"], json!([]));
    assert_eq!(page["hasMore"], false);
}

#[tokio::test]
async fn listing_filters_by_status() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 10).await;
    let buyer = app.buyer_token();

    let first = place_order(&app, &buyer, "L1", 1).await;
    place_order(&app, &buyer, "L1", 1).await;
    let first_id: Uuid = first["id"].as_str().unwrap().parse().unwrap();
    assert!(app.state.services.orders.mark_paid(first_id).await.unwrap());

    let page = response_json(
        app.request(Method::GET, "/api/v1/orders?status=paid", None, Some(&buyer))
            .await,
    )
    .await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["orders"][0]["id"], first["id"]);
}

#[tokio::test]
async fn seller_ships_and_delivers_a_paid_order() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    let buyer = app.buyer_token();
    let seller = app.token_for(SELLER, None);
    let order = place_order(&app, &buyer, "L1", 1).await;
    let id = order["id"].as_str().unwrap();
    app.state
        .services
        .orders
        .mark_paid(id.parse().unwrap())
        .await
        .unwrap();

    let response = patch(
        &app,
        id,
        json!({ "status": "shipped", "trackingNumber": "1Z999" }),
        &seller,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], "shipped");
    assert_eq!(body["trackingNumber"], "1Z999");

    let response = patch(&app, id, json!({ "status": "delivered" }), &seller).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["status"], "delivered");

    // Terminal: nothing moves a delivered order
    let response = patch(&app, id, json!({ "status": "cancelled" }), &buyer).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response_json(response).await["error"],
        "Bad request: Order is already delivered"
    );
}

#[tokio::test]
async fn buyers_cannot_ship_or_set_tracking() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    let buyer = app.buyer_token();
    let order = place_order(&app, &buyer, "L1", 1).await;
    let id = order["id"].as_str().unwrap();
    app.state
        .services
        .orders
        .mark_paid(id.parse().unwrap())
        .await
        .unwrap();

    let response = patch(&app, id, json!({ "status": "shipped" }), &buyer).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = patch(&app, id, json!({ "trackingNumber": "1Z999" }), &buyer).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let stranger = app.token_for("someone-else", None);
    let response = patch(&app, id, json!({ "notes": "hi" }), &stranger).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn paid_cannot_be_set_through_the_api() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    let buyer = app.buyer_token();
    let seller = app.token_for(SELLER, None);
    let order = place_order(&app, &buyer, "L1", 1).await;
    let id = order["id"].as_str().unwrap();

    for token in [&buyer, &seller] {
        let response = patch(&app, id, json!({ "status": "paid" }), token).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    let view = app
        .state
        .services
        .orders
        .order_view(id.parse().unwrap())
        .await
        .unwrap();
    assert_eq!(view.status, OrderStatus::Pending);
}

#[tokio::test]
async fn illegal_transitions_are_rejected() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    let buyer = app.buyer_token();
    let seller = app.token_for(SELLER, None);
    let order = place_order(&app, &buyer, "L1", 1).await;
    let id = order["id"].as_str().unwrap();

    // Pending orders cannot skip payment
    let response = patch(&app, id, json!({ "status": "shipped" }), &seller).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = patch(&app, id, json!({ "status": "refunded" }), &seller).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancelling_returns_stock_once() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    let buyer = app.buyer_token();
    let order = place_order(&app, &buyer, "L1", 2).await;
    let id = order["id"].as_str().unwrap();
    assert_eq!(app.inventory("L1").await, 3);

    let response = patch(&app, id, json!({ "status": "cancelled" }), &buyer).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["status"], "cancelled");
    assert_eq!(app.inventory("L1").await, 5);

    // Repeating the cancel is a no-op and must not restock again
    let response = patch(&app, id, json!({ "status": "cancelled" }), &buyer).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.inventory("L1").await, 5);

    // A late payment does not revive it
    assert!(!app
        .state
        .services
        .orders
        .mark_paid(id.parse().unwrap())
        .await
        .unwrap());
}

#[tokio::test]
async fn notes_update_without_a_status_change() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    let buyer = app.buyer_token();
    let order = place_order(&app, &buyer, "L1", 1).await;
    let id = order["id"].as_str().unwrap();

    let response = patch(&app, id, json!({ "notes": "leave at the door" }), &buyer).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["notes"], "leave at the door");
    assert_eq!(body["status"], "pending");
    assert_eq!(body["buyerId"], BUYER);
}
