//! Checkout: order creation, hosted checkout sessions and embedded payment intents.

mod common;

use axum::http::{Method, StatusCode};
use common::{money, response_json, shipping_address, TestApp, TestOptions, BUYER, SELLER};
use marketplace_checkout::entities::{OrderStatus, PaymentStatus};
use rust_decimal_macros::dec;
use sea_orm::ConnectionTrait;
use serde_json::{json, Value};
use uuid::Uuid;

fn checkout_body(items: Value) -> Value {
    json!({
        "cartItems": items,
        "shippingAddress": shipping_address(),
    })
}

async fn add_to_cart(app: &TestApp, token: &str, listing_id: &str, qty: i32, price: &str) {
    let response = app
        .request(
            Method::POST,
            "/api/v1/cart",
            Some(json!({
                "listingId": listing_id,
                "sellerId": SELLER,
                "qty": qty,
                "priceAtAdd": price,
            })),
            Some(token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn order_is_priced_from_the_cart_snapshot() {
    let app = TestApp::new().await;
    // Listing price has moved since the buyer added it
    app.seed_listing("L1", SELLER, dec!(30.00), 5).await;
    let token = app.buyer_token();

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(checkout_body(json!([
                { "listingId": "L1", "sellerId": SELLER, "qty": 2, "priceAtAdd": "25.00" }
            ]))),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let order = response_json(response).await;
    assert_eq!(order["status"], "pending");
    assert_eq!(order["buyerId"], BUYER);
    assert_eq!(money(&order["subtotal"]), dec!(50.00));
    assert_eq!(money(&order["tax"]), dec!(4.00));
    assert_eq!(money(&order["fees"]), dec!(2.50));
    assert_eq!(money(&order["total"]), dec!(56.50));
    assert_eq!(money(&order["items"][0]["unitPrice"]), dec!(25.00));
    assert_eq!(order["items"][0]["sellerId"], SELLER);
    assert!(order.get("buyerEmail").is_none());

    assert_eq!(app.inventory("L1").await, 3);
}

#[tokio::test]
async fn shipping_and_explicit_tax_rate_are_priced() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(100.00), 1).await;

    let order = app
        .state
        .services
        .orders
        .create_order(
            BUYER,
            None,
            &serde_json::from_value(json!({
                "items": [{ "listingId": "L1", "quantity": 1, "priceAtAdd": "100.00" }],
                "shippingAddress": shipping_address(),
                "selectedShipping": { "carrier": "ups", "price": "10.00" },
                "taxRate": "0.10"
            }))
            .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(order.shipping_cost, dec!(10.00));
    assert_eq!(order.tax, dec!(10.00));
    assert_eq!(order.fees, dec!(5.50));
    assert_eq!(order.total, dec!(125.50));
}

#[tokio::test]
async fn order_validation_failures_write_nothing() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    app.seed_listing("L2", SELLER, dec!(10.00), 1).await;
    let token = app.buyer_token();

    let cases = [
        (json!({ "shippingAddress": shipping_address() }), StatusCode::BAD_REQUEST),
        (
            json!({ "cartItems": [{ "listingId": "L1", "qty": 1, "priceAtAdd": "25.00" }] }),
            StatusCode::BAD_REQUEST,
        ),
        (
            checkout_body(json!([{ "listingId": "nope", "qty": 1, "priceAtAdd": "1.00" }])),
            StatusCode::NOT_FOUND,
        ),
        (
            checkout_body(json!([
                { "listingId": "L1", "qty": 1, "priceAtAdd": "25.00" },
                { "listingId": "L2", "qty": 2, "priceAtAdd": "10.00" }
            ])),
            StatusCode::BAD_REQUEST,
        ),
        (
            json!({
                "cartItems": [{ "listingId": "L1", "qty": 1, "priceAtAdd": "25.00" }],
                "shippingAddress": shipping_address(),
                "taxRate": "1.5"
            }),
            StatusCode::BAD_REQUEST,
        ),
    ];

    for (body, expected) in cases {
        let response = app
            .request(Method::POST, "/api/v1/orders", Some(body), Some(&token))
            .await;
        assert_eq!(response.status(), expected);
        let error = response_json(response).await;
        assert_eq!(error["success"], false);
    }

    assert_eq!(app.inventory("L1").await, 5);
    assert_eq!(app.inventory("L2").await, 1);
    let list = app
        .request(Method::GET, "/api/v1/orders", None, Some(&token))
        .await;
    assert_eq!(response_json(list).await["total"], 0);
}

#[tokio::test]
async fn oversized_prices_are_rejected_on_every_checkout_path() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    let token = app.buyer_token();
    let huge = "79228162514264337593543950335";

    for uri in [
        "/api/v1/orders",
        "/api/v1/payments/create-checkout-session",
        "/api/v1/payments/create-intent",
    ] {
        let response = app
            .request(
                Method::POST,
                uri,
                Some(checkout_body(json!([
                    { "listingId": "L1", "qty": 2, "priceAtAdd": huge }
                ]))),
                Some(&token),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        let body = response_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("priceAtAdd"));
    }

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "cartItems": [{ "listingId": "L1", "qty": 1, "priceAtAdd": "25.00" }],
                "shippingAddress": shipping_address(),
                "selectedShipping": { "carrier": "freight", "price": huge }
            })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(app.inventory("L1").await, 5);
}

#[tokio::test]
async fn invalid_shipping_address_reports_field_details() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    let token = app.buyer_token();

    let mut address = shipping_address();
    address["country"] = json!("USA");
    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "cartItems": [{ "listingId": "L1", "qty": 1, "priceAtAdd": "25.00" }],
                "shippingAddress": address,
            })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = response_json(response).await;
    assert!(body["details"]["country"].is_array());
}

#[tokio::test]
async fn inactive_listings_cannot_be_ordered() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    app.deactivate_listing("L1").await;
    let token = app.buyer_token();

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(checkout_body(json!([
                { "listingId": "L1", "qty": 1, "priceAtAdd": "25.00" }
            ]))),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("no longer available"));
}

#[tokio::test]
async fn purchased_lines_leave_the_cart() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    let token = app.buyer_token();
    add_to_cart(&app, &token, "L1", 1, "25.00").await;
    add_to_cart(&app, &token, "L2", 1, "10.00").await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(checkout_body(json!([
                { "listingId": "L1", "qty": 1, "priceAtAdd": "25.00" }
            ]))),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let cart = response_json(
        app.request(Method::GET, "/api/v1/cart", None, Some(&token))
            .await,
    )
    .await;
    let items = cart["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["listingId"], "L2");
}

#[tokio::test]
async fn checkout_session_reserves_stock_and_records_a_payment() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    let token = app.buyer_token();
    add_to_cart(&app, &token, "L1", 2, "25.00").await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/create-checkout-session",
            Some(checkout_body(json!([
                { "listingId": "L1", "sellerId": SELLER, "qty": 2, "priceAtAdd": "25.00" }
            ]))),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    let session_id = body["sessionId"].as_str().unwrap().to_string();
    let order_id: Uuid = body["orderId"].as_str().unwrap().parse().unwrap();
    assert!(body["url"].as_str().unwrap().contains(&session_id));

    let session = app.provider.session(&session_id).expect("session stored");
    assert_eq!(session.metadata["orderId"], order_id.to_string());
    assert_eq!(app.provider.session_amount(&session_id), Some(5650));

    let order = app.state.services.orders.order_view(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.checkout_session_id.as_deref(), Some(session_id.as_str()));
    assert_eq!(app.inventory("L1").await, 3);

    let payments = app
        .state
        .services
        .payments
        .payments_for_order(order_id)
        .await
        .unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Pending);
    assert_eq!(payments[0].provider_ref, session_id);
    assert_eq!(payments[0].attempt, 1);

    let cart = response_json(
        app.request(Method::GET, "/api/v1/cart", None, Some(&token))
            .await,
    )
    .await;
    assert_eq!(cart["items"], json!([]));
}

#[tokio::test]
async fn provider_failure_cancels_the_order_and_restocks() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 2).await;
    app.provider.fail_checkout_sessions(true);
    let token = app.buyer_token();

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/create-checkout-session",
            Some(checkout_body(json!([
                { "listingId": "L1", "qty": 2, "priceAtAdd": "25.00" }
            ]))),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response_json(response).await;
    assert_eq!(
        body["error"],
        "Internal error: Failed to create checkout session"
    );

    assert_eq!(app.inventory("L1").await, 2);

    let list = response_json(
        app.request(Method::GET, "/api/v1/orders", None, Some(&token))
            .await,
    )
    .await;
    assert_eq!(list["total"], 1);
    assert_eq!(list["orders"][0]["status"], "cancelled");
}

/// Makes every payment record write fail from here on.
async fn break_payment_records(app: &TestApp) {
    app.state
        .db
        .execute_unprepared("DROP TABLE payments")
        .await
        .expect("drop payments table");
}

#[tokio::test]
async fn unrecorded_checkout_session_is_expired_and_the_order_cancelled() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 2).await;
    let token = app.buyer_token();
    break_payment_records(&app).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/create-checkout-session",
            Some(checkout_body(json!([
                { "listingId": "L1", "qty": 2, "priceAtAdd": "25.00" }
            ]))),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response_json(response).await["error"],
        "Internal error: Failed to create checkout session"
    );
    assert_eq!(app.inventory("L1").await, 2);

    let list = response_json(
        app.request(Method::GET, "/api/v1/orders", None, Some(&token))
            .await,
    )
    .await;
    assert_eq!(list["orders"][0]["status"], "cancelled");
    let session_id = list["orders"][0]["checkoutSessionId"].as_str().unwrap();
    let session = app.provider.session(session_id).unwrap();
    assert_eq!(session.status.as_deref(), Some("expired"));
}

#[tokio::test]
async fn unrecorded_payment_intent_is_cancelled_with_its_order() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 2).await;
    let token = app.buyer_token();
    break_payment_records(&app).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/create-intent",
            Some(checkout_body(json!([
                { "listingId": "L1", "qty": 1, "priceAtAdd": "25.00" }
            ]))),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response_json(response).await["error"],
        "Internal error: Failed to create payment intent"
    );
    assert_eq!(app.inventory("L1").await, 2);

    let list = response_json(
        app.request(Method::GET, "/api/v1/orders", None, Some(&token))
            .await,
    )
    .await;
    assert_eq!(list["orders"][0]["status"], "cancelled");
    let intent_id = list["orders"][0]["paymentIntentId"].as_str().unwrap();
    let intent = app.provider.intent(intent_id).unwrap();
    assert_eq!(intent.status.as_deref(), Some("canceled"));
}

#[tokio::test]
async fn checkout_session_needs_payment_and_email_configuration() {
    let app = TestApp::with_options(TestOptions {
        email: false,
        ..TestOptions::default()
    })
    .await;
    app.seed_listing("L1", SELLER, dec!(25.00), 2).await;
    let token = app.buyer_token();

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/create-checkout-session",
            Some(checkout_body(json!([
                { "listingId": "L1", "qty": 1, "priceAtAdd": "25.00" }
            ]))),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response_json(response).await;
    assert_eq!(body["error"], "Internal error: Payment service not configured");
    assert_eq!(app.inventory("L1").await, 2);
}

#[tokio::test]
async fn payment_intent_is_created_before_the_order_and_linked_after() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    let token = app.buyer_token();

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/create-intent",
            Some(checkout_body(json!([
                { "listingId": "L1", "qty": 2, "priceAtAdd": "25.00" }
            ]))),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    let intent_id = body["paymentIntentId"].as_str().unwrap().to_string();
    let order_id: Uuid = body["orderId"].as_str().unwrap().parse().unwrap();
    assert_eq!(money(&body["total"]), dec!(56.50));
    assert_eq!(money(&body["fees"]), dec!(2.50));
    assert_eq!(money(&body["tax"]), dec!(4.00));
    assert!(body["clientSecret"].as_str().unwrap().starts_with(&intent_id));

    let intent = app.provider.intent(&intent_id).expect("intent stored");
    assert_eq!(intent.metadata["orderId"], order_id.to_string());
    assert_eq!(intent.metadata["buyerId"], BUYER);
    assert_eq!(app.provider.intent_amount(&intent_id), Some(5650));

    let order = app
        .state
        .services
        .orders
        .find_by_payment_intent(&intent_id)
        .await
        .unwrap()
        .expect("order stored with intent");
    assert_eq!(order.id, order_id);
    assert!(order.intent_linked);
    assert_eq!(app.inventory("L1").await, 3);
}

#[tokio::test]
async fn failed_intent_backfill_does_not_fail_checkout() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    app.provider.fail_metadata_updates(true);
    let token = app.buyer_token();

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/create-intent",
            Some(checkout_body(json!([
                { "listingId": "L1", "qty": 1, "priceAtAdd": "25.00" }
            ]))),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    let intent_id = body["paymentIntentId"].as_str().unwrap();

    let order = app
        .state
        .services
        .orders
        .find_by_payment_intent(intent_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!order.intent_linked);
    assert!(app
        .provider
        .intent(intent_id)
        .unwrap()
        .metadata
        .get("orderId")
        .is_none());
}

#[tokio::test]
async fn stock_taken_after_pricing_fails_persistence() {
    let app = TestApp::new().await;
    app.seed_listing("L1", SELLER, dec!(25.00), 1).await;

    let input = serde_json::from_value(checkout_body(json!([
        { "listingId": "L1", "qty": 1, "priceAtAdd": "25.00" }
    ])))
    .unwrap();
    let prepared = app.state.services.orders.prepare_order(&input).await.unwrap();

    // Someone else buys the last unit between pricing and persistence
    app.state
        .services
        .orders
        .persist_order("buyer-2", None, &prepared, None, true)
        .await
        .unwrap();

    let result = app
        .state
        .services
        .orders
        .persist_order(BUYER, None, &prepared, Some("pi_x"), false)
        .await;
    assert!(result.is_err());
    assert_eq!(app.inventory("L1").await, 0);
}

#[tokio::test]
async fn payment_intent_requires_a_provider() {
    let app = TestApp::with_options(TestOptions {
        payment_provider: false,
        ..TestOptions::default()
    })
    .await;
    app.seed_listing("L1", SELLER, dec!(25.00), 5).await;
    let token = app.buyer_token();

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/create-intent",
            Some(checkout_body(json!([
                { "listingId": "L1", "qty": 1, "priceAtAdd": "25.00" }
            ]))),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(app.inventory("L1").await, 5);
}
