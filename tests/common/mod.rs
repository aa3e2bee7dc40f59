#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use http_body_util::BodyExt;
use marketplace_checkout::{
    config::AppConfig,
    db,
    entities::{listing, Listing, ListingModel},
    events::{self, EventSender},
    services::{
        notifications::{EmailError, EmailMessage, EmailSender},
        payments::{InMemoryPaymentProvider, PaymentProvider},
    },
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;

pub const JWT_SECRET: &str = "k3J9xP2mQ7vR4tY8wZ1aB5cD6eF0gH3i";
pub const WEBHOOK_SECRET: &str = "whsec_test_5f1c2a9e7b3d";
pub const BUYER: &str = "buyer-1";
pub const BUYER_EMAIL: &str = "buyer@example.com";
pub const SELLER: &str = "seller-1";

/// Email sender that keeps every message for inspection.
#[derive(Debug, Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<EmailMessage>>,
    fail: AtomicBool,
}

impl RecordingEmailSender {
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(&self, message: EmailMessage) -> Result<(), EmailError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EmailError::Rejected {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

/// Which external collaborators a [`TestApp`] is wired with.
#[derive(Debug, Clone)]
pub struct TestOptions {
    pub payment_provider: bool,
    pub email: bool,
    pub webhook_secret: Option<String>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            payment_provider: true,
            email: true,
            webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        }
    }
}

/// Helper harness for spinning up the application against an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub provider: Arc<InMemoryPaymentProvider>,
    pub emails: Arc<RecordingEmailSender>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_options(TestOptions::default()).await
    }

    pub async fn with_options(options: TestOptions) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "test".to_string(),
        );
        // One connection: every pooled connection would otherwise get its own empty database.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.app_base_url = "https://shop.test".to_string();
        cfg.payment_webhook_secret = options.webhook_secret.clone();
        if options.payment_provider {
            cfg.payment_provider = Some("mock".to_string());
        }

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let provider = Arc::new(InMemoryPaymentProvider::new());
        let emails = Arc::new(RecordingEmailSender::default());
        let provider_dyn: Option<Arc<dyn PaymentProvider>> = options
            .payment_provider
            .then(|| provider.clone() as Arc<dyn PaymentProvider>);
        let email_dyn: Option<Arc<dyn EmailSender>> = options
            .email
            .then(|| emails.clone() as Arc<dyn EmailSender>);

        let state = AppState::new(
            Arc::new(pool),
            Arc::new(cfg),
            event_sender,
            provider_dyn,
            email_dyn,
        );
        let router = marketplace_checkout::app(state.clone());

        Self {
            router,
            state,
            provider,
            emails,
            _event_task: event_task,
        }
    }

    pub fn token_for(&self, user_id: &str, email: Option<&str>) -> String {
        self.state
            .auth
            .issue_token(user_id, email, 3600)
            .expect("issue test token")
    }

    pub fn buyer_token(&self) -> String {
        self.token_for(BUYER, Some(BUYER_EMAIL))
    }

    pub async fn seed_listing(
        &self,
        id: &str,
        seller_id: &str,
        price: Decimal,
        inventory: i32,
    ) -> ListingModel {
        let now = Utc::now();
        listing::ActiveModel {
            id: Set(id.to_string()),
            seller_id: Set(seller_id.to_string()),
            title: Set(format!("Listing {}", id)),
            price: Set(price),
            inventory: Set(inventory),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed listing")
    }

    pub async fn deactivate_listing(&self, id: &str) {
        let listing = self.listing(id).await;
        let mut active: listing::ActiveModel = listing.into();
        active.is_active = Set(false);
        active
            .update(&*self.state.db)
            .await
            .expect("deactivate listing");
    }

    pub async fn listing(&self, id: &str) -> ListingModel {
        Listing::find_by_id(id.to_string())
            .one(&*self.state.db)
            .await
            .expect("load listing")
            .expect("listing exists")
    }

    pub async fn inventory(&self, id: &str) -> i32 {
        self.listing(id).await.inventory
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        self.send(builder.body(body).expect("failed to build request"))
            .await
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Delivers a raw webhook body, signed with [`WEBHOOK_SECRET`] unless a header is given.
    pub async fn deliver_webhook(&self, payload: &Value, signature: Option<String>) -> Response {
        let body = serde_json::to_vec(payload).expect("serialize webhook");
        let signature = match signature {
            Some(signature) => signature,
            None => marketplace_checkout::services::payments::webhook::sign_payload(
                &body,
                WEBHOOK_SECRET,
                Utc::now().timestamp(),
            )
            .expect("sign webhook"),
        };

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header("content-type", "application/json")
            .header("stripe-signature", signature)
            .body(Body::from(body))
            .expect("failed to build webhook request");
        self.send(request).await
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("response body bytes")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json response")
}

/// Reads a decimal that may be serialized as a string or a number.
pub fn money(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("not a monetary value: {}", other),
    }
}

pub fn shipping_address() -> Value {
    serde_json::json!({
        "name": "Ada Buyer",
        "line1": "1 Market St",
        "city": "Springfield",
        "postalCode": "12345",
        "country": "US"
    })
}
