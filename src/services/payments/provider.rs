use crate::errors::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Parameters for a provider-hosted checkout page.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSessionRequest {
    pub amount_total_cents: i64,
    pub currency: String,
    pub description: String,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_email: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    /// `"paid"`, `"unpaid"` or `"no_payment_required"`
    #[serde(default)]
    pub payment_status: Option<String>,
    /// `"open"`, `"complete"` or `"expired"`
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub payment_intent: Option<String>,
}

impl CheckoutSession {
    pub fn is_paid(&self) -> bool {
        self.payment_status.as_deref() == Some("paid")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentIntentRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// External payment processor.
///
/// Every call is a single round trip with no retries; callers decide what a
/// failure means for the order.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Short identifier stored on payment records.
    fn name(&self) -> &'static str;

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ServiceError>;

    /// Returns `None` when the provider does not know the session.
    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CheckoutSession>, ServiceError>;

    async fn create_payment_intent(
        &self,
        request: PaymentIntentRequest,
    ) -> Result<PaymentIntent, ServiceError>;

    /// Merges `metadata` into the intent's existing metadata.
    async fn update_payment_intent_metadata(
        &self,
        payment_intent_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<PaymentIntent, ServiceError>;

    async fn cancel_payment_intent(&self, payment_intent_id: &str) -> Result<(), ServiceError>;

    /// Closes an open hosted checkout page so it can no longer be paid.
    async fn expire_checkout_session(&self, session_id: &str) -> Result<(), ServiceError>;
}

impl std::fmt::Debug for dyn PaymentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentProvider").field("name", &self.name()).finish()
    }
}
