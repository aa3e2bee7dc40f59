use super::provider::{
    CheckoutSession, CheckoutSessionRequest, PaymentIntent, PaymentIntentRequest, PaymentProvider,
};
use crate::errors::ServiceError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Payment provider that keeps everything in memory.
///
/// Backs the `mock` provider setting and the test suite. Failure switches let
/// callers simulate provider outages per operation.
#[derive(Debug, Default)]
pub struct InMemoryPaymentProvider {
    sessions: DashMap<String, CheckoutSession>,
    session_amounts: DashMap<String, i64>,
    intents: DashMap<String, PaymentIntent>,
    intent_amounts: DashMap<String, i64>,
    counter: AtomicU64,
    fail_checkout_sessions: AtomicBool,
    fail_payment_intents: AtomicBool,
    fail_metadata_updates: AtomicBool,
}

impl InMemoryPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}_mock_{:06}", prefix, n)
    }

    pub fn fail_checkout_sessions(&self, fail: bool) {
        self.fail_checkout_sessions.store(fail, Ordering::SeqCst);
    }

    pub fn fail_payment_intents(&self, fail: bool) {
        self.fail_payment_intents.store(fail, Ordering::SeqCst);
    }

    pub fn fail_metadata_updates(&self, fail: bool) {
        self.fail_metadata_updates.store(fail, Ordering::SeqCst);
    }

    /// Simulates the buyer completing the hosted checkout page.
    pub fn mark_session_paid(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.payment_status = Some("paid".to_string());
                true
            }
            None => false,
        }
    }

    /// Registers a session directly, for sessions created outside this process.
    pub fn insert_session(&self, session: CheckoutSession) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn session(&self, session_id: &str) -> Option<CheckoutSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn session_amount(&self, session_id: &str) -> Option<i64> {
        self.session_amounts.get(session_id).map(|a| *a)
    }

    pub fn intent(&self, payment_intent_id: &str) -> Option<PaymentIntent> {
        self.intents.get(payment_intent_id).map(|i| i.clone())
    }

    pub fn intent_amount(&self, payment_intent_id: &str) -> Option<i64> {
        self.intent_amounts.get(payment_intent_id).map(|a| *a)
    }
}

#[async_trait]
impl PaymentProvider for InMemoryPaymentProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ServiceError> {
        if self.fail_checkout_sessions.load(Ordering::SeqCst) {
            return Err(ServiceError::ExternalServiceError(
                "mock provider unavailable".to_string(),
            ));
        }

        let id = self.next_id("cs");
        let session = CheckoutSession {
            url: Some(format!("https://checkout.mock.local/pay/{}", id)),
            id: id.clone(),
            payment_status: Some("unpaid".to_string()),
            status: Some("open".to_string()),
            metadata: request.metadata,
            payment_intent: None,
        };
        self.sessions.insert(id.clone(), session.clone());
        self.session_amounts.insert(id.clone(), request.amount_total_cents);
        debug!(session_id = %id, "mock checkout session created");
        Ok(session)
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CheckoutSession>, ServiceError> {
        Ok(self.session(session_id))
    }

    async fn create_payment_intent(
        &self,
        request: PaymentIntentRequest,
    ) -> Result<PaymentIntent, ServiceError> {
        if self.fail_payment_intents.load(Ordering::SeqCst) {
            return Err(ServiceError::ExternalServiceError(
                "mock provider unavailable".to_string(),
            ));
        }

        let id = self.next_id("pi");
        let intent = PaymentIntent {
            client_secret: Some(format!("{}_secret", id)),
            id: id.clone(),
            status: Some("requires_payment_method".to_string()),
            metadata: request.metadata,
        };
        self.intents.insert(id.clone(), intent.clone());
        self.intent_amounts.insert(id.clone(), request.amount_cents);
        debug!(payment_intent_id = %id, "mock payment intent created");
        Ok(intent)
    }

    async fn update_payment_intent_metadata(
        &self,
        payment_intent_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<PaymentIntent, ServiceError> {
        if self.fail_metadata_updates.load(Ordering::SeqCst) {
            return Err(ServiceError::ExternalServiceError(
                "mock provider unavailable".to_string(),
            ));
        }

        let mut intent = self.intents.get_mut(payment_intent_id).ok_or_else(|| {
            ServiceError::NotFound(format!("PaymentIntent {} not found", payment_intent_id))
        })?;
        intent.metadata.extend(metadata);
        Ok(intent.clone())
    }

    async fn cancel_payment_intent(&self, payment_intent_id: &str) -> Result<(), ServiceError> {
        let mut intent = self.intents.get_mut(payment_intent_id).ok_or_else(|| {
            ServiceError::NotFound(format!("PaymentIntent {} not found", payment_intent_id))
        })?;
        intent.status = Some("canceled".to_string());
        Ok(())
    }

    async fn expire_checkout_session(&self, session_id: &str) -> Result<(), ServiceError> {
        let mut session = self.sessions.get_mut(session_id).ok_or_else(|| {
            ServiceError::NotFound(format!("Checkout session {} not found", session_id))
        })?;
        session.status = Some("expired".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent_request() -> PaymentIntentRequest {
        PaymentIntentRequest {
            amount_cents: 5650,
            currency: "USD".into(),
            metadata: HashMap::from([("buyerId".to_string(), "b-1".to_string())]),
        }
    }

    #[tokio::test]
    async fn metadata_updates_merge() {
        let provider = InMemoryPaymentProvider::new();
        let intent = provider.create_payment_intent(intent_request()).await.unwrap();

        provider
            .update_payment_intent_metadata(
                &intent.id,
                HashMap::from([("orderId".to_string(), "o-1".to_string())]),
            )
            .await
            .unwrap();

        let stored = provider.intent(&intent.id).unwrap();
        assert_eq!(stored.metadata.get("buyerId").map(String::as_str), Some("b-1"));
        assert_eq!(stored.metadata.get("orderId").map(String::as_str), Some("o-1"));
        assert_eq!(provider.intent_amount(&intent.id), Some(5650));
    }

    #[tokio::test]
    async fn unknown_sessions_are_none() {
        let provider = InMemoryPaymentProvider::new();
        assert!(provider
            .retrieve_checkout_session("cs_missing")
            .await
            .unwrap()
            .is_none());
        assert!(!provider.mark_session_paid("cs_missing"));
    }

    #[tokio::test]
    async fn failure_switch_applies_per_operation() {
        let provider = InMemoryPaymentProvider::new();
        provider.fail_payment_intents(true);
        assert!(provider.create_payment_intent(intent_request()).await.is_err());
        provider.fail_payment_intents(false);
        assert!(provider.create_payment_intent(intent_request()).await.is_ok());
    }
}
