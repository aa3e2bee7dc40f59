use super::provider::{
    CheckoutSession, CheckoutSessionRequest, PaymentIntent, PaymentIntentRequest, PaymentProvider,
};
use crate::errors::ServiceError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Stripe REST client (form-encoded requests, secret key as basic auth user).
#[derive(Clone)]
pub struct StripeProvider {
    secret_key: String,
    api_base: String,
    client: reqwest::Client,
}

impl StripeProvider {
    pub fn new(secret_key: impl Into<String>, api_base: impl Into<String>) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            secret_key: secret_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_base, path)
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<T, ServiceError> {
        let response = self
            .client
            .post(self.url(path))
            .basic_auth(&self.secret_key, Some(""))
            .form(params)
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("Stripe API error: {}", e)))?;

        parse_response(response).await
    }
}

async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ServiceError> {
    if !response.status().is_success() {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        warn!(status = %status, "Stripe API error: {}", error_text);
        return Err(ServiceError::ExternalServiceError(format!(
            "Stripe returned {}",
            status
        )));
    }

    response.json().await.map_err(|e| {
        ServiceError::ExternalServiceError(format!("Failed to parse Stripe response: {}", e))
    })
}

/// Provider ids end up in URL paths, so only plain identifiers are accepted.
fn check_id(id: &str) -> Result<(), ServiceError> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ServiceError::BadRequest(format!("Invalid provider id '{}'", id)));
    }
    Ok(())
}

fn metadata_params(metadata: &HashMap<String, String>, params: &mut Vec<(String, String)>) {
    let mut entries: Vec<_> = metadata.iter().collect();
    entries.sort();
    for (key, value) in entries {
        params.push((format!("metadata[{}]", key), value.clone()));
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn name(&self) -> &'static str {
        "stripe"
    }

    #[instrument(skip(self, request))]
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ServiceError> {
        let mut params = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), request.success_url),
            ("cancel_url".to_string(), request.cancel_url),
            (
                "line_items[0][price_data][currency]".to_string(),
                request.currency.to_lowercase(),
            ),
            (
                "line_items[0][price_data][unit_amount]".to_string(),
                request.amount_total_cents.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]".to_string(),
                request.description,
            ),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
        ];
        if let Some(email) = request.customer_email {
            params.push(("customer_email".to_string(), email));
        }
        metadata_params(&request.metadata, &mut params);

        let session: CheckoutSession = self.post_form("checkout/sessions", &params).await?;
        info!(session_id = %session.id, "Stripe checkout session created");
        Ok(session)
    }

    #[instrument(skip(self))]
    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CheckoutSession>, ServiceError> {
        if check_id(session_id).is_err() {
            return Ok(None);
        }

        let response = self
            .client
            .get(self.url(&format!("checkout/sessions/{}", session_id)))
            .basic_auth(&self.secret_key, Some(""))
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("Stripe API error: {}", e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        parse_response(response).await.map(Some)
    }

    #[instrument(skip(self, request))]
    async fn create_payment_intent(
        &self,
        request: PaymentIntentRequest,
    ) -> Result<PaymentIntent, ServiceError> {
        let mut params = vec![
            ("amount".to_string(), request.amount_cents.to_string()),
            ("currency".to_string(), request.currency.to_lowercase()),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
        ];
        metadata_params(&request.metadata, &mut params);

        let intent: PaymentIntent = self.post_form("payment_intents", &params).await?;
        info!(payment_intent_id = %intent.id, "PaymentIntent created");
        Ok(intent)
    }

    #[instrument(skip(self, metadata))]
    async fn update_payment_intent_metadata(
        &self,
        payment_intent_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<PaymentIntent, ServiceError> {
        check_id(payment_intent_id)?;
        let mut params = Vec::with_capacity(metadata.len());
        metadata_params(&metadata, &mut params);
        self.post_form(&format!("payment_intents/{}", payment_intent_id), &params)
            .await
    }

    #[instrument(skip(self))]
    async fn cancel_payment_intent(&self, payment_intent_id: &str) -> Result<(), ServiceError> {
        check_id(payment_intent_id)?;
        let _: PaymentIntent = self
            .post_form(&format!("payment_intents/{}/cancel", payment_intent_id), &[])
            .await?;
        info!(payment_intent_id = %payment_intent_id, "PaymentIntent cancelled");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn expire_checkout_session(&self, session_id: &str) -> Result<(), ServiceError> {
        check_id(session_id)?;
        let _: CheckoutSession = self
            .post_form(&format!("checkout/sessions/{}/expire", session_id), &[])
            .await?;
        info!(session_id = %session_id, "Stripe checkout session expired");
        Ok(())
    }
}
