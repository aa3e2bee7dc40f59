use crate::{config::AppConfig, errors::ServiceError, services::orders::OrderView};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Email provider returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Transactional email delivery. Callers treat failures as non-fatal.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<(), EmailError>;
}

/// SendGrid v3 mail send client
#[derive(Clone)]
pub struct SendGridEmailSender {
    api_key: String,
    api_base: String,
    from: String,
    client: reqwest::Client,
}

impl SendGridEmailSender {
    pub fn new(
        api_key: impl Into<String>,
        api_base: impl Into<String>,
        from: impl Into<String>,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("HTTP client error: {}", e)))?;
        Ok(Self {
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            from: from.into(),
            client,
        })
    }
}

#[async_trait]
impl EmailSender for SendGridEmailSender {
    #[instrument(skip(self, message), fields(to = %message.to))]
    async fn send(&self, message: EmailMessage) -> Result<(), EmailError> {
        let body = json!({
            "personalizations": [{"to": [{"email": message.to}]}],
            "from": {"email": self.from},
            "subject": message.subject,
            "content": [{"type": "text/plain", "value": message.text}],
        });

        let response = self
            .client
            .post(format!("{}/v3/mail/send", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Rejected { status, body });
        }
        Ok(())
    }
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: EmailMessage) -> Result<(), EmailError> {
        info!(to = %message.to, subject = %message.subject, "email (log only)");
        Ok(())
    }
}

/// Builds the sender named by `email_provider`, if any.
pub fn email_sender_from_config(
    config: &AppConfig,
) -> Result<Option<Arc<dyn EmailSender>>, ServiceError> {
    match config.email_provider.as_deref() {
        None => Ok(None),
        Some("log") => Ok(Some(Arc::new(LogEmailSender))),
        Some("sendgrid") => {
            let key = config.sendgrid_api_key.as_deref().ok_or_else(|| {
                ServiceError::InternalError(
                    "sendgrid_api_key is required when email_provider is sendgrid".to_string(),
                )
            })?;
            let from = config.email_from.as_deref().ok_or_else(|| {
                ServiceError::InternalError(
                    "email_from is required when email_provider is sendgrid".to_string(),
                )
            })?;
            Ok(Some(Arc::new(SendGridEmailSender::new(
                key,
                config.sendgrid_api_base.as_str(),
                from,
            )?)))
        }
        Some(other) => Err(ServiceError::InternalError(format!(
            "Unknown email provider '{}'",
            other
        ))),
    }
}

pub fn order_confirmation_email(to: &str, order: &OrderView) -> EmailMessage {
    let short_id = short_order_id(&order.id.to_string());
    let mut text = format!("Thanks for your order #{}.\n\n", short_id);
    for item in &order.items {
        text.push_str(&format!(
            "{} x{} @ {} {}\n",
            item.title, item.quantity, item.unit_price, order.currency
        ));
    }
    text.push_str(&format!(
        "\nSubtotal: {sub}\nShipping: {ship}\nTax: {tax}\nFees: {fees}\nTotal: {total} {cur}\n",
        sub = order.subtotal,
        ship = order.shipping_cost,
        tax = order.tax,
        fees = order.fees,
        total = order.total,
        cur = order.currency,
    ));

    EmailMessage {
        to: to.to_string(),
        subject: format!("Order #{} confirmed", short_id),
        text,
    }
}

/// First eight characters of an order id, for display only.
pub fn short_order_id(order_id: &str) -> String {
    order_id.chars().take(8).collect()
}
