use crate::{
    config::AppConfig,
    entities::OrderStatus,
    errors::ServiceError,
    services::{
        checkout_service::{link_intent, ORDER_ID_METADATA_KEY},
        notifications::{order_confirmation_email, short_order_id, EmailSender},
        orders::{OrderService, OrderView},
        payments::{
            webhook::{verify_signature, WebhookEvent},
            PaymentProvider, PaymentService,
        },
    },
};
use chrono::Utc;
use futures::StreamExt;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const INVALID_SESSION: &str = "Invalid session or missing order";
const REPAIR_BATCH_SIZE: u64 = 100;
const REPAIR_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationResponse {
    pub order: ConfirmedOrder,
}

/// The only order fields exposed to the session-keyed confirmation page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedOrder {
    pub order_id: Uuid,
    pub order_id_short: String,
    pub status: OrderStatus,
    pub total: Decimal,
    pub item_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub attempted: usize,
    pub linked: usize,
}

/// Settles orders from the provider's view of their payments.
///
/// Order ids are always taken from provider data, never from the caller.
#[derive(Clone)]
pub struct ReconciliationService {
    orders: Arc<OrderService>,
    payments: Arc<PaymentService>,
    provider: Option<Arc<dyn PaymentProvider>>,
    email: Option<Arc<dyn EmailSender>>,
    config: Arc<AppConfig>,
}

impl ReconciliationService {
    pub fn new(
        orders: Arc<OrderService>,
        payments: Arc<PaymentService>,
        provider: Option<Arc<dyn PaymentProvider>>,
        email: Option<Arc<dyn EmailSender>>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            orders,
            payments,
            provider,
            email,
            config,
        }
    }

    fn provider(&self) -> Result<&Arc<dyn PaymentProvider>, ServiceError> {
        self.provider
            .as_ref()
            .ok_or_else(|| ServiceError::InternalError("Payment service not configured".to_string()))
    }

    /// Looks the order up through the provider session and settles it if the session is paid.
    #[instrument(skip(self))]
    pub async fn confirm_by_session(
        &self,
        session_id: &str,
    ) -> Result<ConfirmationResponse, ServiceError> {
        let provider = self.provider()?;
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(ServiceError::BadRequest(INVALID_SESSION.to_string()));
        }

        let session = provider
            .retrieve_checkout_session(session_id)
            .await
            .map_err(|e| {
                error!(error = %e, session_id = %session_id, "Failed to retrieve checkout session");
                ServiceError::InternalError("Failed to retrieve checkout session".to_string())
            })?
            .ok_or_else(|| ServiceError::BadRequest(INVALID_SESSION.to_string()))?;

        let order_id = session
            .metadata
            .get(ORDER_ID_METADATA_KEY)
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(|| {
                warn!(session_id = %session_id, "Checkout session carries no usable order id");
                ServiceError::BadRequest(INVALID_SESSION.to_string())
            })?;

        if session.is_paid() {
            self.settle(order_id, &session.id).await?;
        }

        let order = self.orders.order_view(order_id).await?;
        Ok(ConfirmationResponse {
            order: ConfirmedOrder {
                order_id_short: short_order_id(&order.id.to_string()),
                order_id: order.id,
                status: order.status,
                total: order.total,
                item_count: order.item_count(),
            },
        })
    }

    /// Verifies and applies one provider webhook delivery.
    #[instrument(skip(self, payload))]
    pub async fn handle_webhook(
        &self,
        signature: Option<&str>,
        payload: &[u8],
    ) -> Result<WebhookOutcome, ServiceError> {
        match self.config.payment_webhook_secret.as_deref() {
            Some(secret) => {
                let header = signature.ok_or_else(|| {
                    warn!("Payment webhook without signature header");
                    ServiceError::Unauthorized("missing webhook signature".to_string())
                })?;
                verify_signature(
                    header,
                    payload,
                    secret,
                    self.config.webhook_tolerance_secs(),
                    Utc::now().timestamp(),
                )
                .map_err(|e| {
                    warn!("Payment webhook signature verification failed");
                    e
                })?;
            }
            None if self.config.payment_provider.as_deref() == Some("mock") => {
                warn!("payment_webhook_secret is not set; accepting unsigned mock webhook")
            }
            None => {
                error!("payment_webhook_secret is not set; rejecting webhook");
                return Err(ServiceError::Unauthorized(
                    "webhook signing secret not configured".to_string(),
                ));
            }
        }

        let event: WebhookEvent = serde_json::from_slice(payload)
            .map_err(|e| ServiceError::BadRequest(format!("invalid webhook payload: {}", e)))?;
        info!(event_id = ?event.id, event_type = %event.event_type, "Payment webhook received");

        match event.event_type.as_str() {
            "checkout.session.completed" => {
                let unpaid = event
                    .data
                    .object
                    .get("payment_status")
                    .and_then(|s| s.as_str())
                    == Some("unpaid");
                let (Some(order_id), Some(session_id)) = (order_id_from(&event), event.object_id())
                else {
                    warn!("checkout.session.completed without order metadata");
                    return Ok(WebhookOutcome::Ignored);
                };
                if unpaid {
                    info!(order_id = %order_id, "Checkout completed but payment still pending");
                    return Ok(WebhookOutcome::Ignored);
                }
                self.settle_if_exists(order_id, session_id).await
            }
            "payment_intent.succeeded" => {
                let Some(intent_id) = event.object_id() else {
                    return Ok(WebhookOutcome::Ignored);
                };
                let order_id = match order_id_from(&event) {
                    Some(order_id) => Some(order_id),
                    None => self
                        .orders
                        .find_by_payment_intent(intent_id)
                        .await?
                        .map(|o| o.id),
                };
                match order_id {
                    Some(order_id) => self.settle_if_exists(order_id, intent_id).await,
                    None => {
                        warn!(payment_intent_id = %intent_id, "No order for succeeded payment intent");
                        Ok(WebhookOutcome::Ignored)
                    }
                }
            }
            "payment_intent.payment_failed" => {
                let Some(intent_id) = event.object_id() else {
                    return Ok(WebhookOutcome::Ignored);
                };
                match self.payments.mark_failed_by_ref(intent_id).await? {
                    Some(payment) => {
                        info!(order_id = %payment.order_id, payment_intent_id = %intent_id, "Payment failed");
                        Ok(WebhookOutcome::Processed)
                    }
                    None => Ok(WebhookOutcome::Ignored),
                }
            }
            other => {
                info!("Unhandled payment webhook type: {}", other);
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    /// Retries the order id backfill for intents that never received it.
    #[instrument(skip(self))]
    pub async fn repair_unlinked_intents(&self) -> Result<RepairReport, ServiceError> {
        let Some(provider) = self.provider.clone() else {
            return Ok(RepairReport::default());
        };

        let orders = self.orders.unlinked_intent_orders(REPAIR_BATCH_SIZE).await?;
        let attempted = orders.len();
        let linked = AtomicUsize::new(0);

        futures::stream::iter(orders)
            .for_each_concurrent(REPAIR_CONCURRENCY, |order| {
                let provider = provider.clone();
                let linked = &linked;
                async move {
                    let Some(intent_id) = order.payment_intent_id.as_deref() else {
                        return;
                    };
                    if link_intent(&self.orders, provider.as_ref(), order.id, intent_id).await {
                        linked.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .await;

        let report = RepairReport {
            attempted,
            linked: linked.into_inner(),
        };
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                linked = report.linked,
                "Payment intent repair sweep finished"
            );
        }
        Ok(report)
    }

    /// Runs [`Self::repair_unlinked_intents`] every `interval_secs`. Zero disables it.
    pub fn spawn_intent_repair(self: Arc<Self>, interval_secs: u64) -> Option<JoinHandle<()>> {
        if interval_secs == 0 || self.provider.is_none() {
            return None;
        }

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = self.repair_unlinked_intents().await {
                    error!(error = %e, "Payment intent repair sweep failed");
                }
            }
        }))
    }

    async fn settle_if_exists(
        &self,
        order_id: Uuid,
        provider_ref: &str,
    ) -> Result<WebhookOutcome, ServiceError> {
        match self.settle(order_id, provider_ref).await {
            Ok(()) => Ok(WebhookOutcome::Processed),
            Err(ServiceError::NotFound(_)) => {
                warn!(order_id = %order_id, "Webhook references unknown order");
                Ok(WebhookOutcome::Ignored)
            }
            Err(e) => Err(e),
        }
    }

    /// Marks the order paid and its payment succeeded. Safe to repeat.
    async fn settle(&self, order_id: Uuid, provider_ref: &str) -> Result<(), ServiceError> {
        let transitioned = self.orders.mark_paid(order_id).await?;
        let order = self.orders.order_view(order_id).await?;
        let provider_name = self.provider.as_ref().map_or("unknown", |p| p.name());
        self.payments
            .mark_succeeded(&order, provider_name, provider_ref)
            .await?;

        if transitioned {
            self.send_confirmation(&order).await;
        }
        Ok(())
    }

    async fn send_confirmation(&self, order: &OrderView) {
        let (Some(email), Some(to)) = (&self.email, order.buyer_email.as_deref()) else {
            return;
        };
        if let Err(e) = email.send(order_confirmation_email(to, order)).await {
            warn!(error = %e, order_id = %order.id, "Failed to send order confirmation email");
        }
    }
}

fn order_id_from(event: &WebhookEvent) -> Option<Uuid> {
    event
        .metadata(ORDER_ID_METADATA_KEY)
        .and_then(|id| Uuid::parse_str(id).ok())
}
