//! Payment Session Gateway: provider clients and payment attempt records.

pub mod mock;
pub mod provider;
pub mod stripe;
pub mod webhook;

pub use mock::InMemoryPaymentProvider;
pub use provider::{
    CheckoutSession, CheckoutSessionRequest, PaymentIntent, PaymentIntentRequest, PaymentProvider,
};
pub use stripe::StripeProvider;

use crate::{
    config::AppConfig,
    entities::{payment, Payment, PaymentModel, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders::OrderView,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Builds the provider named by `payment_provider`, if any.
pub fn provider_from_config(
    config: &AppConfig,
) -> Result<Option<Arc<dyn PaymentProvider>>, ServiceError> {
    match config.payment_provider.as_deref() {
        None => Ok(None),
        Some("mock") => Ok(Some(Arc::new(InMemoryPaymentProvider::new()))),
        Some("stripe") => {
            let key = config.stripe_secret_key.as_deref().ok_or_else(|| {
                ServiceError::InternalError(
                    "stripe_secret_key is required when payment_provider is stripe".to_string(),
                )
            })?;
            if config.payment_webhook_secret.is_none() {
                return Err(ServiceError::InternalError(
                    "payment_webhook_secret is required when payment_provider is stripe"
                        .to_string(),
                ));
            }
            Ok(Some(Arc::new(StripeProvider::new(
                key,
                config.stripe_api_base.as_str(),
            )?)))
        }
        Some(other) => Err(ServiceError::InternalError(format!(
            "Unknown payment provider '{}'",
            other
        ))),
    }
}

/// A payment attempt about to be recorded.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub order_id: Uuid,
    pub user_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub provider: String,
    pub provider_ref: String,
}

/// Payment attempt records.
///
/// An order has at most one payment that is not `failed`. Retries after a
/// failure get the next attempt number.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl PaymentService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Records a pending attempt. Re-recording the active attempt's provider
    /// reference returns the existing row.
    #[instrument(skip(self))]
    pub async fn record_attempt(&self, new: NewPayment) -> Result<PaymentModel, ServiceError> {
        let txn = self.db.begin().await?;
        let existing = Payment::find()
            .filter(payment::Column::OrderId.eq(new.order_id))
            .order_by_desc(payment::Column::Attempt)
            .all(&txn)
            .await?;

        if let Some(active) = existing.iter().find(|p| p.status != PaymentStatus::Failed) {
            txn.commit().await?;
            if active.provider_ref == new.provider_ref {
                return Ok(active.clone());
            }
            return Err(ServiceError::BadRequest(format!(
                "Order {} already has an active payment",
                new.order_id
            )));
        }

        let attempt = existing.first().map_or(1, |p| p.attempt + 1);
        let now = Utc::now();
        let model = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(new.order_id),
            user_id: Set(new.user_id),
            amount: Set(new.amount),
            currency: Set(new.currency),
            provider: Set(new.provider),
            provider_ref: Set(new.provider_ref),
            status: Set(PaymentStatus::Pending),
            attempt: Set(attempt),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        info!(order_id = %model.order_id, payment_id = %model.id, attempt, "Payment attempt recorded");
        self.event_sender
            .send_or_log(Event::PaymentRecorded {
                order_id: model.order_id,
                payment_id: model.id,
                attempt,
            })
            .await;
        Ok(model)
    }

    /// Marks the order's active payment succeeded, creating one if the
    /// provider reports a payment this service never recorded.
    ///
    /// Returns whether anything changed.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn mark_succeeded(
        &self,
        order: &OrderView,
        provider: &str,
        provider_ref: &str,
    ) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await?;
        let existing = Payment::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .order_by_desc(payment::Column::Attempt)
            .all(&txn)
            .await?;

        let active = existing
            .iter()
            .find(|p| p.status != PaymentStatus::Failed && p.provider_ref == provider_ref)
            .or_else(|| existing.iter().find(|p| p.status != PaymentStatus::Failed));

        match active {
            Some(p) if p.status == PaymentStatus::Succeeded => {
                txn.commit().await?;
                return Ok(false);
            }
            Some(p) => {
                let mut model: payment::ActiveModel = p.clone().into();
                model.status = Set(PaymentStatus::Succeeded);
                model.updated_at = Set(Utc::now());
                model.update(&txn).await?;
            }
            None => {
                let now = Utc::now();
                payment::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    order_id: Set(order.id),
                    user_id: Set(order.buyer_id.clone()),
                    amount: Set(order.total),
                    currency: Set(order.currency.clone()),
                    provider: Set(provider.to_string()),
                    provider_ref: Set(provider_ref.to_string()),
                    status: Set(PaymentStatus::Succeeded),
                    attempt: Set(existing.first().map_or(1, |p| p.attempt + 1)),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?;
            }
        }
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::PaymentSucceeded {
                order_id: order.id,
                provider_ref: provider_ref.to_string(),
            })
            .await;
        Ok(true)
    }

    /// Fails the pending attempt with this provider reference, if there is one.
    #[instrument(skip(self))]
    pub async fn mark_failed_by_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<PaymentModel>, ServiceError> {
        let Some(pending) = Payment::find()
            .filter(payment::Column::ProviderRef.eq(provider_ref))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .one(&*self.db)
            .await?
        else {
            warn!(provider_ref = %provider_ref, "No pending payment for failed provider payment");
            return Ok(None);
        };

        let mut model: payment::ActiveModel = pending.into();
        model.status = Set(PaymentStatus::Failed);
        model.updated_at = Set(Utc::now());
        let failed = model.update(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::PaymentFailed {
                order_id: failed.order_id,
                provider_ref: provider_ref.to_string(),
            })
            .await;
        Ok(Some(failed))
    }

    pub async fn payments_for_order(&self, order_id: Uuid) -> Result<Vec<PaymentModel>, ServiceError> {
        Ok(Payment::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_asc(payment::Column::Attempt)
            .all(&*self.db)
            .await?)
    }
}
