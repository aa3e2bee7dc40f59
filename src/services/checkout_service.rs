use crate::{
    config::AppConfig,
    errors::ServiceError,
    services::{
        cart_service::CartService,
        notifications::{short_order_id, EmailSender},
        orders::{CreateOrderInput, OrderService, OrderView},
        payments::{
            CheckoutSessionRequest, NewPayment, PaymentIntentRequest, PaymentProvider,
            PaymentService,
        },
        pricing_service::to_minor_units,
    },
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const ORDER_ID_METADATA_KEY: &str = "orderId";
pub const BUYER_ID_METADATA_KEY: &str = "buyerId";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSessionResponse {
    pub url: String,
    pub session_id: String,
    pub order_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentResponse {
    pub client_secret: Option<String>,
    pub order_id: Uuid,
    pub payment_intent_id: String,
    pub total: Decimal,
    pub fees: Decimal,
    pub tax: Decimal,
}

/// The buyer placing an order.
#[derive(Debug, Clone, Copy)]
pub struct Buyer<'a> {
    pub id: &'a str,
    pub email: Option<&'a str>,
}

/// Turns a checkout payload into an order and, optionally, a provider payment.
#[derive(Clone)]
pub struct CheckoutService {
    orders: Arc<OrderService>,
    carts: Arc<CartService>,
    payments: Arc<PaymentService>,
    provider: Option<Arc<dyn PaymentProvider>>,
    email: Option<Arc<dyn EmailSender>>,
    config: Arc<AppConfig>,
}

impl CheckoutService {
    pub fn new(
        orders: Arc<OrderService>,
        carts: Arc<CartService>,
        payments: Arc<PaymentService>,
        provider: Option<Arc<dyn PaymentProvider>>,
        email: Option<Arc<dyn EmailSender>>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            orders,
            carts,
            payments,
            provider,
            email,
            config,
        }
    }

    /// Creates an order without contacting the payment provider.
    #[instrument(skip(self, input), fields(buyer_id = %buyer.id))]
    pub async fn place_order(
        &self,
        buyer: Buyer<'_>,
        input: &CreateOrderInput,
    ) -> Result<OrderView, ServiceError> {
        let order = self.orders.create_order(buyer.id, buyer.email, input).await?;
        self.clear_purchased_lines(buyer.id, &order).await;
        Ok(order)
    }

    /// Hosted checkout: reserve stock in a pending order, then open a provider session for it.
    ///
    /// If the provider call fails the order is cancelled, which returns its stock.
    #[instrument(skip(self, input), fields(buyer_id = %buyer.id))]
    pub async fn create_checkout_session(
        &self,
        buyer: Buyer<'_>,
        input: &CreateOrderInput,
    ) -> Result<CheckoutSessionResponse, ServiceError> {
        let provider = match (&self.provider, &self.email) {
            (Some(provider), Some(_)) => provider.clone(),
            _ => {
                error!("Checkout session requested but payment or email provider is not configured");
                return Err(ServiceError::InternalError(
                    "Payment service not configured".to_string(),
                ));
            }
        };

        let prepared = self.orders.prepare_order(input).await?;
        let order = self
            .orders
            .persist_order(buyer.id, buyer.email, &prepared, None, true)
            .await?;

        let request = CheckoutSessionRequest {
            amount_total_cents: to_minor_units(order.total)?,
            currency: order.currency.clone(),
            description: format!("Marketplace order {}", short_order_id(&order.id.to_string())),
            success_url: format!(
                "{}/checkout/success?session_id={{CHECKOUT_SESSION_ID}}",
                self.base_url()
            ),
            cancel_url: format!("{}/cart", self.base_url()),
            customer_email: buyer.email.map(str::to_string),
            metadata: HashMap::from([
                (ORDER_ID_METADATA_KEY.to_string(), order.id.to_string()),
                (BUYER_ID_METADATA_KEY.to_string(), buyer.id.to_string()),
            ]),
        };

        let session = match provider.create_checkout_session(request).await {
            Ok(session) if session.url.is_some() => session,
            Ok(session) => {
                error!(order_id = %order.id, session_id = %session.id, "Checkout session has no redirect url");
                self.compensate(order.id).await;
                return Err(ServiceError::InternalError(
                    "Failed to create checkout session".to_string(),
                ));
            }
            Err(e) => {
                error!(error = %e, order_id = %order.id, "Failed to create checkout session");
                self.compensate(order.id).await;
                return Err(ServiceError::InternalError(
                    "Failed to create checkout session".to_string(),
                ));
            }
        };

        let recorded = async {
            self.orders.set_checkout_session(order.id, &session.id).await?;
            self.payments
                .record_attempt(NewPayment {
                    order_id: order.id,
                    user_id: buyer.id.to_string(),
                    amount: order.total,
                    currency: order.currency.clone(),
                    provider: provider.name().to_string(),
                    provider_ref: session.id.clone(),
                })
                .await
        }
        .await;
        if let Err(e) = recorded {
            error!(error = %e, order_id = %order.id, session_id = %session.id, "Failed to record checkout session");
            if let Err(expire_err) = provider.expire_checkout_session(&session.id).await {
                warn!(
                    error = %expire_err,
                    session_id = %session.id,
                    "Failed to expire checkout session for cancelled order"
                );
            }
            self.compensate(order.id).await;
            return Err(ServiceError::InternalError(
                "Failed to create checkout session".to_string(),
            ));
        }
        self.clear_purchased_lines(buyer.id, &order).await;

        info!(order_id = %order.id, session_id = %session.id, "Checkout session created");
        Ok(CheckoutSessionResponse {
            url: session.url.unwrap_or_default(),
            session_id: session.id,
            order_id: order.id,
        })
    }

    /// Embedded payment form: the intent is created before the order exists,
    /// then tagged with the order id once it does.
    ///
    /// The tagging call is best-effort. Orders whose intent could not be tagged
    /// keep `intent_linked = false` until the repair sweep succeeds.
    #[instrument(skip(self, input), fields(buyer_id = %buyer.id))]
    pub async fn create_payment_intent(
        &self,
        buyer: Buyer<'_>,
        input: &CreateOrderInput,
    ) -> Result<PaymentIntentResponse, ServiceError> {
        let provider = self.provider.clone().ok_or_else(|| {
            error!("Payment intent requested but no payment provider is configured");
            ServiceError::InternalError("Payment service not configured".to_string())
        })?;

        let prepared = self.orders.prepare_order(input).await?;
        let intent = provider
            .create_payment_intent(PaymentIntentRequest {
                amount_cents: to_minor_units(prepared.breakdown.total)?,
                currency: prepared.currency.clone(),
                metadata: HashMap::from([(
                    BUYER_ID_METADATA_KEY.to_string(),
                    buyer.id.to_string(),
                )]),
            })
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to create payment intent");
                ServiceError::InternalError("Failed to create payment intent".to_string())
            })?;

        let order = match self
            .orders
            .persist_order(buyer.id, buyer.email, &prepared, Some(&intent.id), false)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                cancel_intent(provider.as_ref(), &intent.id).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .payments
            .record_attempt(NewPayment {
                order_id: order.id,
                user_id: buyer.id.to_string(),
                amount: order.total,
                currency: order.currency.clone(),
                provider: provider.name().to_string(),
                provider_ref: intent.id.clone(),
            })
            .await
        {
            error!(error = %e, order_id = %order.id, payment_intent_id = %intent.id, "Failed to record payment intent");
            cancel_intent(provider.as_ref(), &intent.id).await;
            self.compensate(order.id).await;
            return Err(ServiceError::InternalError(
                "Failed to create payment intent".to_string(),
            ));
        }

        link_intent(&self.orders, provider.as_ref(), order.id, &intent.id).await;
        self.clear_purchased_lines(buyer.id, &order).await;

        info!(order_id = %order.id, payment_intent_id = %intent.id, "Payment intent created");
        Ok(PaymentIntentResponse {
            client_secret: intent.client_secret,
            order_id: order.id,
            payment_intent_id: intent.id,
            total: order.total,
            fees: order.fees,
            tax: order.tax,
        })
    }

    fn base_url(&self) -> &str {
        self.config.app_base_url.trim_end_matches('/')
    }

    async fn compensate(&self, order_id: Uuid) {
        if let Err(e) = self
            .orders
            .cancel_order_system(order_id, "Payment provider error")
            .await
        {
            error!(error = %e, order_id = %order_id, "Failed to cancel order after provider error");
        }
    }

    async fn clear_purchased_lines(&self, buyer_id: &str, order: &OrderView) {
        let mut listing_ids: Vec<String> =
            order.items.iter().map(|i| i.listing_id.clone()).collect();
        listing_ids.sort();
        listing_ids.dedup();
        match self.carts.remove_listings(buyer_id, &listing_ids).await {
            Ok(removed) => info!(order_id = %order.id, removed, "Removed purchased lines from cart"),
            Err(e) => warn!(error = %e, order_id = %order.id, "Failed to clear purchased cart lines"),
        }
    }
}

async fn cancel_intent(provider: &dyn PaymentProvider, payment_intent_id: &str) {
    if let Err(e) = provider.cancel_payment_intent(payment_intent_id).await {
        warn!(
            error = %e,
            payment_intent_id = %payment_intent_id,
            "Failed to cancel payment intent for abandoned order"
        );
    }
}

/// Writes the order id onto the provider intent. Returns whether it stuck.
pub async fn link_intent(
    orders: &OrderService,
    provider: &dyn PaymentProvider,
    order_id: Uuid,
    payment_intent_id: &str,
) -> bool {
    let metadata = HashMap::from([(ORDER_ID_METADATA_KEY.to_string(), order_id.to_string())]);
    if let Err(e) = provider
        .update_payment_intent_metadata(payment_intent_id, metadata)
        .await
    {
        warn!(
            error = %e,
            order_id = %order_id,
            payment_intent_id = %payment_intent_id,
            "Failed to backfill order id onto payment intent"
        );
        return false;
    }

    if let Err(e) = orders.mark_intent_linked(order_id).await {
        warn!(error = %e, order_id = %order_id, "Failed to mark payment intent linked");
        return false;
    }
    true
}
