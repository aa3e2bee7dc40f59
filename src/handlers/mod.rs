pub mod cart;
pub mod common;
pub mod health;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        cart_service::CartService, checkout_service::CheckoutService,
        notifications::EmailSender, orders::OrderService, payments::PaymentProvider,
        payments::PaymentService, reconciliation_service::ReconciliationService,
    },
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartService>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub checkout: Arc<CheckoutService>,
    pub reconciliation: Arc<ReconciliationService>,
}

impl AppServices {
    /// Wires every service against one pool, event channel and provider pair.
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
        provider: Option<Arc<dyn PaymentProvider>>,
        email: Option<Arc<dyn EmailSender>>,
    ) -> Self {
        let cart = Arc::new(CartService::new(db_pool.clone(), event_sender.clone()));
        let orders = Arc::new(OrderService::new(
            db_pool.clone(),
            event_sender.clone(),
            config.clone(),
        ));
        let payments = Arc::new(PaymentService::new(db_pool, event_sender));
        let checkout = Arc::new(CheckoutService::new(
            orders.clone(),
            cart.clone(),
            payments.clone(),
            provider.clone(),
            email.clone(),
            config.clone(),
        ));
        let reconciliation = Arc::new(ReconciliationService::new(
            orders.clone(),
            payments.clone(),
            provider,
            email,
            config,
        ));

        Self {
            cart,
            orders,
            payments,
            checkout,
            reconciliation,
        }
    }
}
