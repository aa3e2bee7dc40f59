use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

/// Domain events emitted by the checkout services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    CartCleared {
        buyer_id: String,
    },
    OrderCreated {
        order_id: Uuid,
        buyer_id: String,
        total: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    InventoryReserved {
        order_id: Uuid,
        listing_id: String,
        quantity: i32,
    },
    InventoryReleased {
        order_id: Uuid,
        listing_id: String,
        quantity: i32,
    },
    PaymentRecorded {
        order_id: Uuid,
        payment_id: Uuid,
        attempt: i32,
    },
    PaymentSucceeded {
        order_id: Uuid,
        provider_ref: String,
    },
    PaymentFailed {
        order_id: Uuid,
        provider_ref: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::CartCleared { .. } => "cart.cleared",
            Event::OrderCreated { .. } => "order.created",
            Event::OrderStatusChanged { .. } => "order.status_changed",
            Event::InventoryReserved { .. } => "inventory.reserved",
            Event::InventoryReleased { .. } => "inventory.released",
            Event::PaymentRecorded { .. } => "payment.recorded",
            Event::PaymentSucceeded { .. } => "payment.succeeded",
            Event::PaymentFailed { .. } => "payment.failed",
        }
    }
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(payload) => info!(event = event.name(), %payload, "domain event"),
            Err(e) => warn!(event = event.name(), "failed to serialize event: {}", e),
        }
    }

    info!("Event channel closed; stopping event processing loop");
}
