use crate::{
    config::AppConfig,
    entities::{
        listing, order, order_item, Listing, Order, OrderItem, OrderItemModel, OrderModel,
        OrderStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        order_status::{check_transition, Participant, StatusActor},
        pricing_service::{
            calculate_total_with_fees, rate_from_f64, round_money, subtotal, validate_rate,
            validate_unit_price, PriceBreakdown,
        },
    },
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Expr, Query},
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

pub const DEFAULT_PAGE_SIZE: u64 = 20;
pub const MAX_PAGE_SIZE: u64 = 100;

/// Order Builder and order queries.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

/// One cart line as submitted at checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLineInput {
    pub listing_id: String,
    /// Informational only; the listing's own seller is recorded on the order.
    #[serde(default)]
    pub seller_id: Option<String>,
    #[serde(alias = "qty")]
    pub quantity: i32,
    pub price_at_add: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    #[validate(length(min = 1, message = "name is required"))]
    pub name: String,
    #[validate(length(min = 1, message = "line1 is required"))]
    pub line1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line2: Option<String>,
    #[validate(length(min = 1, message = "city is required"))]
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[validate(length(min = 1, message = "postalCode is required"))]
    pub postal_code: String,
    #[validate(length(equal = 2, message = "country must be a two-letter code"))]
    pub country: String,
}

/// Shipping rate picked by the buyer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedShipping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_id: Option<String>,
}

/// Checkout payload shared by `POST /orders` and both payment flows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderInput {
    #[serde(default, alias = "cartItems")]
    pub items: Option<Vec<OrderLineInput>>,
    #[serde(default)]
    pub shipping_address: Option<ShippingAddress>,
    #[serde(default)]
    pub selected_shipping: Option<SelectedShipping>,
    #[serde(default)]
    pub tax_rate: Option<Decimal>,
    #[serde(default)]
    pub payment_intent_id: Option<String>,
}

/// A validated, priced order that has not been written yet.
#[derive(Debug, Clone)]
pub struct PreparedOrder {
    pub lines: Vec<PreparedLine>,
    pub breakdown: PriceBreakdown,
    pub currency: String,
    pub shipping_address: ShippingAddress,
    pub shipping: Option<SelectedShipping>,
}

#[derive(Debug, Clone)]
pub struct PreparedLine {
    pub listing_id: String,
    pub seller_id: String,
    pub title: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl PreparedOrder {
    /// Total quantity per listing, in order of first appearance.
    fn reservations(&self) -> Vec<(String, i32)> {
        aggregate_quantities(self.lines.iter().map(|l| (l.listing_id.as_str(), l.quantity)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub id: Uuid,
    pub buyer_id: String,
    /// Used for confirmation mail, never sent to clients
    #[serde(skip)]
    pub buyer_email: Option<String>,
    pub status: OrderStatus,
    pub items: Vec<OrderItemView>,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub tax: Decimal,
    pub fees: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub shipping_address: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemView {
    pub listing_id: String,
    pub seller_id: String,
    pub title: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl From<OrderItemModel> for OrderItemView {
    fn from(item: OrderItemModel) -> Self {
        Self {
            listing_id: item.listing_id,
            seller_id: item.seller_id,
            title: item.title,
            quantity: item.quantity,
            unit_price: round_money(item.unit_price),
        }
    }
}

impl OrderView {
    fn from_parts(order: OrderModel, items: Vec<OrderItemModel>) -> Self {
        Self {
            id: order.id,
            buyer_id: order.buyer_id,
            buyer_email: order.buyer_email,
            status: order.status,
            items: items.into_iter().map(OrderItemView::from).collect(),
            subtotal: round_money(order.subtotal),
            shipping_cost: round_money(order.shipping_cost),
            tax: round_money(order.tax),
            fees: round_money(order.fees),
            total: round_money(order.total),
            currency: order.currency,
            shipping_address: order.shipping_address,
            shipping: order.shipping,
            payment_intent_id: order.payment_intent_id,
            checkout_session_id: order.checkout_session_id,
            tracking_number: order.tracking_number,
            notes: order.notes,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }
}

/// Which side of the order the caller is listing from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderRole {
    #[default]
    Buyer,
    Seller,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListOrdersQuery {
    #[serde(default, rename = "type")]
    pub role: OrderRole,
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderListView {
    pub orders: Vec<OrderView>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOrderInput {
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
        }
    }

    /// Validates the checkout payload against live listings and prices it.
    ///
    /// Nothing is written. Listings are checked in cart order and the first
    /// failing line decides the error.
    #[instrument(skip(self, input))]
    pub async fn prepare_order(
        &self,
        input: &CreateOrderInput,
    ) -> Result<PreparedOrder, ServiceError> {
        let items = match input.items.as_deref() {
            Some(items) if !items.is_empty() => items,
            _ => {
                return Err(ServiceError::BadRequest(
                    "cartItems must be a non-empty list".to_string(),
                ))
            }
        };
        let shipping_address = input.shipping_address.clone().ok_or_else(|| {
            ServiceError::BadRequest("shippingAddress is required".to_string())
        })?;
        shipping_address.validate()?;

        let tax_rate = match input.tax_rate {
            Some(rate) => rate,
            None => rate_from_f64(self.config.default_tax_rate)?,
        };
        validate_rate(tax_rate, "taxRate")?;
        let platform_fee_rate = rate_from_f64(self.config.platform_fee_rate)?;

        let shipping_price = match &input.selected_shipping {
            Some(shipping) => {
                validate_unit_price(shipping.price, "selectedShipping.price")?;
                shipping.price
            }
            None => Decimal::ZERO,
        };

        let mut requested: HashMap<&str, i32> = HashMap::new();
        let mut lines = Vec::with_capacity(items.len());
        for item in items {
            if item.listing_id.trim().is_empty() {
                return Err(ServiceError::BadRequest(
                    "listingId is required on every item".to_string(),
                ));
            }
            if item.quantity < 1 {
                return Err(ServiceError::BadRequest(format!(
                    "qty for listing {} must be at least 1",
                    item.listing_id
                )));
            }
            validate_unit_price(
                item.price_at_add,
                &format!("priceAtAdd for listing {}", item.listing_id),
            )?;

            let listing = Listing::find_by_id(item.listing_id.clone())
                .one(&*self.db)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Listing {} not found", item.listing_id))
                })?;

            if !listing.is_active {
                return Err(ServiceError::BadRequest(format!(
                    "Listing {} is no longer available",
                    listing.id
                )));
            }

            let wanted = requested.entry(item.listing_id.as_str()).or_insert(0);
            *wanted = wanted.saturating_add(item.quantity);
            if listing.inventory < *wanted {
                return Err(ServiceError::InsufficientStock(format!(
                    "Listing {} has {} in stock, {} requested",
                    listing.id, listing.inventory, wanted
                )));
            }

            lines.push(PreparedLine {
                listing_id: listing.id,
                seller_id: listing.seller_id,
                title: listing.title,
                quantity: item.quantity,
                unit_price: round_money(item.price_at_add),
            });
        }

        let subtotal = subtotal(lines.iter().map(|l| (l.unit_price, l.quantity)))?;
        let breakdown =
            calculate_total_with_fees(subtotal, shipping_price, tax_rate, platform_fee_rate)?;

        Ok(PreparedOrder {
            lines,
            breakdown,
            currency: self.config.default_currency.clone(),
            shipping_address,
            shipping: input.selected_shipping.clone(),
        })
    }

    /// Validates, prices and persists an order in one step.
    #[instrument(skip(self, input))]
    pub async fn create_order(
        &self,
        buyer_id: &str,
        buyer_email: Option<&str>,
        input: &CreateOrderInput,
    ) -> Result<OrderView, ServiceError> {
        let prepared = self.prepare_order(input).await?;
        self.persist_order(
            buyer_id,
            buyer_email,
            &prepared,
            input.payment_intent_id.as_deref(),
            true,
        )
        .await
    }

    /// Writes a prepared order and reserves its stock.
    ///
    /// The order rows and the conditional inventory decrements share one
    /// transaction. If any listing can no longer cover its quantity the whole
    /// transaction rolls back and no order exists.
    #[instrument(skip(self, prepared))]
    pub async fn persist_order(
        &self,
        buyer_id: &str,
        buyer_email: Option<&str>,
        prepared: &PreparedOrder,
        payment_intent_id: Option<&str>,
        intent_linked: bool,
    ) -> Result<OrderView, ServiceError> {
        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let reservations = prepared.reservations();

        let txn = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for order creation");
            ServiceError::DatabaseError(e)
        })?;

        for (listing_id, quantity) in &reservations {
            if let Err(e) = reserve_stock(&txn, listing_id, *quantity, now).await {
                txn.rollback().await?;
                warn!(listing_id = %listing_id, quantity, "Stock reservation failed: {}", e);
                return Err(e);
            }
        }

        let shipping_address = serde_json::to_value(&prepared.shipping_address)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        let shipping = prepared
            .shipping
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;

        order::ActiveModel {
            id: Set(order_id),
            buyer_id: Set(buyer_id.to_string()),
            buyer_email: Set(buyer_email.map(str::to_string)),
            status: Set(OrderStatus::Pending),
            subtotal: Set(prepared.breakdown.subtotal),
            shipping_cost: Set(prepared.breakdown.shipping),
            tax: Set(prepared.breakdown.tax),
            fees: Set(prepared.breakdown.fees),
            total: Set(prepared.breakdown.total),
            currency: Set(prepared.currency.clone()),
            shipping_address: Set(shipping_address),
            shipping: Set(shipping),
            payment_intent_id: Set(payment_intent_id.map(str::to_string)),
            checkout_session_id: Set(None),
            intent_linked: Set(intent_linked),
            tracking_number: Set(None),
            notes: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to create order in database");
            ServiceError::DatabaseError(e)
        })?;

        for (position, line) in prepared.lines.iter().enumerate() {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                listing_id: Set(line.listing_id.clone()),
                seller_id: Set(line.seller_id.clone()),
                title: Set(line.title.clone()),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                position: Set(position as i32),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit order creation transaction");
            ServiceError::DatabaseError(e)
        })?;

        info!(
            order_id = %order_id,
            buyer_id = %buyer_id,
            total = %prepared.breakdown.total,
            "Order created successfully"
        );

        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id,
                buyer_id: buyer_id.to_string(),
                total: prepared.breakdown.total,
            })
            .await;
        for (listing_id, quantity) in reservations {
            self.event_sender
                .send_or_log(Event::InventoryReserved {
                    order_id,
                    listing_id,
                    quantity,
                })
                .await;
        }

        self.order_view(order_id).await
    }

    /// Fetches an order for a caller who must be its buyer or sell one of its items.
    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid, caller_id: &str) -> Result<OrderView, ServiceError> {
        let view = self.order_view(order_id).await?;
        if !participant_of(
            &view.buyer_id,
            view.items.iter().map(|i| i.seller_id.as_str()),
            caller_id,
        ).is_party() {
            warn!(order_id = %order_id, caller_id = %caller_id, "Order access by non-participant");
            return Err(ServiceError::Unauthorized(
                "Not a participant in this order".to_string(),
            ));
        }
        Ok(view)
    }

    /// Loads an order without any caller check.
    pub async fn order_view(&self, order_id: Uuid) -> Result<OrderView, ServiceError> {
        let (order, items) = load_order(&*self.db, order_id).await?;
        Ok(OrderView::from_parts(order, items))
    }

    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        caller_id: &str,
        query: &ListOrdersQuery,
    ) -> Result<OrderListView, ServiceError> {
        let page = query.page.unwrap_or(1);
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if page < 1 {
            return Err(ServiceError::BadRequest("page must be at least 1".to_string()));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(ServiceError::BadRequest(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        // End of the requested window; the database takes offsets as i64.
        let window_end = page
            .checked_mul(limit)
            .filter(|end| i64::try_from(*end).is_ok())
            .ok_or_else(|| ServiceError::BadRequest("page is out of range".to_string()))?;

        let mut select = Order::find();
        select = match query.role {
            OrderRole::Buyer => select.filter(order::Column::BuyerId.eq(caller_id)),
            OrderRole::Seller => select.filter(
                order::Column::Id.in_subquery(
                    Query::select()
                        .column(order_item::Column::OrderId)
                        .from(order_item::Entity)
                        .and_where(order_item::Column::SellerId.eq(caller_id))
                        .to_owned(),
                ),
            ),
        };
        if let Some(status) = query.status {
            select = select.filter(order::Column::Status.eq(status));
        }

        let paginator = select
            .order_by_desc(order::Column::CreatedAt)
            .order_by_desc(order::Column::Id)
            .paginate(&*self.db, limit);
        let total = paginator.num_items().await.map_err(|e| {
            error!(error = %e, "Failed to count orders");
            ServiceError::DatabaseError(e)
        })?;
        let orders = paginator.fetch_page(page - 1).await.map_err(|e| {
            error!(error = %e, page = page, limit = limit, "Failed to fetch orders page");
            ServiceError::DatabaseError(e)
        })?;

        let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
        let mut items_by_order: HashMap<Uuid, Vec<OrderItemModel>> = HashMap::new();
        if !ids.is_empty() {
            for item in OrderItem::find()
                .filter(order_item::Column::OrderId.is_in(ids))
                .order_by_asc(order_item::Column::Position)
                .all(&*self.db)
                .await?
            {
                items_by_order.entry(item.order_id).or_default().push(item);
            }
        }

        let orders: Vec<OrderView> = orders
            .into_iter()
            .map(|o| {
                let items = items_by_order.remove(&o.id).unwrap_or_default();
                OrderView::from_parts(o, items)
            })
            .collect();

        info!(
            total = total,
            page = page,
            limit = limit,
            returned_count = orders.len(),
            "Orders listed successfully"
        );

        Ok(OrderListView {
            has_more: window_end < total,
            orders,
            total,
            page,
            limit,
        })
    }

    /// Applies a buyer or seller update.
    ///
    /// Tracking numbers are seller-only. Cancelling returns every item's
    /// quantity to its listing in the same transaction.
    #[instrument(skip(self, input))]
    pub async fn update_order(
        &self,
        order_id: Uuid,
        caller_id: &str,
        input: UpdateOrderInput,
    ) -> Result<OrderView, ServiceError> {
        let txn = self.db.begin().await?;
        let (existing, items) = load_order(&txn, order_id).await?;

        let participant = participant_of(
            &existing.buyer_id,
            items.iter().map(|i| i.seller_id.as_str()),
            caller_id,
        );
        if !participant.is_party() {
            return Err(ServiceError::Unauthorized(
                "Not a participant in this order".to_string(),
            ));
        }
        if input.tracking_number.is_some() && !participant.is_seller {
            return Err(ServiceError::Unauthorized(
                "Only a seller on this order can set trackingNumber".to_string(),
            ));
        }

        let old_status = existing.status;
        let new_status = match input.status {
            Some(to) if check_transition(old_status, to, StatusActor::Caller(participant))? => {
                Some(to)
            }
            _ => None,
        };

        let mut active: order::ActiveModel = existing.clone().into();
        let mut dirty = false;
        if let Some(to) = new_status {
            active.status = Set(to);
            dirty = true;
        }
        if let Some(tracking) = input.tracking_number {
            if existing.tracking_number.as_deref() != Some(tracking.as_str()) {
                active.tracking_number = Set(Some(tracking));
                dirty = true;
            }
        }
        if let Some(notes) = input.notes {
            if existing.notes.as_deref() != Some(notes.as_str()) {
                active.notes = Set(Some(notes));
                dirty = true;
            }
        }

        if !dirty {
            txn.commit().await?;
            return Ok(OrderView::from_parts(existing, items));
        }

        let restocked = if new_status == Some(OrderStatus::Cancelled) {
            restock(&txn, &items).await?
        } else {
            Vec::new()
        };

        active.updated_at = Set(Utc::now());
        active.update(&txn).await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to update order");
            ServiceError::DatabaseError(e)
        })?;
        txn.commit().await?;

        if let Some(to) = new_status {
            info!(order_id = %order_id, old_status = %old_status, new_status = %to, "Order status updated successfully");
            self.status_changed(order_id, old_status, to, restocked).await;
        }

        self.order_view(order_id).await
    }

    /// Cancels a pending order on behalf of the system and restocks it.
    ///
    /// Used when the payment provider could not be reached after stock was reserved.
    #[instrument(skip(self))]
    pub async fn cancel_order_system(
        &self,
        order_id: Uuid,
        reason: &str,
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        let (existing, items) = load_order(&txn, order_id).await?;
        let old_status = existing.status;

        if !check_transition(old_status, OrderStatus::Cancelled, StatusActor::System)? {
            txn.commit().await?;
            return Ok(());
        }

        let restocked = restock(&txn, &items).await?;
        let mut active: order::ActiveModel = existing.into();
        active.status = Set(OrderStatus::Cancelled);
        active.notes = Set(Some(reason.to_string()));
        active.updated_at = Set(Utc::now());
        active.update(&txn).await?;
        txn.commit().await?;

        info!(order_id = %order_id, reason = %reason, "Order cancelled by system");
        self.status_changed(order_id, old_status, OrderStatus::Cancelled, restocked)
            .await;
        Ok(())
    }

    /// Promotes a pending order to paid. Returns whether this call made the change.
    ///
    /// Orders that are already paid or further along are left alone, as are
    /// cancelled ones, so repeated confirmations are harmless.
    #[instrument(skip(self))]
    pub async fn mark_paid(&self, order_id: Uuid) -> Result<bool, ServiceError> {
        let result = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Paid))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            let existing = Order::find_by_id(order_id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
            if existing.status == OrderStatus::Cancelled {
                warn!(order_id = %order_id, "Payment confirmed for a cancelled order");
            }
            return Ok(false);
        }

        info!(order_id = %order_id, "Order marked paid");
        self.status_changed(order_id, OrderStatus::Pending, OrderStatus::Paid, Vec::new())
            .await;
        Ok(true)
    }

    pub async fn set_checkout_session(
        &self,
        order_id: Uuid,
        session_id: &str,
    ) -> Result<(), ServiceError> {
        let result = Order::update_many()
            .col_expr(order::Column::CheckoutSessionId, Expr::value(session_id))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!("Order {} not found", order_id)));
        }
        Ok(())
    }

    pub async fn mark_intent_linked(&self, order_id: Uuid) -> Result<(), ServiceError> {
        Order::update_many()
            .col_expr(order::Column::IntentLinked, Expr::value(true))
            .filter(order::Column::Id.eq(order_id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn find_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Ok(Order::find()
            .filter(order::Column::PaymentIntentId.eq(payment_intent_id))
            .one(&*self.db)
            .await?)
    }

    /// Orders whose provider intent never received our order id, oldest first.
    pub async fn unlinked_intent_orders(&self, limit: u64) -> Result<Vec<OrderModel>, ServiceError> {
        Ok(Order::find()
            .filter(order::Column::IntentLinked.eq(false))
            .filter(order::Column::PaymentIntentId.is_not_null())
            .filter(order::Column::Status.ne(OrderStatus::Cancelled))
            .order_by_asc(order::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    async fn status_changed(
        &self,
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
        restocked: Vec<(String, i32)>,
    ) {
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: new_status.to_string(),
            })
            .await;
        for (listing_id, quantity) in restocked {
            self.event_sender
                .send_or_log(Event::InventoryReleased {
                    order_id,
                    listing_id,
                    quantity,
                })
                .await;
        }
    }
}

fn participant_of<'a>(
    buyer_id: &str,
    mut seller_ids: impl Iterator<Item = &'a str>,
    caller_id: &str,
) -> Participant {
    Participant {
        is_buyer: buyer_id == caller_id,
        is_seller: seller_ids.any(|seller_id| seller_id == caller_id),
    }
}

fn aggregate_quantities<'a, I>(lines: I) -> Vec<(String, i32)>
where
    I: IntoIterator<Item = (&'a str, i32)>,
{
    let mut totals: Vec<(String, i32)> = Vec::new();
    for (listing_id, quantity) in lines {
        match totals.iter_mut().find(|(id, _)| id == listing_id) {
            Some((_, total)) => *total = total.saturating_add(quantity),
            None => totals.push((listing_id.to_string(), quantity)),
        }
    }
    totals
}

async fn load_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<(OrderModel, Vec<OrderItemModel>), ServiceError> {
    let order = Order::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
    let items = OrderItem::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::Position)
        .all(conn)
        .await?;
    Ok((order, items))
}

/// Conditional decrement: succeeds only while the listing is active and still has `quantity` units.
async fn reserve_stock(
    txn: &DatabaseTransaction,
    listing_id: &str,
    quantity: i32,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    let result = Listing::update_many()
        .col_expr(
            listing::Column::Inventory,
            Expr::col(listing::Column::Inventory).sub(quantity),
        )
        .col_expr(listing::Column::UpdatedAt, Expr::value(now))
        .filter(listing::Column::Id.eq(listing_id))
        .filter(listing::Column::IsActive.eq(true))
        .filter(listing::Column::Inventory.gte(quantity))
        .exec(txn)
        .await?;

    if result.rows_affected > 0 {
        return Ok(());
    }

    match Listing::find_by_id(listing_id.to_string()).one(txn).await? {
        None => Err(ServiceError::NotFound(format!(
            "Listing {} not found",
            listing_id
        ))),
        Some(listing) if !listing.is_active => Err(ServiceError::BadRequest(format!(
            "Listing {} is no longer available",
            listing_id
        ))),
        Some(listing) => Err(ServiceError::InsufficientStock(format!(
            "Listing {} has {} in stock, {} requested",
            listing_id, listing.inventory, quantity
        ))),
    }
}

async fn restock(
    txn: &DatabaseTransaction,
    items: &[OrderItemModel],
) -> Result<Vec<(String, i32)>, ServiceError> {
    let released =
        aggregate_quantities(items.iter().map(|i| (i.listing_id.as_str(), i.quantity)));
    let now = Utc::now();
    for (listing_id, quantity) in &released {
        Listing::update_many()
            .col_expr(
                listing::Column::Inventory,
                Expr::col(listing::Column::Inventory).add(*quantity),
            )
            .col_expr(listing::Column::UpdatedAt, Expr::value(now))
            .filter(listing::Column::Id.eq(listing_id.as_str()))
            .exec(txn)
            .await?;
    }
    Ok(released)
}
