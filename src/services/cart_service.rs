use crate::{
    entities::{cart, cart_item, Cart, CartItem, CartItemModel},
    errors::ServiceError,
    events::{Event, EventSender},
    services::pricing_service::{round_money, validate_unit_price},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::OnConflict, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Buyer-scoped cart store.
///
/// Every mutation commits and then re-reads the cart, so callers always get
/// back the state their own write produced.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

/// Input for adding a listing to a cart
#[derive(Debug, Clone, Deserialize)]
pub struct AddToCartInput {
    pub listing_id: String,
    pub seller_id: String,
    pub quantity: i32,
    pub price_at_add: Decimal,
}

/// A buyer's cart as returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartView {
    pub items: Vec<CartLine>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub listing_id: String,
    pub seller_id: String,
    #[serde(rename = "qty", alias = "quantity")]
    pub quantity: i32,
    pub price_at_add: Decimal,
}

impl From<CartItemModel> for CartLine {
    fn from(item: CartItemModel) -> Self {
        Self {
            listing_id: item.listing_id,
            seller_id: item.seller_id,
            quantity: item.quantity,
            price_at_add: round_money(item.price_at_add),
        }
    }
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Returns the buyer's cart, or an empty one if none was ever created.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, buyer_id: &str) -> Result<CartView, ServiceError> {
        load_cart(&*self.db, buyer_id).await
    }

    /// Adds a listing, merging the quantity into an existing line for the same listing.
    ///
    /// A merged line keeps its original `price_at_add`; the snapshot is never rewritten.
    #[instrument(skip(self))]
    pub async fn add_to_cart(
        &self,
        buyer_id: &str,
        input: AddToCartInput,
    ) -> Result<CartView, ServiceError> {
        if input.listing_id.trim().is_empty() || input.seller_id.trim().is_empty() {
            return Err(ServiceError::BadRequest(
                "listingId and sellerId are required".to_string(),
            ));
        }
        if input.quantity < 1 {
            return Err(ServiceError::BadRequest(
                "qty must be at least 1".to_string(),
            ));
        }
        validate_unit_price(input.price_at_add, "priceAtAdd")?;

        let now = Utc::now();
        let txn = self.db.begin().await?;
        touch_cart(&txn, buyer_id, now).await?;

        let existing = CartItem::find()
            .filter(cart_item::Column::BuyerId.eq(buyer_id))
            .filter(cart_item::Column::ListingId.eq(input.listing_id.as_str()))
            .one(&txn)
            .await?;

        if let Some(item) = existing {
            let quantity = item.quantity.checked_add(input.quantity).ok_or_else(|| {
                ServiceError::BadRequest("qty is too large".to_string())
            })?;
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(quantity);
            item.updated_at = Set(now);
            item.update(&txn).await?;
        } else {
            let position = CartItem::find()
                .select_only()
                .column_as(cart_item::Column::Position.max(), "max_position")
                .filter(cart_item::Column::BuyerId.eq(buyer_id))
                .into_tuple::<Option<i32>>()
                .one(&txn)
                .await?
                .flatten();

            cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                buyer_id: Set(buyer_id.to_string()),
                listing_id: Set(input.listing_id.clone()),
                seller_id: Set(input.seller_id.clone()),
                quantity: Set(input.quantity),
                price_at_add: Set(round_money(input.price_at_add)),
                position: Set(position.map_or(0, |p| p + 1)),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;

        info!(
            "Added listing {} x{} to cart of {}",
            input.listing_id, input.quantity, buyer_id
        );
        self.get_cart(buyer_id).await
    }

    /// Sets the quantity of a line. A quantity of zero removes the line.
    #[instrument(skip(self))]
    pub async fn update_cart_item(
        &self,
        buyer_id: &str,
        listing_id: &str,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity < 0 {
            return Err(ServiceError::BadRequest(
                "qty must not be negative".to_string(),
            ));
        }
        if quantity == 0 {
            return self.remove_from_cart(buyer_id, listing_id).await;
        }

        let now = Utc::now();
        let txn = self.db.begin().await?;

        let item = CartItem::find()
            .filter(cart_item::Column::BuyerId.eq(buyer_id))
            .filter(cart_item::Column::ListingId.eq(listing_id))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Listing {} is not in the cart", listing_id))
            })?;

        let mut item: cart_item::ActiveModel = item.into();
        item.quantity = Set(quantity);
        item.updated_at = Set(now);
        item.update(&txn).await?;
        touch_cart(&txn, buyer_id, now).await?;

        txn.commit().await?;

        info!(
            "Updated listing {} to x{} in cart of {}",
            listing_id, quantity, buyer_id
        );
        self.get_cart(buyer_id).await
    }

    /// Removes a line. Removing a listing that is not in the cart is not an error.
    #[instrument(skip(self))]
    pub async fn remove_from_cart(
        &self,
        buyer_id: &str,
        listing_id: &str,
    ) -> Result<CartView, ServiceError> {
        self.remove_listings(buyer_id, &[listing_id.to_string()])
            .await?;
        self.get_cart(buyer_id).await
    }

    /// Empties the cart. Clearing an empty or missing cart is not an error.
    #[instrument(skip(self))]
    pub async fn clear_cart(&self, buyer_id: &str) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;
        let result = CartItem::delete_many()
            .filter(cart_item::Column::BuyerId.eq(buyer_id))
            .exec(&txn)
            .await?;
        if result.rows_affected > 0 {
            touch_cart(&txn, buyer_id, Utc::now()).await?;
        }
        txn.commit().await?;

        if result.rows_affected > 0 {
            self.event_sender
                .send_or_log(Event::CartCleared {
                    buyer_id: buyer_id.to_string(),
                })
                .await;
            info!("Cleared cart of {}", buyer_id);
        }
        self.get_cart(buyer_id).await
    }

    /// Deletes the given listings from the buyer's cart and returns how many lines went.
    #[instrument(skip(self))]
    pub async fn remove_listings(
        &self,
        buyer_id: &str,
        listing_ids: &[String],
    ) -> Result<u64, ServiceError> {
        if listing_ids.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin().await?;
        let result = CartItem::delete_many()
            .filter(cart_item::Column::BuyerId.eq(buyer_id))
            .filter(cart_item::Column::ListingId.is_in(listing_ids.iter().map(String::as_str)))
            .exec(&txn)
            .await?;
        if result.rows_affected > 0 {
            touch_cart(&txn, buyer_id, Utc::now()).await?;
        }
        txn.commit().await?;

        Ok(result.rows_affected)
    }
}

async fn load_cart<C: ConnectionTrait>(conn: &C, buyer_id: &str) -> Result<CartView, ServiceError> {
    let Some(cart) = Cart::find_by_id(buyer_id.to_string()).one(conn).await? else {
        return Ok(CartView {
            items: Vec::new(),
            updated_at: Utc::now(),
        });
    };

    let items = CartItem::find()
        .filter(cart_item::Column::BuyerId.eq(buyer_id))
        .order_by_asc(cart_item::Column::Position)
        .all(conn)
        .await?;

    Ok(CartView {
        items: items.into_iter().map(CartLine::from).collect(),
        updated_at: cart.updated_at,
    })
}

/// Creates the cart row on first use and bumps `updated_at` otherwise.
async fn touch_cart<C: ConnectionTrait>(
    conn: &C,
    buyer_id: &str,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    Cart::insert(cart::ActiveModel {
        buyer_id: Set(buyer_id.to_string()),
        updated_at: Set(now),
    })
    .on_conflict(
        OnConflict::column(cart::Column::BuyerId)
            .update_column(cart::Column::UpdatedAt)
            .to_owned(),
    )
    .exec_without_returning(conn)
    .await?;
    Ok(())
}
