pub mod cart;
pub mod cart_item;
pub mod listing;
pub mod order;
pub mod order_item;
pub mod payment;

pub use cart::{Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use listing::{Entity as Listing, Model as ListingModel};
pub use order::{Entity as Order, Model as OrderModel, OrderStatus};
pub use order_item::{Entity as OrderItem, Model as OrderItemModel};
pub use payment::{Entity as Payment, Model as PaymentModel, PaymentStatus};
