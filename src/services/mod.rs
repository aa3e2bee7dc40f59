pub mod cart_service;
pub mod checkout_service;
pub mod notifications;
pub mod order_status;
pub mod orders;
pub mod payments;
pub mod pricing_service;
pub mod reconciliation_service;
