//! Money math shared by every checkout path.
//!
//! Both the hosted checkout session flow and the embedded payment intent flow
//! price orders through [`calculate_total_with_fees`], so the stored order
//! totals and the amount charged at the provider cannot drift apart.

use crate::errors::ServiceError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::str::FromStr;

/// Decimal places kept for every monetary amount.
pub const MONEY_SCALE: u32 = 2;

/// Largest unit price accepted from a cart line.
pub const MAX_UNIT_PRICE: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

/// Fully priced order amounts, each rounded to cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBreakdown {
    pub subtotal: Decimal,
    pub shipping: Decimal,
    pub tax: Decimal,
    pub fees: Decimal,
    pub total: Decimal,
}

/// Rounds half away from zero to cents and pins the scale to two places.
pub fn round_money(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(MONEY_SCALE);
    rounded
}

/// Converts a configured `f64` rate through its shortest decimal representation,
/// so `0.08` becomes exactly `0.08` rather than its binary expansion.
pub fn rate_from_f64(rate: f64) -> Result<Decimal, ServiceError> {
    let decimal = Decimal::from_str(&rate.to_string())
        .map_err(|e| ServiceError::InternalError(format!("invalid rate {}: {}", rate, e)))?;
    validate_rate(decimal, "rate")?;
    Ok(decimal)
}

/// Rates are fractions in `[0, 1]`.
pub fn validate_rate(rate: Decimal, name: &str) -> Result<(), ServiceError> {
    if rate < Decimal::ZERO || rate > Decimal::ONE {
        return Err(ServiceError::BadRequest(format!(
            "{} must be between 0 and 1",
            name
        )));
    }
    Ok(())
}

/// Rejects negative prices and prices above [`MAX_UNIT_PRICE`].
pub fn validate_unit_price(price: Decimal, name: &str) -> Result<(), ServiceError> {
    if price < Decimal::ZERO {
        return Err(ServiceError::BadRequest(format!(
            "{} must not be negative",
            name
        )));
    }
    if price > MAX_UNIT_PRICE {
        return Err(ServiceError::BadRequest(format!(
            "{} must not exceed {}",
            name, MAX_UNIT_PRICE
        )));
    }
    Ok(())
}

fn out_of_range() -> ServiceError {
    ServiceError::BadRequest("Amount out of range".to_string())
}

/// Sum of `unit_price * quantity` over the given lines.
pub fn subtotal<I>(lines: I) -> Result<Decimal, ServiceError>
where
    I: IntoIterator<Item = (Decimal, i32)>,
{
    lines
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, (unit_price, quantity)| {
            unit_price
                .checked_mul(Decimal::from(quantity))
                .and_then(|line| acc.checked_add(line))
                .ok_or_else(out_of_range)
        })
}

/// Prices an order.
///
/// `tax = subtotal * tax_rate`, `fees = platform_fee_rate * (subtotal + shipping)`,
/// `total = subtotal + shipping + tax + fees`. Each component is rounded to cents
/// before summing, so `total` is always exactly the sum of the stored parts.
pub fn calculate_total_with_fees(
    subtotal: Decimal,
    shipping: Decimal,
    tax_rate: Decimal,
    platform_fee_rate: Decimal,
) -> Result<PriceBreakdown, ServiceError> {
    let subtotal = round_money(subtotal);
    let shipping = round_money(shipping);
    let tax = round_money(subtotal.checked_mul(tax_rate).ok_or_else(out_of_range)?);
    let fees = round_money(
        subtotal
            .checked_add(shipping)
            .and_then(|base| base.checked_mul(platform_fee_rate))
            .ok_or_else(out_of_range)?,
    );
    let total = [shipping, tax, fees]
        .into_iter()
        .try_fold(subtotal, |acc, part| acc.checked_add(part))
        .ok_or_else(out_of_range)?;

    Ok(PriceBreakdown {
        subtotal,
        shipping,
        tax,
        fees,
        total,
    })
}

/// Converts a currency amount to integer minor units (cents).
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    amount
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|cents| cents.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|cents| cents.to_i64())
        .ok_or_else(|| ServiceError::BadRequest(format!("Amount {} is out of range", amount)))
}
