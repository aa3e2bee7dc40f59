use marketplace_checkout::services::pricing_service::{
    calculate_total_with_fees, round_money, subtotal, to_minor_units,
};
use proptest::prelude::*;
use rust_decimal::Decimal;

fn cents(max: i64) -> impl Strategy<Value = Decimal> {
    (0..=max).prop_map(|c| Decimal::new(c, 2))
}

fn rate() -> impl Strategy<Value = Decimal> {
    (0i64..=10_000).prop_map(|bp| Decimal::new(bp, 4))
}

proptest! {
    #[test]
    fn total_is_the_sum_of_its_rounded_parts(
        lines in prop::collection::vec((cents(100_000), 1i32..20), 1..8),
        shipping in cents(5_000),
        tax_rate in rate(),
        fee_rate in rate(),
    ) {
        let breakdown =
            calculate_total_with_fees(subtotal(lines).unwrap(), shipping, tax_rate, fee_rate).unwrap();

        prop_assert_eq!(
            breakdown.total,
            breakdown.subtotal + breakdown.shipping + breakdown.tax + breakdown.fees
        );
        for part in [breakdown.subtotal, breakdown.shipping, breakdown.tax, breakdown.fees, breakdown.total] {
            prop_assert_eq!(part.scale(), 2);
            prop_assert!(part >= Decimal::ZERO);
        }
    }

    #[test]
    fn charged_amount_matches_stored_total(
        lines in prop::collection::vec((cents(100_000), 1i32..20), 1..8),
        shipping in cents(5_000),
        tax_rate in rate(),
        fee_rate in rate(),
    ) {
        let breakdown =
            calculate_total_with_fees(subtotal(lines).unwrap(), shipping, tax_rate, fee_rate).unwrap();
        let minor = to_minor_units(breakdown.total).unwrap();

        prop_assert_eq!(Decimal::new(minor, 2), breakdown.total);
    }

    #[test]
    fn rounding_moves_at_most_half_a_cent(amount in -10_000_000i64..10_000_000, scale in 0u32..6) {
        let value = Decimal::new(amount, scale);
        let rounded = round_money(value);

        prop_assert!((rounded - value).abs() <= Decimal::new(5, 3));
        prop_assert_eq!(round_money(rounded), rounded);
    }
}
