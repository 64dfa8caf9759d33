//! Static plan pricing and currency reference data.
//!
//! Pure lookup, no state. The amount-integrity gate in the reconciler
//! compares verified amounts against this table for exact equality; there is
//! no tolerance band, because the only legitimate source of a charge is our
//! own checkout initialization which uses the same table.

use flowline_shared::{Currency, PaymentProvider, Plan};

/// Monthly price in the currency's minor unit (kobo, cents).
///
/// `None` means the combination is not sold.
pub fn expected_price(plan: Plan, currency: Currency) -> Option<i64> {
    match (plan, currency) {
        (Plan::Starter, Currency::Ngn) => Some(2_000_000),
        (Plan::Starter, Currency::Usd) => Some(1_500),
        (Plan::Growth, Currency::Ngn) => Some(5_000_000),
        (Plan::Growth, Currency::Usd) => Some(3_500),
        (Plan::Enterprise, Currency::Ngn) => Some(20_000_000),
        (Plan::Enterprise, Currency::Usd) => Some(15_000),
    }
}

/// Is this `(provider, currency)` pair accepted at all?
///
/// Currency must be on the platform allow-list (enforced by the `Currency`
/// type itself) and settleable by the originating provider.
pub fn provider_accepts(provider: PaymentProvider, currency: Currency) -> bool {
    provider.supports_currency(currency)
}

/// Number of days a successful payment extends a subscription.
pub const RENEWAL_PERIOD_DAYS: i64 = 30;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_plan_priced_in_every_currency() {
        for plan in [Plan::Starter, Plan::Growth, Plan::Enterprise] {
            for currency in [Currency::Ngn, Currency::Usd] {
                assert!(
                    expected_price(plan, currency).is_some(),
                    "{plan}/{currency} missing from price table"
                );
            }
        }
    }

    #[test]
    fn prices_rank_with_plans() {
        for currency in [Currency::Ngn, Currency::Usd] {
            let starter = expected_price(Plan::Starter, currency).unwrap();
            let growth = expected_price(Plan::Growth, currency).unwrap();
            let enterprise = expected_price(Plan::Enterprise, currency).unwrap();
            assert!(starter < growth && growth < enterprise);
        }
    }

    #[test]
    fn paystack_rejects_usd() {
        assert!(!provider_accepts(PaymentProvider::Paystack, Currency::Usd));
        assert!(provider_accepts(PaymentProvider::Paystack, Currency::Ngn));
        assert!(provider_accepts(PaymentProvider::Flutterwave, Currency::Usd));
    }
}
