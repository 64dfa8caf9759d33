//! Core billing vocabulary shared across crates.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Effective subscription tier, including the implicit free tier.
///
/// The discriminants define the capability rank: a tier grants everything a
/// lower-ranked tier grants. Capability checks must go through
/// [`PlanTier::is_at_least`] rather than comparing tiers ad hoc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PlanTier {
    Free = 0,
    Starter = 1,
    Growth = 2,
    Enterprise = 3,
}

impl PlanTier {
    pub fn rank(self) -> u8 {
        self as u8
    }

    /// Monotonic plan comparison: does `self` grant at least what `other` grants?
    pub fn is_at_least(self, other: PlanTier) -> bool {
        self.rank() >= other.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Starter => "starter",
            PlanTier::Growth => "growth",
            PlanTier::Enterprise => "enterprise",
        }
    }
}

impl FromStr for PlanTier {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(PlanTier::Free),
            "starter" => Ok(PlanTier::Starter),
            "growth" => Ok(PlanTier::Growth),
            "enterprise" => Ok(PlanTier::Enterprise),
            other => Err(UnknownValue::new("plan tier", other)),
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Purchasable plan. The free tier is not a plan: it is the absence of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Starter,
    Growth,
    Enterprise,
}

impl Plan {
    pub fn tier(self) -> PlanTier {
        match self {
            Plan::Starter => PlanTier::Starter,
            Plan::Growth => PlanTier::Growth,
            Plan::Enterprise => PlanTier::Enterprise,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Starter => "starter",
            Plan::Growth => "growth",
            Plan::Enterprise => "enterprise",
        }
    }
}

impl FromStr for Plan {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Provider metadata arrives uppercased from some checkout flows.
        match s.to_ascii_lowercase().as_str() {
            "starter" => Ok(Plan::Starter),
            "growth" => Ok(Plan::Growth),
            "enterprise" => Ok(Plan::Enterprise),
            other => Err(UnknownValue::new("plan", other)),
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settlement currencies the platform accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Ngn,
    Usd,
}

impl Currency {
    pub fn as_str(self) -> &'static str {
        match self {
            Currency::Ngn => "NGN",
            Currency::Usd => "USD",
        }
    }
}

impl FromStr for Currency {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NGN" => Ok(Currency::Ngn),
            "USD" => Ok(Currency::Usd),
            other => Err(UnknownValue::new("currency", other)),
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment providers the platform integrates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    Paystack,
    Flutterwave,
}

impl PaymentProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentProvider::Paystack => "paystack",
            PaymentProvider::Flutterwave => "flutterwave",
        }
    }

    /// Currencies the provider can settle. Paystack is NGN-only.
    pub fn supports_currency(self, currency: Currency) -> bool {
        match self {
            PaymentProvider::Paystack => matches!(currency, Currency::Ngn),
            PaymentProvider::Flutterwave => {
                matches!(currency, Currency::Ngn | Currency::Usd)
            }
        }
    }
}

impl FromStr for PaymentProvider {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paystack" => Ok(PaymentProvider::Paystack),
            "flutterwave" => Ok(PaymentProvider::Flutterwave),
            other => Err(UnknownValue::new("payment provider", other)),
        }
    }
}

impl std::fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored subscription status.
///
/// Trial expiry is deliberately not a stored transition: a row can remain
/// `Trialing` past its trial_ends_at, and the entitlement resolver computes
/// the lapse on the read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Inactive,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Inactive => "inactive",
        }
    }

    /// Statuses that make a row authoritative for entitlement resolution.
    pub fn is_authoritative(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }
}

impl FromStr for SubscriptionStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "inactive" => Ok(SubscriptionStatus::Inactive),
            other => Err(UnknownValue::new("subscription status", other)),
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment environment. Controls whether missing provider secrets are a
/// hard failure (production) or a loud warning (everything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    pub fn from_env() -> Self {
        match std::env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Parse failure for one of the closed string vocabularies above.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownValue {
    kind: &'static str,
    value: String,
}

impl UnknownValue {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_rank_is_total_order() {
        let tiers = [
            PlanTier::Free,
            PlanTier::Starter,
            PlanTier::Growth,
            PlanTier::Enterprise,
        ];
        for (i, lower) in tiers.iter().enumerate() {
            for higher in &tiers[i..] {
                assert!(higher.is_at_least(*lower), "{higher} >= {lower}");
            }
            for higher in &tiers[i + 1..] {
                assert!(!lower.is_at_least(*higher), "{lower} < {higher}");
            }
        }
    }

    #[test]
    fn tier_at_least_self_is_reflexive() {
        for tier in [
            PlanTier::Free,
            PlanTier::Starter,
            PlanTier::Growth,
            PlanTier::Enterprise,
        ] {
            assert!(tier.is_at_least(tier));
        }
    }

    #[test]
    fn plan_parses_uppercase_metadata() {
        assert_eq!("STARTER".parse::<Plan>().unwrap(), Plan::Starter);
        assert_eq!("growth".parse::<Plan>().unwrap(), Plan::Growth);
        assert!("premium".parse::<Plan>().is_err());
    }

    #[test]
    fn paystack_is_ngn_only() {
        assert!(PaymentProvider::Paystack.supports_currency(Currency::Ngn));
        assert!(!PaymentProvider::Paystack.supports_currency(Currency::Usd));
        assert!(PaymentProvider::Flutterwave.supports_currency(Currency::Usd));
    }

    #[test]
    fn status_round_trips() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Inactive,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), status);
        }
    }

    #[test]
    fn authoritative_statuses() {
        assert!(SubscriptionStatus::Active.is_authoritative());
        assert!(SubscriptionStatus::Trialing.is_authoritative());
        assert!(!SubscriptionStatus::PastDue.is_authoritative());
        assert!(!SubscriptionStatus::Canceled.is_authoritative());
    }
}
