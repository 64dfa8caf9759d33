//! Payment provider integrations.
//!
//! Each provider client enforces two independent gates before the rest of the
//! pipeline may trust an event:
//!
//! 1. Transport authenticity: the webhook signature over the raw body checks
//!    out against the provider secret (constant-time compare).
//! 2. Server-side re-verification: the transaction is fetched from the
//!    provider's verify endpoint, and only that response is authoritative for
//!    status, amount and currency. A forged webhook body is worthless even if
//!    it carries a replayed signature.

mod flutterwave;
mod paystack;

pub use flutterwave::FlutterwaveClient;
pub use paystack::PaystackClient;

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use flowline_shared::{Environment, PaymentProvider, Plan};

use crate::error::{BillingError, BillingResult};

/// Provider-reported transaction status, normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderTxStatus {
    Succeeded,
    /// Any non-success terminal state; carries the provider's own word for it
    /// ("failed", "abandoned", ...).
    Unsuccessful(String),
}

impl ProviderTxStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ProviderTxStatus::Succeeded)
    }
}

/// A provider transaction after server-side re-verification.
///
/// `currency` stays a raw string here: the currency allow-list check is the
/// reconciler's gate, and a rejected currency still has to be recorded
/// verbatim in the review trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedPayment {
    pub provider: PaymentProvider,
    pub reference: String,
    pub status: ProviderTxStatus,
    pub amount_minor: i64,
    pub currency: String,
    pub user_id: Uuid,
    pub plan: Plan,
}

/// Checkout metadata we attach when initializing a transaction and expect
/// back on verification.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CheckoutMetadata {
    pub user_id: Option<String>,
    pub plan: Option<String>,
}

impl CheckoutMetadata {
    /// Extract and validate the fields the reconciler requires.
    pub(crate) fn into_parts(self) -> BillingResult<(Uuid, Plan)> {
        let user_id = self
            .user_id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| BillingError::MissingMetadata("user_id".into()))?;
        let plan = self
            .plan
            .as_deref()
            .and_then(|s| Plan::from_str(s).ok())
            .ok_or_else(|| BillingError::MissingMetadata("plan".into()))?;
        Ok((user_id, plan))
    }
}

/// Outcome of a signature check when the provider secret is absent.
///
/// Production treats a missing secret as a hard failure; elsewhere we accept
/// the event but say so loudly, which keeps local development workable
/// without webhook secrets.
pub(crate) fn missing_secret_policy(
    provider: PaymentProvider,
    environment: Environment,
) -> BillingResult<()> {
    if environment.is_production() {
        tracing::error!(provider = %provider, "webhook secret missing in production");
        return Err(BillingError::ProviderNotConfigured(provider));
    }
    tracing::warn!(
        provider = %provider,
        "webhook secret missing - accepting unsigned event (non-production only)"
    );
    Ok(())
}

/// Front door to both provider clients; dispatches on the provider enum.
#[derive(Clone)]
pub struct PaymentVerifier {
    paystack: PaystackClient,
    flutterwave: FlutterwaveClient,
}

impl PaymentVerifier {
    pub fn from_env(environment: Environment) -> Self {
        Self {
            paystack: PaystackClient::from_env(environment),
            flutterwave: FlutterwaveClient::from_env(environment),
        }
    }

    pub fn new(paystack: PaystackClient, flutterwave: FlutterwaveClient) -> Self {
        Self {
            paystack,
            flutterwave,
        }
    }

    /// Gate 1: transport authenticity of the raw webhook body.
    pub fn verify_signature(
        &self,
        provider: PaymentProvider,
        signature: &str,
        raw_body: &[u8],
    ) -> BillingResult<()> {
        match provider {
            PaymentProvider::Paystack => self.paystack.verify_signature(signature, raw_body),
            PaymentProvider::Flutterwave => self.flutterwave.verify_signature(signature),
        }
    }

    /// Gate 2: authoritative transaction lookup at the provider.
    pub async fn fetch_transaction(
        &self,
        provider: PaymentProvider,
        reference: &str,
    ) -> BillingResult<VerifiedPayment> {
        match provider {
            PaymentProvider::Paystack => self.paystack.fetch_transaction(reference).await,
            PaymentProvider::Flutterwave => self.flutterwave.fetch_transaction(reference).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_requires_user_id() {
        let meta = CheckoutMetadata {
            user_id: None,
            plan: Some("starter".into()),
        };
        assert!(matches!(
            meta.into_parts(),
            Err(BillingError::MissingMetadata(field)) if field == "user_id"
        ));
    }

    #[test]
    fn metadata_requires_known_plan() {
        let meta = CheckoutMetadata {
            user_id: Some(Uuid::new_v4().to_string()),
            plan: Some("platinum".into()),
        };
        assert!(matches!(
            meta.into_parts(),
            Err(BillingError::MissingMetadata(field)) if field == "plan"
        ));
    }

    #[test]
    fn metadata_accepts_uppercase_plan() {
        let meta = CheckoutMetadata {
            user_id: Some(Uuid::new_v4().to_string()),
            plan: Some("GROWTH".into()),
        };
        let (_, plan) = meta.into_parts().unwrap();
        assert_eq!(plan, Plan::Growth);
    }

    #[test]
    fn missing_secret_fails_hard_in_production() {
        assert!(missing_secret_policy(PaymentProvider::Paystack, Environment::Production).is_err());
        assert!(
            missing_secret_policy(PaymentProvider::Paystack, Environment::Development).is_ok()
        );
    }
}
