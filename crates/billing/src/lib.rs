// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Reconciliation writes carry many bound columns
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Flowline Billing Core
//!
//! Turns untrusted, possibly-duplicated, possibly-out-of-order payment
//! provider webhook events into authoritative subscription state, and
//! answers every entitlement/usage question paid features ask before
//! executing.
//!
//! ## Pipeline
//!
//! inbound webhook → event ledger (dedupe claim) → provider verifier
//! (signature + server-side re-verification) → amount check against the
//! price table → subscription reconciler (per-user serialized upsert) →
//! ledger marked processed/failed.
//!
//! Independently, the entitlement resolver and usage limiter serve reads
//! with no locks; the automation step gate consults both before a
//! plan-restricted workflow step runs.

pub mod email;
pub mod entitlements;
pub mod error;
pub mod events;
pub mod gate;
pub mod invariants;
pub mod ledger;
pub mod pricing;
pub mod providers;
pub mod reconciler;
pub mod usage;

#[cfg(test)]
mod edge_case_tests;

// Email
pub use email::BillingEmailService;

// Entitlements
pub use entitlements::{
    compute_entitlement, Entitlement, EntitlementService, FeatureSet, RawSubscription,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType};

// Gate
pub use gate::{requirement, GateDecision, StepGate, StepKind, StepRequirement};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{payload_hash, ClaimDisposition, EventClaim, EventStatus, WebhookLedger};

// Pricing
pub use pricing::{expected_price, provider_accepts, RENEWAL_PERIOD_DAYS};

// Providers
pub use providers::{
    FlutterwaveClient, PaymentVerifier, PaystackClient, ProviderTxStatus, VerifiedPayment,
};

// Reconciler
pub use reconciler::{ReconcileOutcome, SubscriptionReconciler};

// Usage
pub use usage::{
    flow_limit, month_start_utc, quota, FlowCreation, UsageCategory, UsageDecision, UsageDenial,
    UsageMeter,
};

use flowline_shared::Environment;
use sqlx::PgPool;

/// Main billing service combining the whole reconciliation core.
pub struct BillingService {
    pub verifier: PaymentVerifier,
    pub ledger: WebhookLedger,
    pub reconciler: SubscriptionReconciler,
    pub entitlements: EntitlementService,
    pub usage: UsageMeter,
    pub gate: StepGate,
    pub events: BillingEventLogger,
    pub email: BillingEmailService,
}

impl BillingService {
    /// Create the billing service from environment variables.
    pub fn from_env(pool: PgPool) -> Self {
        let environment = Environment::from_env();
        let email = BillingEmailService::from_env();
        Self::new(pool, PaymentVerifier::from_env(environment), email)
    }

    /// Create the billing service with explicit collaborators.
    pub fn new(pool: PgPool, verifier: PaymentVerifier, email: BillingEmailService) -> Self {
        let events = BillingEventLogger::new(pool.clone());
        let usage = UsageMeter::new(pool.clone(), email.clone());
        let gate = StepGate::new(usage.clone(), events.clone());

        Self {
            verifier,
            ledger: WebhookLedger::new(pool.clone()),
            reconciler: SubscriptionReconciler::new(pool.clone(), email.clone()),
            entitlements: EntitlementService::new(pool, email.clone()),
            usage,
            gate,
            events,
            email,
        }
    }
}
