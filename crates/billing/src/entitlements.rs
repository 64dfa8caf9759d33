//! Entitlement resolution.
//!
//! Answers "what can this user do right now?" from the latest authoritative
//! subscription row and wall-clock time. The computation itself is a pure
//! function (same inputs, same outputs, no writes); the only side effect on
//! the read path is the idempotent trial-expiry audit entry, which is an
//! append-if-absent and therefore safe to attempt on every request.
//!
//! Trial expiry is never a stored transition: a row can sit in `trialing`
//! past its `trial_ends_at` forever, and resolution computes the lapse.

use serde::Serialize;
use sqlx::PgPool;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use flowline_shared::{Plan, PlanTier, SubscriptionStatus};

use crate::email::BillingEmailService;
use crate::error::BillingResult;
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};

/// The authoritative subscription row, as loaded. Raw strings are kept so
/// the pure computation can flag data-integrity problems instead of erroring.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RawSubscription {
    pub id: Uuid,
    pub plan: String,
    pub status: String,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Per-feature capability flags derived from `(tier, is_trial_active)`.
///
/// AI and WhatsApp require a non-trial subscription: a trial does not unlock
/// them regardless of tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeatureSet {
    pub dashboard: bool,
    pub automations: bool,
    pub invoicing: bool,
    pub ai_assistant: bool,
    pub whatsapp: bool,
}

impl FeatureSet {
    pub fn derive(tier: PlanTier, is_trial_active: bool) -> Self {
        Self {
            dashboard: true,
            automations: tier.is_at_least(PlanTier::Starter),
            invoicing: true,
            ai_assistant: tier.is_at_least(PlanTier::Growth) && !is_trial_active,
            whatsapp: tier.is_at_least(PlanTier::Growth) && !is_trial_active,
        }
    }
}

/// Resolved entitlement for one user at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct Entitlement {
    /// Effective tier after trial/status resolution. This, not the stored
    /// plan, is what quota and capability checks consult.
    pub tier: PlanTier,
    /// The stored plan on the authoritative row, if one exists and parses.
    pub subscribed_plan: Option<Plan>,
    /// Stored status of the authoritative row.
    pub status: Option<SubscriptionStatus>,
    pub is_trial_active: bool,
    /// The row is `trialing` but its trial end has passed; effective tier is
    /// Free and a trial-expiry audit entry should exist.
    pub trial_lapsed: bool,
    /// The row claims active/trialing but its plan did not parse. Upstream
    /// data-integrity bug; resolution falls back to Free and the caller
    /// logs it, never silently corrects it.
    pub plan_invariant_violation: bool,
    pub features: FeatureSet,
    pub computed_at: OffsetDateTime,
}

impl Entitlement {
    fn free(now: OffsetDateTime) -> Self {
        Self {
            tier: PlanTier::Free,
            subscribed_plan: None,
            status: None,
            is_trial_active: false,
            trial_lapsed: false,
            plan_invariant_violation: false,
            features: FeatureSet::derive(PlanTier::Free, false),
            computed_at: now,
        }
    }
}

/// Pure entitlement computation. No clock reads, no I/O: `now` is an input.
pub fn compute_entitlement(raw: Option<&RawSubscription>, now: OffsetDateTime) -> Entitlement {
    let Some(raw) = raw else {
        return Entitlement::free(now);
    };

    let status = SubscriptionStatus::from_str(&raw.status).ok();
    let plan = Plan::from_str(&raw.plan).ok();

    let Some(status) = status else {
        // Unknown status string: treat like an inactive row.
        return Entitlement {
            plan_invariant_violation: true,
            ..Entitlement::free(now)
        };
    };

    if !status.is_authoritative() {
        // past_due / canceled / inactive rows confer nothing.
        return Entitlement {
            status: Some(status),
            subscribed_plan: plan,
            ..Entitlement::free(now)
        };
    }

    let Some(plan) = plan else {
        // Active or trialing but the plan does not parse.
        return Entitlement {
            status: Some(status),
            plan_invariant_violation: true,
            ..Entitlement::free(now)
        };
    };

    match status {
        SubscriptionStatus::Active => Entitlement {
            tier: plan.tier(),
            subscribed_plan: Some(plan),
            status: Some(status),
            is_trial_active: false,
            trial_lapsed: false,
            plan_invariant_violation: false,
            features: FeatureSet::derive(plan.tier(), false),
            computed_at: now,
        },
        SubscriptionStatus::Trialing => {
            let trial_active = raw.trial_ends_at.map(|end| end >= now).unwrap_or(false);
            if trial_active {
                Entitlement {
                    tier: plan.tier(),
                    subscribed_plan: Some(plan),
                    status: Some(status),
                    is_trial_active: true,
                    trial_lapsed: false,
                    plan_invariant_violation: false,
                    features: FeatureSet::derive(plan.tier(), true),
                    computed_at: now,
                }
            } else {
                Entitlement {
                    subscribed_plan: Some(plan),
                    status: Some(status),
                    trial_lapsed: true,
                    ..Entitlement::free(now)
                }
            }
        }
        // Unreachable: is_authoritative() filtered the rest.
        _ => Entitlement::free(now),
    }
}

#[derive(Clone)]
pub struct EntitlementService {
    pool: PgPool,
    audit: BillingEventLogger,
    email: BillingEmailService,
}

impl EntitlementService {
    pub fn new(pool: PgPool, email: BillingEmailService) -> Self {
        let audit = BillingEventLogger::new(pool.clone());
        Self { pool, audit, email }
    }

    /// Resolve the current entitlement for a user.
    ///
    /// Reads take no lock: an entitlement check racing one in-flight
    /// reconciliation sees either the old or the new row, both valid states.
    pub async fn resolve(&self, user_id: Uuid) -> BillingResult<Entitlement> {
        let raw = self.load_authoritative(user_id).await?;
        let entitlement = compute_entitlement(raw.as_ref(), OffsetDateTime::now_utc());

        if entitlement.plan_invariant_violation {
            tracing::warn!(
                user_id = %user_id,
                plan = raw.as_ref().map(|r| r.plan.as_str()),
                status = raw.as_ref().map(|r| r.status.as_str()),
                "plan_invariant_violation: authoritative subscription resolved to free"
            );
        }

        if entitlement.trial_lapsed {
            if let Some(raw) = &raw {
                self.ensure_trial_expiry_logged(user_id, raw.id).await;
            }
        }

        Ok(entitlement)
    }

    async fn load_authoritative(&self, user_id: Uuid) -> BillingResult<Option<RawSubscription>> {
        let raw: Option<RawSubscription> = sqlx::query_as(
            r#"
            SELECT id, plan, status, trial_ends_at, created_at
            FROM subscriptions
            WHERE user_id = $1 AND status IN ('active', 'trialing')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(raw)
    }

    /// Append the trial-expiry audit entry at most once per subscription.
    ///
    /// Resolution may run on every request; the log-if-absent keyed on the
    /// subscription id keeps the audit trail single-entry and the row itself
    /// untouched.
    async fn ensure_trial_expiry_logged(&self, user_id: Uuid, subscription_id: Uuid) {
        let entry = BillingEventBuilder::new(BillingEventType::TrialExpired)
            .user(user_id)
            .reference(subscription_id.to_string());

        match self.audit.log_once(entry).await {
            Ok(true) => {
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %subscription_id,
                    "trial expired"
                );
                if let Ok(Some(email)) = self.user_email(user_id).await {
                    if let Err(e) = self.email.send_trial_expired(&email).await {
                        tracing::error!(user_id = %user_id, error = %e, "failed to send trial expired email");
                    }
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "failed to log trial expiry");
            }
        }
    }

    async fn user_email(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(email,)| email))
    }
}
