//! Subscription reconciliation.
//!
//! Applies a verified, amount-checked provider payment to subscription state.
//! Every gate is ordered and hard: nothing is mutated until all of them pass,
//! and the serialized upsert runs under a per-user advisory lock so the async
//! webhook and the synchronous verify call racing on the same transaction
//! converge on exactly one payment row and one activation.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use std::str::FromStr;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use flowline_shared::{Currency, PaymentProvider, Plan};

use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::pricing::{expected_price, provider_accepts, RENEWAL_PERIOD_DAYS};
use crate::providers::{ProviderTxStatus, VerifiedPayment};

/// Terminal outcome of applying one verified payment.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Subscription activated or renewed; the payment row was written.
    Applied {
        subscription_id: Uuid,
        old_plan: Option<Plan>,
        new_plan: Plan,
        renewal_date: OffsetDateTime,
    },
    /// A payment row for this provider reference already exists. The event
    /// is acknowledged with no further effect.
    AlreadyApplied { reference: String },
    /// Provider reports the transaction as not successful. Expected terminal
    /// outcome; the event is acknowledged as processed.
    NotSuccessful { provider_status: String },
    /// Currency outside the allow-list or unsupported by the provider.
    /// A needs-review payment row was recorded for a human to reconcile.
    CurrencyUnsupported { currency: String },
}

/// Currency gate: the raw provider currency must parse into the allow-list
/// and be settleable by the originating provider.
fn gate_currency(provider: PaymentProvider, raw: &str) -> Option<Currency> {
    let currency = Currency::from_str(raw).ok()?;
    provider_accepts(provider, currency).then_some(currency)
}

/// Amount gate: the verified amount must exactly equal the plan price.
///
/// Returns `None` when the `(plan, currency)` combination is not sold at all;
/// the caller routes that through the unsupported-currency review path.
fn gate_amount(
    plan: Plan,
    currency: Currency,
    amount_minor: i64,
) -> Option<Result<(), BillingError>> {
    let expected_minor = expected_price(plan, currency)?;
    if expected_minor == amount_minor {
        Some(Ok(()))
    } else {
        Some(Err(BillingError::AmountMismatch {
            expected_minor,
            actual_minor: amount_minor,
        }))
    }
}

fn format_amount(currency: &str, amount_minor: i64) -> String {
    format!("{} {:.2}", currency, amount_minor as f64 / 100.0)
}

#[derive(Clone)]
pub struct SubscriptionReconciler {
    pool: PgPool,
    audit: BillingEventLogger,
    email: BillingEmailService,
}

impl SubscriptionReconciler {
    pub fn new(pool: PgPool, email: BillingEmailService) -> Self {
        let audit = BillingEventLogger::new(pool.clone());
        Self { pool, audit, email }
    }

    /// Apply one verified payment. See module docs for the gate order.
    pub async fn apply(&self, payment: &VerifiedPayment) -> BillingResult<ReconcileOutcome> {
        if let ProviderTxStatus::Unsuccessful(status) = &payment.status {
            tracing::info!(
                reference = %payment.reference,
                provider_status = %status,
                "verified transaction not successful - no-op"
            );
            self.notify_failure(payment, status).await;
            return Ok(ReconcileOutcome::NotSuccessful {
                provider_status: status.clone(),
            });
        }

        // Gate 1 (fast path): duplicate by provider reference. Re-checked
        // under the lock below; this check only avoids lock traffic for the
        // common replay case.
        if self.payment_exists(payment.provider, &payment.reference).await? {
            tracing::info!(
                reference = %payment.reference,
                "payment reference already applied"
            );
            return Ok(ReconcileOutcome::AlreadyApplied {
                reference: payment.reference.clone(),
            });
        }

        // Gate 2: currency/provider compatibility.
        let Some(currency) = gate_currency(payment.provider, &payment.currency) else {
            tracing::warn!(
                reference = %payment.reference,
                currency = %payment.currency,
                provider = %payment.provider,
                "unsupported currency - recording for review"
            );
            self.record_needs_review(payment, "currency_unsupported").await?;
            return Ok(ReconcileOutcome::CurrencyUnsupported {
                currency: payment.currency.clone(),
            });
        };

        // Gate 3: amount integrity against the static price table.
        match gate_amount(payment.plan, currency, payment.amount_minor) {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                tracing::warn!(
                    reference = %payment.reference,
                    plan = %payment.plan,
                    amount_minor = payment.amount_minor,
                    "amount mismatch - recording for review"
                );
                self.record_needs_review(payment, "amount_mismatch").await?;
                return Err(err);
            }
            None => {
                self.record_needs_review(payment, "combination_not_sold").await?;
                return Ok(ReconcileOutcome::CurrencyUnsupported {
                    currency: payment.currency.clone(),
                });
            }
        }

        // Gates passed: serialized upsert.
        let outcome = self.apply_locked(payment, currency).await?;

        if let ReconcileOutcome::Applied { new_plan, .. } = &outcome {
            self.notify_success(payment, *new_plan).await;
        }

        Ok(outcome)
    }

    /// The locked read-then-write section.
    ///
    /// `pg_advisory_xact_lock` keyed by the user id serializes every
    /// subscription-mutating path for that user (both webhook deliveries,
    /// the verify endpoint, flow creation). The lock is scoped to the user
    /// key rather than a row because the insert case has no row to lock yet;
    /// it releases automatically at transaction end, so a crashed handler
    /// cannot leave it dangling.
    async fn apply_locked(
        &self,
        payment: &VerifiedPayment,
        currency: Currency,
    ) -> BillingResult<ReconcileOutcome> {
        let now = OffsetDateTime::now_utc();
        let renewal_date = now + Duration::days(RENEWAL_PERIOD_DAYS);

        let mut tx = self.pool.begin().await?;
        acquire_user_lock(&mut tx, payment.user_id).await?;

        // Re-check the reference under the lock: a racing path may have
        // applied it between the fast-path check and here.
        let dup: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM payments WHERE provider = $1 AND reference = $2",
        )
        .bind(payment.provider.as_str())
        .bind(&payment.reference)
        .fetch_optional(&mut *tx)
        .await?;
        if dup.is_some() {
            tx.rollback().await?;
            return Ok(ReconcileOutcome::AlreadyApplied {
                reference: payment.reference.clone(),
            });
        }

        // The user's current authoritative plan, for the transition audit.
        let old_plan: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT plan FROM subscriptions
            WHERE user_id = $1 AND status IN ('active', 'trialing')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(payment.user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let old_plan = old_plan.and_then(|(p,)| Plan::from_str(&p).ok());

        // Most recent row for this (user, plan): renew it if present,
        // otherwise insert a fresh active row.
        let existing: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM subscriptions
            WHERE user_id = $1 AND plan = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(payment.user_id)
        .bind(payment.plan.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let subscription_id = match existing {
            Some((id,)) => {
                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET status = 'active', renewal_date = $2, currency = $3, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(renewal_date)
                .bind(currency.as_str())
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                let id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO subscriptions
                        (id, user_id, plan, status, currency, renewal_date, created_at, updated_at)
                    VALUES ($1, $2, $3, 'active', $4, $5, NOW(), NOW())
                    "#,
                )
                .bind(id)
                .bind(payment.user_id)
                .bind(payment.plan.as_str())
                .bind(currency.as_str())
                .bind(renewal_date)
                .execute(&mut *tx)
                .await?;
                id
            }
        };

        // Payment row: the business-effect idempotence record. Written in
        // the same transaction as the subscription change, so either both
        // exist or neither does.
        sqlx::query(
            r#"
            INSERT INTO payments
                (id, user_id, provider, reference, amount_minor, currency, status, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'succeeded', $7, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(payment.user_id)
        .bind(payment.provider.as_str())
        .bind(&payment.reference)
        .bind(payment.amount_minor)
        .bind(currency.as_str())
        .bind(serde_json::json!({ "plan": payment.plan.as_str() }))
        .execute(&mut *tx)
        .await?;

        // Plan transition audit, same transaction.
        sqlx::query(
            r#"
            INSERT INTO billing_events (id, user_id, event_type, reference, data, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(payment.user_id)
        .bind(BillingEventType::PlanTransition.as_str())
        .bind(&payment.reference)
        .bind(serde_json::json!({
            "old_plan": old_plan.map(|p| p.as_str()),
            "new_plan": payment.plan.as_str(),
            "amount_minor": payment.amount_minor,
            "currency": currency.as_str(),
        }))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %payment.user_id,
            plan = %payment.plan,
            reference = %payment.reference,
            subscription_id = %subscription_id,
            "subscription reconciled"
        );

        Ok(ReconcileOutcome::Applied {
            subscription_id,
            old_plan,
            new_plan: payment.plan,
            renewal_date,
        })
    }

    async fn payment_exists(
        &self,
        provider: PaymentProvider,
        reference: &str,
    ) -> BillingResult<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM payments WHERE provider = $1 AND reference = $2",
        )
        .bind(provider.as_str())
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Record a rejected payment for human review. The row keeps the raw
    /// amount/currency the provider reported; payments stay immutable, so
    /// review state is a flag on insert, not a later update.
    async fn record_needs_review(
        &self,
        payment: &VerifiedPayment,
        reason: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments
                (id, user_id, provider, reference, amount_minor, currency, status,
                 needs_review, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'failed', TRUE, $7, NOW())
            ON CONFLICT (provider, reference) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(payment.user_id)
        .bind(payment.provider.as_str())
        .bind(&payment.reference)
        .bind(payment.amount_minor)
        .bind(&payment.currency)
        .bind(serde_json::json!({
            "plan": payment.plan.as_str(),
            "reason": reason,
        }))
        .execute(&self.pool)
        .await?;

        if let Err(e) = self
            .audit
            .log(
                BillingEventBuilder::new(BillingEventType::PaymentNeedsReview)
                    .user(payment.user_id)
                    .reference(&payment.reference)
                    .data(serde_json::json!({
                        "reason": reason,
                        "amount_minor": payment.amount_minor,
                        "currency": payment.currency,
                    })),
            )
            .await
        {
            tracing::warn!(reference = %payment.reference, error = %e, "failed to audit needs-review payment");
        }

        Ok(())
    }

    async fn notify_success(&self, payment: &VerifiedPayment, plan: Plan) {
        if let Ok(Some(email)) = self.user_email(payment.user_id).await {
            let amount = format_amount(&payment.currency, payment.amount_minor);
            if let Err(e) = self
                .email
                .send_payment_success(&email, plan.as_str(), &amount)
                .await
            {
                tracing::error!(user_id = %payment.user_id, error = %e, "failed to send payment success email");
            }
        }
    }

    async fn notify_failure(&self, payment: &VerifiedPayment, reason: &str) {
        if let Ok(Some(email)) = self.user_email(payment.user_id).await {
            if let Err(e) = self.email.send_payment_failed(&email, reason).await {
                tracing::error!(user_id = %payment.user_id, error = %e, "failed to send payment failure email");
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

/// Take the transaction-scoped advisory lock for a user key.
///
/// `hashtext` runs server-side so every caller derives the lock key the same
/// way regardless of language or driver.
pub(crate) async fn acquire_user_lock(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> BillingResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(user_id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_gate_rejects_unknown_code() {
        assert!(gate_currency(PaymentProvider::Flutterwave, "GHS").is_none());
    }

    #[test]
    fn currency_gate_rejects_provider_mismatch() {
        // Paystack settles NGN only; a USD charge through it is structurally
        // wrong and must land in review, not activate anything.
        assert!(gate_currency(PaymentProvider::Paystack, "USD").is_none());
        assert_eq!(
            gate_currency(PaymentProvider::Paystack, "NGN"),
            Some(Currency::Ngn)
        );
        assert_eq!(
            gate_currency(PaymentProvider::Flutterwave, "usd"),
            Some(Currency::Usd)
        );
    }

    #[test]
    fn amount_gate_requires_exact_equality() {
        assert!(matches!(
            gate_amount(Plan::Starter, Currency::Ngn, 2_000_000),
            Some(Ok(()))
        ));

        match gate_amount(Plan::Starter, Currency::Ngn, 1_500_000) {
            Some(Err(BillingError::AmountMismatch {
                expected_minor,
                actual_minor,
            })) => {
                assert_eq!(expected_minor, 2_000_000);
                assert_eq!(actual_minor, 1_500_000);
            }
            other => panic!("expected AmountMismatch, got {other:?}"),
        }
    }

    #[test]
    fn amount_gate_rejects_overpayment_too() {
        // An overpaid amount is just as suspicious as an underpaid one.
        assert!(matches!(
            gate_amount(Plan::Starter, Currency::Ngn, 2_000_001),
            Some(Err(_))
        ));
    }

    #[test]
    fn amount_display_formats_minor_units() {
        assert_eq!(format_amount("NGN", 2_000_000), "NGN 20000.00");
        assert_eq!(format_amount("USD", 1_500), "USD 15.00");
    }
}
