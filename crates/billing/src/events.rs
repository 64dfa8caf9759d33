//! Append-only billing audit log.
//!
//! Every state transition the billing core performs leaves an entry here.
//! Entries are never updated or deleted. Logging failures are reported as
//! warnings at call sites and never fail the operation being audited.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Typed audit event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    PaymentRecorded,
    PaymentNeedsReview,
    PlanTransition,
    TrialExpired,
    WebhookProcessed,
    WebhookFailed,
    UpgradeRequired,
    FlowLimitReached,
}

impl BillingEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            BillingEventType::PaymentRecorded => "payment_recorded",
            BillingEventType::PaymentNeedsReview => "payment_needs_review",
            BillingEventType::PlanTransition => "billing_plan_transition",
            BillingEventType::TrialExpired => "trial_expired",
            BillingEventType::WebhookProcessed => "webhook_processed",
            BillingEventType::WebhookFailed => "webhook_failed",
            BillingEventType::UpgradeRequired => "upgrade_required",
            BillingEventType::FlowLimitReached => "flow_limit_reached",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder for a single audit entry.
#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    user_id: Option<Uuid>,
    event_type: BillingEventType,
    reference: Option<String>,
    data: serde_json::Value,
}

impl BillingEventBuilder {
    pub fn new(event_type: BillingEventType) -> Self {
        Self {
            user_id: None,
            event_type,
            reference: None,
            data: serde_json::json!({}),
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Correlation key, e.g. a provider transaction reference or event id.
    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// A persisted audit entry.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingEvent {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub reference: Option<String>,
    pub data: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Writes audit entries.
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one entry unconditionally.
    pub async fn log(&self, event: BillingEventBuilder) -> BillingResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO billing_events (id, user_id, event_type, reference, data, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(id)
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(&event.reference)
        .bind(&event.data)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Append one entry only if no entry with the same
    /// `(user_id, event_type, reference)` key exists yet.
    ///
    /// This is the idempotence primitive for audit writes that can be
    /// attempted on every request, such as trial-expiry logging on the
    /// entitlement read path. Returns true when a new entry was written.
    pub async fn log_once(&self, event: BillingEventBuilder) -> BillingResult<bool> {
        let existing: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM billing_events
            WHERE user_id = $1 AND event_type = $2
              AND reference IS NOT DISTINCT FROM $3
            LIMIT 1
            "#,
        )
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(&event.reference)
        .fetch_optional(&self.pool)
        .await?;

        if existing.is_some() {
            return Ok(false);
        }

        self.log(event).await?;
        Ok(true)
    }

    /// Does an entry with this key already exist?
    pub async fn exists(
        &self,
        user_id: Uuid,
        event_type: BillingEventType,
        reference: Option<&str>,
    ) -> BillingResult<bool> {
        let existing: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM billing_events
            WHERE user_id = $1 AND event_type = $2
              AND reference IS NOT DISTINCT FROM $3
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(event_type.as_str())
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(existing.is_some())
    }
}
