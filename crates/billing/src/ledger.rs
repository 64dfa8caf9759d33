//! Webhook event ledger.
//!
//! Durable dedupe table keyed by `(provider, event_id)`, the single
//! idempotence boundary for webhook *delivery*. Rows are never deleted; the
//! ledger doubles as the audit trail of every notification a provider ever
//! sent us.
//!
//! Status machine: `received -> processed | failed`, where `failed` re-enters
//! `received` on redelivery and `processed` is terminal. A processed event
//! must short-circuit as a no-op duplicate.

use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use flowline_shared::PaymentProvider;

use crate::error::BillingResult;
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};

/// Stored event status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Received,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Received => "received",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }
}

/// What a claim attempt should do given the pre-existing row, if any.
///
/// This is the ledger's entire dedupe policy in one pure function; the SQL
/// in [`WebhookLedger::begin_event`] is its one-statement translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimDisposition {
    /// No row yet: insert as `received` and process.
    Insert,
    /// Row exists as `received` or `failed`: take it over (replace the
    /// payload hash, clear the error) and process again.
    Reclaim,
    /// Row exists as `processed`: answer success, perform no side effects.
    Duplicate,
}

impl ClaimDisposition {
    pub fn for_existing(existing: Option<EventStatus>) -> Self {
        match existing {
            None => ClaimDisposition::Insert,
            Some(EventStatus::Received) | Some(EventStatus::Failed) => ClaimDisposition::Reclaim,
            Some(EventStatus::Processed) => ClaimDisposition::Duplicate,
        }
    }
}

/// Result of claiming an inbound event.
#[derive(Debug, Clone, Copy)]
pub struct EventClaim {
    pub id: Uuid,
    /// True when the event was already processed; the caller must
    /// short-circuit and acknowledge the provider without side effects.
    pub duplicate: bool,
}

/// SHA-256 of the raw webhook body, stored for forensics and replay
/// comparison.
pub fn payload_hash(raw_body: &[u8]) -> String {
    hex::encode(Sha256::digest(raw_body))
}

#[derive(Clone)]
pub struct WebhookLedger {
    pool: PgPool,
    audit: BillingEventLogger,
}

impl WebhookLedger {
    pub fn new(pool: PgPool) -> Self {
        let audit = BillingEventLogger::new(pool.clone());
        Self { pool, audit }
    }

    /// Atomically claim an event for processing.
    ///
    /// One INSERT .. ON CONFLICT .. DO UPDATE .. WHERE statement implements
    /// [`ClaimDisposition`]: a fresh insert and a failed-event reclaim both
    /// return the row id; a processed row matches neither arm and returns
    /// nothing, which is the duplicate signal. Two concurrent deliveries of
    /// the same event cannot both claim a processed row.
    ///
    /// If this write fails the error propagates untouched: the HTTP layer
    /// must answer 5xx so the provider redelivers, because an event we could
    /// not record is an event we would otherwise lose.
    pub async fn begin_event(
        &self,
        provider: PaymentProvider,
        event_id: &str,
        payload_hash: &str,
    ) -> BillingResult<EventClaim> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (id, provider, event_id, payload_hash, status, received_at)
            VALUES ($1, $2, $3, $4, 'received', NOW())
            ON CONFLICT (provider, event_id) DO UPDATE SET
                payload_hash = EXCLUDED.payload_hash,
                status = 'received',
                error = NULL,
                received_at = NOW()
            WHERE webhook_events.status IN ('received', 'failed')
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(provider.as_str())
        .bind(event_id)
        .bind(payload_hash)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = claimed {
            return Ok(EventClaim {
                id,
                duplicate: false,
            });
        }

        // The conflict arm did not fire: the row is processed.
        let (id,): (Uuid,) = sqlx::query_as(
            "SELECT id FROM webhook_events WHERE provider = $1 AND event_id = $2",
        )
        .bind(provider.as_str())
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            provider = %provider,
            event_id = %event_id,
            "duplicate webhook event - already processed"
        );

        Ok(EventClaim {
            id,
            duplicate: true,
        })
    }

    /// Terminal success. Subsequent deliveries of the same event id become
    /// no-op duplicates.
    pub async fn mark_processed(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'processed', processed_at = NOW(), error = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if let Err(e) = self
            .audit
            .log(
                BillingEventBuilder::new(BillingEventType::WebhookProcessed)
                    .reference(id.to_string()),
            )
            .await
        {
            tracing::warn!(event = %id, error = %e, "failed to audit webhook processed");
        }

        Ok(())
    }

    /// Record a failure and leave the event claimable on redelivery.
    pub async fn mark_failed(&self, id: Uuid, reason: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'failed', processed_at = NOW(), error = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if let Err(e) = self
            .audit
            .log(
                BillingEventBuilder::new(BillingEventType::WebhookFailed)
                    .reference(id.to_string())
                    .data(serde_json::json!({ "reason": reason })),
            )
            .await
        {
            tracing::warn!(event = %id, error = %e, "failed to audit webhook failure");
        }

        Ok(())
    }
}
