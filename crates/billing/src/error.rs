//! Billing error taxonomy.
//!
//! Each variant corresponds to one failure class of the reconciliation
//! pipeline, and the HTTP layer maps them to the redelivery policy: transport
//! and infrastructure failures must provoke a provider retry, business
//! rejections must not.

use flowline_shared::{Currency, PaymentProvider};

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Webhook signature did not verify against the provider secret.
    #[error("webhook signature invalid")]
    SignatureInvalid,

    /// The provider's verify endpoint reports the transaction as not
    /// successful. Expected terminal outcome, not an infrastructure error.
    #[error("transaction verification failed: {0}")]
    VerificationFailed(String),

    /// Event payload is missing data we need to act on it (user id, plan).
    #[error("missing metadata: {0}")]
    MissingMetadata(String),

    /// Currency is outside the allow-list or unsupported by the provider.
    #[error("currency {currency} not supported by {provider}")]
    CurrencyUnsupported {
        currency: Currency,
        provider: PaymentProvider,
    },

    /// Verified amount does not equal the plan price. Potential tampering
    /// or pricing drift; must never be retried into success.
    #[error("amount mismatch: expected {expected_minor}, got {actual_minor}")]
    AmountMismatch {
        expected_minor: i64,
        actual_minor: i64,
    },

    /// A payment row for this provider reference already exists.
    #[error("duplicate payment reference: {0}")]
    DuplicateReference(String),

    /// The event ledger already holds a processed row for this event id.
    #[error("duplicate webhook event")]
    DuplicateEvent,

    /// Provider secret or credentials missing where they are mandatory.
    #[error("provider {0} not configured")]
    ProviderNotConfigured(PaymentProvider),

    /// Transport-level failure talking to the provider.
    #[error("provider call failed: {0}")]
    Provider(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Should the provider redeliver this event?
    ///
    /// Business rejections return false: redelivering a structurally wrong
    /// event cannot fix it, so we acknowledge and leave a review trail.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Database(_)
            | BillingError::Provider(_)
            | BillingError::MissingMetadata(_)
            | BillingError::Internal(_) => true,
            BillingError::SignatureInvalid
            | BillingError::VerificationFailed(_)
            | BillingError::CurrencyUnsupported { .. }
            | BillingError::AmountMismatch { .. }
            | BillingError::DuplicateReference(_)
            | BillingError::DuplicateEvent
            | BillingError::ProviderNotConfigured(_)
            | BillingError::NotFound(_) => false,
        }
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Provider(err.to_string())
    }
}
