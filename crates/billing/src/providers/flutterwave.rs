//! Flutterwave integration.
//!
//! Webhooks carry a `verif-hash` header that must equal the secret hash
//! configured on the dashboard; there is no per-request MAC. Amounts come
//! back in major units and are converted to minor units here so the rest of
//! the pipeline only ever sees one scale. Flutterwave settles NGN and USD.

use serde::Deserialize;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use flowline_shared::{Environment, PaymentProvider};

use crate::error::{BillingError, BillingResult};
use crate::providers::{
    missing_secret_policy, CheckoutMetadata, ProviderTxStatus, VerifiedPayment,
};

const DEFAULT_BASE_URL: &str = "https://api.flutterwave.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct FlutterwaveClient {
    secret_key: Option<String>,
    webhook_hash: Option<String>,
    base_url: String,
    environment: Environment,
    http: reqwest::Client,
}

impl FlutterwaveClient {
    pub fn from_env(environment: Environment) -> Self {
        Self {
            secret_key: std::env::var("FLUTTERWAVE_SECRET_KEY").ok(),
            webhook_hash: std::env::var("FLUTTERWAVE_WEBHOOK_HASH").ok(),
            base_url: std::env::var("FLUTTERWAVE_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            environment,
            http: reqwest::Client::new(),
        }
    }

    pub fn new(
        secret_key: Option<String>,
        webhook_hash: Option<String>,
        base_url: String,
        environment: Environment,
    ) -> Self {
        Self {
            secret_key,
            webhook_hash,
            base_url,
            environment,
            http: reqwest::Client::new(),
        }
    }

    /// Check the `verif-hash` header against the configured secret hash.
    pub fn verify_signature(&self, signature: &str) -> BillingResult<()> {
        let Some(expected) = self.webhook_hash.as_deref() else {
            return missing_secret_policy(PaymentProvider::Flutterwave, self.environment);
        };

        if expected.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() == 1 {
            Ok(())
        } else {
            tracing::warn!(provider = "flutterwave", "verif-hash mismatch");
            Err(BillingError::SignatureInvalid)
        }
    }

    /// Fetch the authoritative transaction state by merchant reference.
    pub async fn fetch_transaction(&self, tx_ref: &str) -> BillingResult<VerifiedPayment> {
        let secret = self.secret_key.as_deref().ok_or(
            BillingError::ProviderNotConfigured(PaymentProvider::Flutterwave),
        )?;

        let url = format!(
            "{}/v3/transactions/verify_by_reference?tx_ref={}",
            self.base_url, tx_ref
        );

        let strategy = ExponentialBackoff::from_millis(200).map(jitter).take(2);
        let response = Retry::spawn(strategy, || async {
            self.http
                .get(&url)
                .bearer_auth(secret)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await?
                .error_for_status()
        })
        .await?;

        let body: VerifyResponse = response.json().await?;
        if body.status != "success" {
            return Err(BillingError::VerificationFailed(body.message));
        }
        let tx = body
            .data
            .ok_or_else(|| BillingError::VerificationFailed(body.message))?;

        normalize(tx)
    }
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    status: String,
    #[serde(default)]
    message: String,
    data: Option<Transaction>,
}

#[derive(Debug, Deserialize)]
struct Transaction {
    status: String,
    tx_ref: String,
    /// Major units, possibly fractional for USD.
    amount: f64,
    currency: String,
    meta: Option<CheckoutMetadata>,
}

fn normalize(tx: Transaction) -> BillingResult<VerifiedPayment> {
    let status = if tx.status == "successful" {
        ProviderTxStatus::Succeeded
    } else {
        ProviderTxStatus::Unsuccessful(tx.status)
    };

    let meta = tx
        .meta
        .ok_or_else(|| BillingError::MissingMetadata("meta".into()))?;
    let (user_id, plan) = meta.into_parts()?;

    Ok(VerifiedPayment {
        provider: PaymentProvider::Flutterwave,
        reference: tx.tx_ref,
        status,
        amount_minor: (tx.amount * 100.0).round() as i64,
        currency: tx.currency.to_ascii_uppercase(),
        user_id,
        plan,
    })
}
