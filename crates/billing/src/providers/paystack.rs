//! Paystack integration.
//!
//! Webhooks are signed with HMAC-SHA512 of the raw request body under the
//! secret key, delivered in the `x-paystack-signature` header. Amounts are
//! already in kobo (minor units). Paystack settles NGN only.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha512;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use flowline_shared::{Environment, PaymentProvider};

use crate::error::{BillingError, BillingResult};
use crate::providers::{
    missing_secret_policy, CheckoutMetadata, ProviderTxStatus, VerifiedPayment,
};

type HmacSha512 = Hmac<Sha512>;

const DEFAULT_BASE_URL: &str = "https://api.paystack.co";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct PaystackClient {
    secret_key: Option<String>,
    base_url: String,
    environment: Environment,
    http: reqwest::Client,
}

impl PaystackClient {
    pub fn from_env(environment: Environment) -> Self {
        Self {
            secret_key: std::env::var("PAYSTACK_SECRET_KEY").ok(),
            base_url: std::env::var("PAYSTACK_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            environment,
            http: reqwest::Client::new(),
        }
    }

    /// Constructor with explicit secret and base URL, used by tests.
    pub fn new(secret_key: Option<String>, base_url: String, environment: Environment) -> Self {
        Self {
            secret_key,
            base_url,
            environment,
            http: reqwest::Client::new(),
        }
    }

    /// Check `x-paystack-signature` against HMAC-SHA512 of the raw body.
    pub fn verify_signature(&self, signature: &str, raw_body: &[u8]) -> BillingResult<()> {
        let Some(secret) = self.secret_key.as_deref() else {
            return missing_secret_policy(PaymentProvider::Paystack, self.environment);
        };

        let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
            .map_err(|_| BillingError::Internal("invalid paystack secret key".into()))?;
        mac.update(raw_body);
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed
            .as_bytes()
            .ct_eq(signature.to_ascii_lowercase().as_bytes())
            .unwrap_u8()
            == 1
        {
            Ok(())
        } else {
            tracing::warn!(provider = "paystack", "webhook signature mismatch");
            Err(BillingError::SignatureInvalid)
        }
    }

    /// Fetch the authoritative transaction state from Paystack.
    pub async fn fetch_transaction(&self, reference: &str) -> BillingResult<VerifiedPayment> {
        let secret = self
            .secret_key
            .as_deref()
            .ok_or(BillingError::ProviderNotConfigured(PaymentProvider::Paystack))?;

        let url = format!("{}/transaction/verify/{}", self.base_url, reference);

        // Bounded retry: transient provider failures should not surface as a
        // failed event when one more attempt would have succeeded.
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
        let tx = body
            .data
            .ok_or_else(|| BillingError::VerificationFailed(body.message))?;

        normalize(tx)
    }
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[allow(dead_code)]
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<Transaction>,
}

#[derive(Debug, Deserialize)]
struct Transaction {
    status: String,
    reference: String,
    /// Kobo.
    amount: i64,
    currency: String,
    metadata: Option<CheckoutMetadata>,
}

fn normalize(tx: Transaction) -> BillingResult<VerifiedPayment> {
    let status = if tx.status == "success" {
        ProviderTxStatus::Succeeded
    } else {
        ProviderTxStatus::Unsuccessful(tx.status)
    };

    let meta = tx
        .metadata
        .ok_or_else(|| BillingError::MissingMetadata("metadata".into()))?;
    let (user_id, plan) = meta.into_parts()?;

    Ok(VerifiedPayment {
        provider: PaymentProvider::Paystack,
        reference: tx.reference,
        status,
        amount_minor: tx.amount,
        currency: tx.currency.to_ascii_uppercase(),
        user_id,
        plan,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_shared::Plan;
    use uuid::Uuid;

    fn client_with_secret(secret: &str) -> PaystackClient {
        PaystackClient::new(
            Some(secret.to_string()),
            DEFAULT_BASE_URL.to_string(),
            Environment::Production,
        )
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_accepted() {
        let client = client_with_secret("sk_test_abc");
        let body = br#"{"event":"charge.success"}"#;
        let sig = sign("sk_test_abc", body);
        assert!(client.verify_signature(&sig, body).is_ok());
    }

    #[test]
    fn uppercase_hex_signature_accepted() {
        let client = client_with_secret("sk_test_abc");
        let body = br#"{"event":"charge.success"}"#;
        let sig = sign("sk_test_abc", body).to_ascii_uppercase();
        assert!(client.verify_signature(&sig, body).is_ok());
    }

    #[test]
    fn tampered_body_rejected() {
        let client = client_with_secret("sk_test_abc");
        let sig = sign("sk_test_abc", br#"{"amount":2000000}"#);
        let err = client
            .verify_signature(&sig, br#"{"amount":9999999}"#)
            .unwrap_err();
        assert!(matches!(err, BillingError::SignatureInvalid));
    }

    #[test]
    fn wrong_secret_rejected() {
        let client = client_with_secret("sk_test_abc");
        let body = br#"{"event":"charge.success"}"#;
        let sig = sign("sk_test_other", body);
        assert!(client.verify_signature(&sig, body).is_err());
    }

    #[test]
    fn missing_secret_rejected_in_production() {
        let client = PaystackClient::new(None, DEFAULT_BASE_URL.into(), Environment::Production);
        assert!(matches!(
            client.verify_signature("deadbeef", b"{}"),
            Err(BillingError::ProviderNotConfigured(_))
        ));
    }

    #[test]
    fn normalize_maps_success() {
        let user = Uuid::new_v4();
        let tx = Transaction {
            status: "success".into(),
            reference: "ps_ref_1".into(),
            amount: 2_000_000,
            currency: "ngn".into(),
            metadata: Some(CheckoutMetadata {
                user_id: Some(user.to_string()),
                plan: Some("starter".into()),
            }),
        };

        let payment = normalize(tx).unwrap();
        assert!(payment.status.is_success());
        assert_eq!(payment.amount_minor, 2_000_000);
        assert_eq!(payment.currency, "NGN");
        assert_eq!(payment.user_id, user);
        assert_eq!(payment.plan, Plan::Starter);
    }

    #[test]
    fn normalize_keeps_abandoned_status() {
        let tx = Transaction {
            status: "abandoned".into(),
            reference: "ps_ref_2".into(),
            amount: 2_000_000,
            currency: "NGN".into(),
            metadata: Some(CheckoutMetadata {
                user_id: Some(Uuid::new_v4().to_string()),
                plan: Some("starter".into()),
            }),
        };

        let payment = normalize(tx).unwrap();
        assert_eq!(
            payment.status,
            ProviderTxStatus::Unsuccessful("abandoned".into())
        );
    }

    #[tokio::test]
    async fn fetch_transaction_parses_verify_response() {
        let mut server = mockito::Server::new_async().await;
        let user = Uuid::new_v4();
        let body = serde_json::json!({
            "status": true,
            "message": "Verification successful",
            "data": {
                "status": "success",
                "reference": "ps_ref_3",
                "amount": 5_000_000,
                "currency": "NGN",
                "metadata": {"user_id": user.to_string(), "plan": "growth"}
            }
        });
        let mock = server
            .mock("GET", "/transaction/verify/ps_ref_3")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let client = PaystackClient::new(
            Some("sk_test_abc".into()),
            server.url(),
            Environment::Development,
        );
        let payment = client.fetch_transaction("ps_ref_3").await.unwrap();

        mock.assert_async().await;
        assert_eq!(payment.plan, Plan::Growth);
        assert_eq!(payment.amount_minor, 5_000_000);
        assert!(payment.status.is_success());
    }

    #[tokio::test]
    async fn fetch_transaction_missing_data_is_verification_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/transaction/verify/nope")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status": false, "message": "Transaction reference not found"}"#)
            .create_async()
            .await;

        let client = PaystackClient::new(
            Some("sk_test_abc".into()),
            server.url(),
            Environment::Development,
        );
        let err = client.fetch_transaction("nope").await.unwrap_err();
        assert!(matches!(err, BillingError::VerificationFailed(_)));
    }
}
