//! Billing email notifications.
//!
//! Thin client over the transactional mail API. Notifications are
//! fire-and-forget at every call site: a failed send is logged and swallowed,
//! it must never fail the reconciliation that triggered it. When the mail API
//! is unconfigured the service runs disabled, which keeps development and CI
//! working without credentials.

use serde::Serialize;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct BillingEmailService {
    api_url: Option<String>,
    api_key: Option<String>,
    from_address: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct OutboundEmail<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

impl BillingEmailService {
    pub fn from_env() -> Self {
        let api_url = std::env::var("MAIL_API_URL").ok();
        if api_url.is_none() {
            tracing::info!("MAIL_API_URL not set - billing emails disabled");
        }
        Self {
            api_url,
            api_key: std::env::var("MAIL_API_KEY").ok(),
            from_address: std::env::var("MAIL_FROM")
                .unwrap_or_else(|_| "billing@flowline.app".to_string()),
            http: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_url.is_some()
    }

    pub async fn send_payment_success(
        &self,
        to: &str,
        plan: &str,
        amount_display: &str,
    ) -> BillingResult<()> {
        let subject = format!("Payment received - {plan} plan");
        let text = format!(
            "We received your payment of {amount_display}. Your {plan} plan is active \
             for the next 30 days. Thanks for building with Flowline."
        );
        self.send(to, &subject, &text).await
    }

    pub async fn send_payment_failed(&self, to: &str, reason: &str) -> BillingResult<()> {
        let subject = "Payment unsuccessful".to_string();
        let text = format!(
            "Your recent payment attempt did not complete ({reason}). \
             No charge was applied. You can retry from your billing page."
        );
        self.send(to, &subject, &text).await
    }

    pub async fn send_trial_expired(&self, to: &str) -> BillingResult<()> {
        let subject = "Your trial has ended".to_string();
        let text = "Your Flowline trial has ended and your workspace is now on the free \
                    plan. Upgrade any time to restore paid features."
            .to_string();
        self.send(to, &subject, text.as_str()).await
    }

    async fn send(&self, to: &str, subject: &str, text: &str) -> BillingResult<()> {
        let Some(url) = self.api_url.as_deref() else {
            tracing::debug!(to = %to, subject = %subject, "email disabled - skipping send");
            return Ok(());
        };

        let payload = OutboundEmail {
            from: &self.from_address,
            to,
            subject,
            text,
        };

        let mut request = self.http.post(url).json(&payload).timeout(SEND_TIMEOUT);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(BillingError::Provider(format!(
                "mail API returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}
