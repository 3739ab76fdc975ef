use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::StatusCode;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::packages::{METADATA_PACKAGE_ID, METADATA_USER_ID, TokenPackage};

const CHECKOUT_SESSIONS_PATH: &str = "/v1/checkout/sessions";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    pub user_id: Uuid,
    pub package: TokenPackage,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_email: Option<String>,
}

impl CheckoutSessionRequest {
    /// Form body for `POST /v1/checkout/sessions`.
    pub fn form_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("mode".to_string(), "payment".to_string()),
            ("payment_method_types[0]".to_string(), "card".to_string()),
            ("line_items[0][price]".to_string(), self.price_id.clone()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("success_url".to_string(), self.success_url.clone()),
            ("cancel_url".to_string(), self.cancel_url.clone()),
            (
                format!("metadata[{METADATA_USER_ID}]"),
                self.user_id.to_string(),
            ),
            (
                format!("metadata[{METADATA_PACKAGE_ID}]"),
                self.package.id().to_string(),
            ),
        ];
        if let Some(email) = &self.customer_email {
            fields.push(("customer_email".to_string(), email.clone()));
        }
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedCheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("checkout request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider rejected checkout with {status}: {message}")]
    Provider { status: StatusCode, message: String },
    #[error("provider returned a session without a redirect url")]
    MissingUrl,
}

#[async_trait]
pub trait CheckoutGateway: Send + Sync {
    async fn create_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CreatedCheckoutSession, CheckoutError>;
}

#[derive(Clone)]
pub struct StripeClient {
    http: Client,
    api_base: String,
    secret_key: String,
    timeout: Duration,
}

impl StripeClient {
    pub fn new(api_base: &str, secret_key: &str, timeout: Duration) -> Result<Self> {
        assert!(!api_base.is_empty(), "Stripe API base must be provided");
        assert!(
            timeout >= Duration::from_millis(100),
            "Timeout below 100ms is unsafe"
        );
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Stripe HTTP client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl CheckoutGateway for StripeClient {
    async fn create_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CreatedCheckoutSession, CheckoutError> {
        let url = format!("{}{CHECKOUT_SESSIONS_PATH}", self.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(&request.form_fields())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ProviderErrorBody>()
                .await
                .map(|body| body.error.message)
                .unwrap_or_else(|_| "unreadable error body".to_string());
            return Err(CheckoutError::Provider { status, message });
        }

        let session: CreatedCheckoutSession = response.json().await?;
        if session.url.as_deref().is_none_or(str::is_empty) {
            return Err(CheckoutError::MissingUrl);
        }
        debug!(
            "Created checkout session {} for user {} package {}",
            session.id, request.user_id, request.package
        );
        Ok(session)
    }
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    error: ProviderErrorDetail,
}

#[derive(Deserialize)]
struct ProviderErrorDetail {
    #[serde(default)]
    message: String,
}
