//! Payment intents. Stripe over its REST API, no SDK.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

const STRIPE_API: &str = "https://api.stripe.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("payments are not configured")]
    Disabled,
    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("payment provider unreachable: {0}")]
    Transport(String),
    #[error("payment provider error: {0}")]
    Provider(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates an intent for `amount_minor` smallest currency units and
    /// returns the client secret the browser confirms it with.
    async fn create_intent(&self, amount_minor: i64, currency: &str) -> Result<String, PaymentError>;
}

pub struct StripeGateway {
    client: Client,
    secret_key: String,
    base_url: String,
}

impl StripeGateway {
    pub fn new(secret_key: String) -> Result<Self, PaymentError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PaymentError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            secret_key,
            base_url: STRIPE_API.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Deserialize)]
struct IntentResponse {
    client_secret: Option<String>,
    error: Option<StripeErrorBody>,
}

#[derive(Deserialize)]
struct StripeErrorBody {
    message: Option<String>,
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_intent(&self, amount_minor: i64, currency: &str) -> Result<String, PaymentError> {
        if amount_minor <= 0 {
            return Err(PaymentError::InvalidAmount(amount_minor));
        }
        let amount = amount_minor.to_string();
        let currency = currency.to_ascii_lowercase();
        let resp: IntentResponse = self
            .client
            .post(format!("{}/v1/payment_intents", self.base_url))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&[
                ("amount", amount.as_str()),
                ("currency", currency.as_str()),
                ("automatic_payment_methods[enabled]", "true"),
            ])
            .send()
            .await
            .map_err(|e| PaymentError::Transport(e.without_url().to_string()))?
            .json()
            .await
            .map_err(|e| PaymentError::Provider(e.without_url().to_string()))?;

        match (resp.client_secret, resp.error) {
            (Some(secret), _) => Ok(secret),
            (None, Some(err)) => Err(PaymentError::Provider(
                err.message.unwrap_or_else(|| "unknown error".into()),
            )),
            (None, None) => Err(PaymentError::Provider("response had no client_secret".into())),
        }
    }
}

/// Stand-in when no secret key is configured.
pub struct DisabledGateway;

#[async_trait]
impl PaymentGateway for DisabledGateway {
    async fn create_intent(&self, _amount_minor: i64, _currency: &str) -> Result<String, PaymentError> {
        Err(PaymentError::Disabled)
    }
}

pub fn gateway_from_config(
    config: &crate::config::StripeConfig,
) -> Result<Box<dyn PaymentGateway>, PaymentError> {
    match &config.secret_key {
        Some(key) => Ok(Box::new(StripeGateway::new(key.clone())?)),
        None => {
            tracing::warn!("STRIPE_SECRET_KEY not set, payment intents disabled");
            Ok(Box::new(DisabledGateway))
        }
    }
}
