//! Client for the remote identity/payment provider.
//!
//! The provider is consumed, never implemented: this module holds the
//! client-side contract (redirect URL generation, token-to-profile
//! resolution, balance query, pay-by-destination) and is the single place
//! where provider failures are mapped into a retryable/terminal
//! classification. Everything downstream (session validation, payment
//! retry) branches on that classification instead of sniffing free text.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Whether a failed provider call is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: network/timeout style failures, unclassified API errors
    Retryable,
    /// Permanent for this invocation: bad token, insufficient funds
    Terminal,
}

/// Provider errors, classified at the point the remote call fails.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Transport failure: connect, timeout, reset
    #[error("network error talking to provider: {0}")]
    Network(String),

    /// The provider rejected the session token
    #[error("session token rejected by provider: {0}")]
    InvalidToken(String),

    /// The account cannot cover the requested amount
    #[error("insufficient balance: {0}")]
    InsufficientFunds(String),

    /// Provider response could not be parsed
    #[error("malformed provider response: {0}")]
    Malformed(String),

    /// Any other provider-reported failure
    #[error("provider error (status {status}): {message}")]
    Api { status: u16, message: String },
}

impl ProviderError {
    /// Classification used by the payment retry loop.
    ///
    /// Unclassified API errors default to retryable.
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::InvalidToken(_) | ProviderError::InsufficientFunds(_) => {
                ErrorClass::Terminal
            }
            ProviderError::Network(_) | ProviderError::Malformed(_) | ProviderError::Api { .. } => {
                ErrorClass::Retryable
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.class() == ErrorClass::Terminal
    }
}

/// Last-resort classification of an opaque provider message.
///
/// The adapter classifies by status code first; this substring fallback
/// only catches providers that return well-known failures under generic
/// statuses.
fn classify_message(status: u16, message: &str) -> ProviderError {
    let lower = message.to_lowercase();
    if lower.contains("insufficient") {
        ProviderError::InsufficientFunds(message.to_string())
    } else if lower.contains("invalid token")
        || lower.contains("unauthorized")
        || lower.contains("expired")
    {
        ProviderError::InvalidToken(message.to_string())
    } else {
        ProviderError::Api {
            status,
            message: message.to_string(),
        }
    }
}

/// Account profile resolved from a session token.
#[derive(Clone, Debug, Deserialize)]
pub struct Profile {
    pub handle: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Spendable balance in provider base units and the user's local currency.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct Balance {
    pub spendable: f64,
    pub spendable_local: f64,
}

/// A pay-by-destination request.
#[derive(Clone, Debug, Serialize)]
pub struct PaymentRequest {
    pub description: String,
    pub destination: String,
    pub currency_code: String,
    pub amount: f64,
}

/// Settled payment receipt.
#[derive(Clone, Debug, Deserialize)]
pub struct Receipt {
    pub transaction_id: String,
}

/// Remote provider operations consumed by the rest of the tool.
///
/// Implemented by [`ProviderClient`] for the real service and by in-memory
/// fakes in tests (session validation and payment retry are exercised
/// without the network).
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// URL the user must visit to authorize this tool.
    async fn redirection_url(&self, permissions: &[&str]) -> Result<String, ProviderError>;

    /// Resolve the account profile behind a session token.
    async fn profile(&self, token: &str) -> Result<Profile, ProviderError>;

    /// Query the spendable balance.
    async fn balance(&self, token: &str) -> Result<Balance, ProviderError>;

    /// Execute a payment to a destination.
    async fn pay(&self, token: &str, request: &PaymentRequest) -> Result<Receipt, ProviderError>;
}

#[derive(Deserialize)]
struct RedirectionResponse {
    url: String,
}

/// HTTP client for the provider REST API.
pub struct ProviderClient {
    http_client: Client,
    base_url: String,
}

impl ProviderClient {
    /// Create a client with the given API base URL (overridable for
    /// testing with a mock server).
    pub fn new(base_url: impl Into<String>) -> Self {
        let http_client = Client::builder()
            .user_agent(concat!("tollgit/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            http_client,
            base_url: base_url.into(),
        }
    }

    /// Map a non-success response into a classified [`ProviderError`].
    async fn error_from_response(response: Response) -> ProviderError {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::InvalidToken(body),
            StatusCode::PAYMENT_REQUIRED => ProviderError::InsufficientFunds(body),
            _ => classify_message(status.as_u16(), &body),
        }
    }
}

#[async_trait]
impl PaymentProvider for ProviderClient {
    async fn redirection_url(&self, permissions: &[&str]) -> Result<String, ProviderError> {
        let scope = urlencoding::encode(&permissions.join(",")).into_owned();
        let url = format!("{}/v1/auth/url?permissions={}", self.base_url, scope);
        debug!(url = %url, "Requesting provider redirection URL");

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let parsed: RedirectionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Ok(parsed.url)
    }

    async fn profile(&self, token: &str) -> Result<Profile, ProviderError> {
        let url = format!("{}/v1/profile", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        response
            .json::<Profile>()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }

    async fn balance(&self, token: &str) -> Result<Balance, ProviderError> {
        let url = format!("{}/v1/balance", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        response
            .json::<Balance>()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }

    async fn pay(&self, token: &str, request: &PaymentRequest) -> Result<Receipt, ProviderError> {
        let url = format!("{}/v1/payments", self.base_url);
        debug!(
            destination = %request.destination,
            amount = request.amount,
            currency = %request.currency_code,
            "Sending payment request"
        );

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        response
            .json::<Receipt>()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}
