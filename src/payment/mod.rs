//! Payment execution with retry, backoff, and error classification.
//!
//! A priced action is charged against the remote provider with a bounded
//! number of attempts. Retryable failures (network-class) back off
//! exponentially; terminal failures (bad token, insufficient funds) stop
//! immediately without consuming the remaining retry budget. The final
//! error always carries a user-actionable hint.

use crate::provider::{PaymentProvider, PaymentRequest, ProviderError, Receipt};
use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Provider-imposed character limit for payment descriptions.
pub const NOTE_LIMIT: usize = 25;

/// Default number of charge attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// First backoff delay; doubles per retry.
const BACKOFF_BASE_MS: u64 = 1000;

/// Backoff ceiling (three doublings of the base).
const BACKOFF_CAP_MS: u64 = 8000;

/// Per-payment options, typically filled from [`Config`](crate::config::Config).
#[derive(Clone, Debug)]
pub struct PaymentOptions {
    /// Destination handle the payment is sent to
    pub destination: String,
    /// Provider currency code for the amount
    pub currency_code: String,
    /// Query the balance before paying; failures only warn (default off)
    pub preflight_balance_check: bool,
    /// Charge attempts before giving up
    pub max_attempts: u32,
}

impl Default for PaymentOptions {
    fn default() -> Self {
        Self {
            destination: String::new(),
            currency_code: "USD".to_string(),
            preflight_balance_check: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Executes priced actions against the remote provider.
pub struct PaymentExecutor {
    provider: Arc<dyn PaymentProvider>,
}

impl PaymentExecutor {
    pub fn new(provider: Arc<dyn PaymentProvider>) -> Self {
        Self { provider }
    }

    /// Charge `amount` with a descriptive note attached.
    ///
    /// Preconditions (positive amount, non-empty token) fail before any
    /// network traffic. Retryable failures back off per
    /// [`backoff_delay`]; terminal failures raise immediately. The note
    /// is truncated to the provider's [`NOTE_LIMIT`].
    pub async fn execute_payment(
        &self,
        amount: f64,
        note: &str,
        token: &str,
        options: &PaymentOptions,
    ) -> Result<Receipt> {
        if amount <= 0.0 {
            bail!("Payment amount must be positive, got {}", amount);
        }
        if token.is_empty() {
            bail!("Cannot execute a payment without a session token");
        }

        if options.preflight_balance_check {
            match self.provider.balance(token).await {
                Ok(balance) if balance.spendable < amount => {
                    // Informational only: the charge itself decides
                    warn!(
                        spendable = balance.spendable,
                        amount = amount,
                        "Spendable balance looks below the payment amount"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Pre-flight balance check failed, proceeding with payment");
                }
            }
        }

        let request = PaymentRequest {
            description: format_note(note),
            destination: options.destination.clone(),
            currency_code: options.currency_code.clone(),
            amount,
        };

        let mut last_error = None;

        for attempt in 0..options.max_attempts {
            match self.provider.pay(token, &request).await {
                Ok(receipt) => {
                    info!(
                        transaction_id = %receipt.transaction_id,
                        amount = amount,
                        "Payment settled"
                    );
                    return Ok(receipt);
                }
                Err(e) if e.is_terminal() => {
                    warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "Payment failed with a terminal error, not retrying"
                    );
                    return Err(with_hint(e));
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = options.max_attempts,
                        error = %e,
                        "Payment attempt failed, will retry"
                    );
                    last_error = Some(e);

                    if attempt < options.max_attempts - 1 {
                        let delay = backoff_delay(attempt);
                        debug!(delay_ms = delay.as_millis() as u64, "Backing off before retry");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        // max_attempts >= 1, so at least one error was recorded
        Err(with_hint(last_error.expect("no attempt was made")))
    }
}

/// Exponential backoff: base * 2^attempt, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let ms = BACKOFF_BASE_MS
        .saturating_mul(1u64 << attempt.min(10))
        .min(BACKOFF_CAP_MS);
    Duration::from_millis(ms)
}

/// Wrap a final provider error with a user-actionable remediation hint.
fn with_hint(e: ProviderError) -> anyhow::Error {
    let hint = match &e {
        ProviderError::InsufficientFunds(_) => {
            "Insufficient balance - add funds to your account, then retry"
        }
        ProviderError::InvalidToken(_) => {
            "Session rejected - run `tollgit auth login` to re-authenticate"
        }
        _ => "Payment did not go through - check your network connection and try again",
    };
    anyhow::Error::new(e).context(hint.to_string())
}

/// Truncate a payment note to the provider limit.
///
/// Keeps the leading characters: notes lead with the identifying part
/// (e.g. a short commit hash), so the prefix must survive truncation.
pub fn format_note(note: &str) -> String {
    note.chars().take(NOTE_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Balance, Profile};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Provider fake with a scripted sequence of pay outcomes.
    struct ScriptedProvider {
        outcomes: Mutex<VecDeque<Result<Receipt, ProviderError>>>,
        pay_calls: AtomicUsize,
        balance_calls: AtomicUsize,
        balance: Result<Balance, ()>,
    }

    impl ScriptedProvider {
        fn new(outcomes: Vec<Result<Receipt, ProviderError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                pay_calls: AtomicUsize::new(0),
                balance_calls: AtomicUsize::new(0),
                balance: Err(()),
            }
        }

        fn pay_calls(&self) -> usize {
            self.pay_calls.load(Ordering::SeqCst)
        }
    }

    fn receipt(id: &str) -> Receipt {
        Receipt {
            transaction_id: id.to_string(),
        }
    }

    #[async_trait]
    impl PaymentProvider for ScriptedProvider {
        async fn redirection_url(&self, _permissions: &[&str]) -> Result<String, ProviderError> {
            unimplemented!("not under test")
        }

        async fn profile(&self, _token: &str) -> Result<Profile, ProviderError> {
            unimplemented!("not under test")
        }

        async fn balance(&self, _token: &str) -> Result<Balance, ProviderError> {
            self.balance_calls.fetch_add(1, Ordering::SeqCst);
            self.balance
                .map_err(|_| ProviderError::Network("balance unavailable".to_string()))
        }

        async fn pay(
            &self,
            _token: &str,
            _request: &PaymentRequest,
        ) -> Result<Receipt, ProviderError> {
            self.pay_calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Network("script exhausted".to_string())))
        }
    }

    fn options() -> PaymentOptions {
        PaymentOptions {
            destination: "maintainer@pay.example".to_string(),
            ..PaymentOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failures_then_success() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::Network("timeout".to_string())),
            Err(ProviderError::Network("connection reset".to_string())),
            Ok(receipt("txn_ok")),
        ]));
        let executor = PaymentExecutor::new(provider.clone());

        let started = tokio::time::Instant::now();
        let result = executor
            .execute_payment(0.01, "push abc1234", "token", &options())
            .await
            .unwrap();

        assert_eq!(result.transaction_id, "txn_ok");
        assert_eq!(provider.pay_calls(), 3);
        // Exponential schedule: 1000ms after attempt 1, 2000ms after attempt 2
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_terminal_error_stops_after_one_attempt() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(
            ProviderError::InsufficientFunds("balance too low".to_string()),
        )]));
        let executor = PaymentExecutor::new(provider.clone());

        let err = executor
            .execute_payment(0.01, "note", "token", &options())
            .await
            .unwrap_err();

        assert_eq!(provider.pay_calls(), 1);
        assert!(format!("{:#}", err).contains("add funds"));
    }

    #[tokio::test]
    async fn test_invalid_token_hint_points_at_login() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(
            ProviderError::InvalidToken("revoked".to_string()),
        )]));
        let executor = PaymentExecutor::new(provider.clone());

        let err = executor
            .execute_payment(0.01, "note", "token", &options())
            .await
            .unwrap_err();

        assert_eq!(provider.pay_calls(), 1);
        assert!(format!("{:#}", err).contains("auth login"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_carry_network_hint() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::Network("timeout".to_string())),
            Err(ProviderError::Network("timeout".to_string())),
            Err(ProviderError::Network("timeout".to_string())),
        ]));
        let executor = PaymentExecutor::new(provider.clone());

        let err = executor
            .execute_payment(0.01, "note", "token", &options())
            .await
            .unwrap_err();

        assert_eq!(provider.pay_calls(), 3);
        assert!(format!("{:#}", err).contains("network"));
    }

    #[tokio::test]
    async fn test_nonpositive_amount_never_contacts_provider() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(receipt("never"))]));
        let executor = PaymentExecutor::new(provider.clone());

        assert!(executor
            .execute_payment(0.0, "note", "token", &options())
            .await
            .is_err());
        assert!(executor
            .execute_payment(-1.0, "note", "token", &options())
            .await
            .is_err());
        assert_eq!(provider.pay_calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_token_never_contacts_provider() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(receipt("never"))]));
        let executor = PaymentExecutor::new(provider.clone());

        assert!(executor
            .execute_payment(0.01, "note", "", &options())
            .await
            .is_err());
        assert_eq!(provider.pay_calls(), 0);
    }

    #[tokio::test]
    async fn test_preflight_failure_does_not_block_payment() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(receipt("txn_ok"))]));
        let executor = PaymentExecutor::new(provider.clone());

        let mut opts = options();
        opts.preflight_balance_check = true;

        // Balance call fails (scripted), payment still settles
        let result = executor
            .execute_payment(0.01, "note", "token", &opts)
            .await
            .unwrap();
        assert_eq!(result.transaction_id, "txn_ok");
        assert_eq!(provider.balance_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(3), Duration::from_millis(8000));
        // Capped from here on
        assert_eq!(backoff_delay(4), Duration::from_millis(8000));
    }

    #[test]
    fn test_note_truncation_keeps_identifying_prefix() {
        let note = "abc1234 deadbeefdeadbeefdeadbeefdeadbeef"; // 40 chars
        assert_eq!(note.chars().count(), 40);

        let formatted = format_note(note);
        assert_eq!(formatted.chars().count(), NOTE_LIMIT);
        assert!(formatted.starts_with("abc1234 "));
    }

    #[test]
    fn test_short_note_unchanged() {
        assert_eq!(format_note("push abc1234"), "push abc1234");
    }
}
