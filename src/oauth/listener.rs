//! Ephemeral local HTTP listener for the OAuth redirect.
//!
//! State machine: Idle -> Listening -> {TokenCaptured | TimedOut | ProviderError}.
//!
//! The listener owns a one-shot channel; whichever endpoint fires first
//! pushes a single result into it, and [`CallbackListener::wait_for_token`]
//! races that channel against the callback timeout. Exactly one
//! authentication attempt may be in flight per listener instance.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Html,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

/// How long to wait for the provider redirect before giving up.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

const SUCCESS_PAGE: &str = "<!DOCTYPE html>\
<html><head><title>tollgit</title></head>\
<body style=\"font-family: sans-serif; text-align: center; padding-top: 4em;\">\
<h1>Authentication complete</h1>\
<p>You can close this tab and return to your terminal.</p>\
</body></html>";

const FAILURE_PAGE: &str = "<!DOCTYPE html>\
<html><head><title>tollgit</title></head>\
<body style=\"font-family: sans-serif; text-align: center; padding-top: 4em;\">\
<h1>Authentication failed</h1>\
<p>No token was delivered. Return to your terminal and try again.</p>\
</body></html>";

/// Terminal states of one authentication attempt.
#[derive(Debug, PartialEq, Clone)]
pub enum CallbackError {
    /// The redirect arrived without a token parameter
    MissingToken,
    /// The provider reported a failure via the error endpoint
    Provider(String),
    /// No redirect arrived within the timeout
    TimedOut,
    /// The listener went away before delivering a result
    Closed,
}

impl std::fmt::Display for CallbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallbackError::MissingToken => {
                write!(f, "OAuth callback arrived without a token parameter")
            }
            CallbackError::Provider(msg) => write!(f, "Provider reported an error: {}", msg),
            CallbackError::TimedOut => write!(
                f,
                "Timed out waiting for the authentication callback ({}s)",
                CALLBACK_TIMEOUT.as_secs()
            ),
            CallbackError::Closed => write!(f, "Callback listener closed unexpectedly"),
        }
    }
}

impl std::error::Error for CallbackError {}

type CallbackResult = Result<String, CallbackError>;

/// Shared with the HTTP handlers: whichever endpoint is hit first takes
/// the sender and pushes the single result.
type ResultSender = Arc<Mutex<Option<oneshot::Sender<CallbackResult>>>>;

#[derive(Deserialize)]
struct CallbackParams {
    token: Option<String>,
}

#[derive(Deserialize)]
struct ErrorParams {
    message: Option<String>,
}

/// One-shot local HTTP listener for the OAuth redirect.
pub struct CallbackListener {
    port: u16,
    result_rx: Option<oneshot::Receiver<CallbackResult>>,
    serve_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CallbackListener {
    /// Bind the listener on the first available port in the inclusive range.
    ///
    /// Only "address in use" advances to the next port; any other bind
    /// error propagates immediately. When this returns, the socket is
    /// accepting connections — safe to open the browser.
    pub async fn start(port_start: u16, port_end: u16) -> std::io::Result<Self> {
        let (tcp_listener, port) = bind_first_free(port_start, port_end).await?;

        let (tx, rx) = oneshot::channel();
        let sender: ResultSender = Arc::new(Mutex::new(Some(tx)));

        let app = Router::new()
            .route("/callback", get(handle_callback))
            .route("/error", get(handle_error))
            .route("/health", get(handle_health))
            .with_state(sender);

        let serve_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(tcp_listener, app).await {
                warn!(error = %e, "Callback listener terminated abnormally");
            }
        });

        info!(port = port, "OAuth callback listener ready");

        Ok(Self {
            port,
            result_rx: Some(rx),
            serve_handle: Some(serve_handle),
        })
    }

    /// Port the listener bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Redirect URL the provider should deliver the token to.
    pub fn callback_url(&self) -> String {
        format!("http://127.0.0.1:{}/callback", self.port)
    }

    /// Await the single callback result, bounded by [`CALLBACK_TIMEOUT`].
    pub async fn wait_for_token(&mut self) -> CallbackResult {
        self.wait_for_token_with_timeout(CALLBACK_TIMEOUT).await
    }

    /// Await the single callback result with an explicit timeout.
    pub async fn wait_for_token_with_timeout(&mut self, timeout: Duration) -> CallbackResult {
        let rx = match self.result_rx.take() {
            Some(rx) => rx,
            None => return Err(CallbackError::Closed),
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallbackError::Closed),
            Err(_) => Err(CallbackError::TimedOut),
        }
    }

    /// Shut the listener down.
    ///
    /// Stopping an already-stopped listener is a no-op success.
    pub fn stop(&mut self) {
        if let Some(handle) = self.serve_handle.take() {
            handle.abort();
            debug!(port = self.port, "OAuth callback listener stopped");
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Try each port in the inclusive range, advancing only on AddrInUse.
async fn bind_first_free(port_start: u16, port_end: u16) -> std::io::Result<(TcpListener, u16)> {
    for port in port_start..=port_end {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                debug!(port = port, "Port in use, trying next");
            }
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        format!("no free port in range {}-{}", port_start, port_end),
    ))
}

/// GET /callback?token=<opaque>
async fn handle_callback(
    State(sender): State<ResultSender>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    let result = match params.token {
        Some(token) if !token.is_empty() => Ok(token),
        _ => Err(CallbackError::MissingToken),
    };

    let page = if result.is_ok() {
        SUCCESS_PAGE
    } else {
        FAILURE_PAGE
    };

    if let Some(tx) = sender.lock().await.take() {
        let _ = tx.send(result);
    }

    Html(page)
}

/// GET /error?message=<text>
async fn handle_error(
    State(sender): State<ResultSender>,
    Query(params): Query<ErrorParams>,
) -> Html<&'static str> {
    let message = params.message.unwrap_or_else(|| "unknown error".to_string());

    if let Some(tx) = sender.lock().await.take() {
        let _ = tx.send(Err(CallbackError::Provider(message)));
    }

    Html(FAILURE_PAGE)
}

/// GET /health — liveness probe.
async fn handle_health() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_endpoint_responds_ok() {
        let mut listener = CallbackListener::start(18100, 18109).await.unwrap();

        let url = format!("http://127.0.0.1:{}/health", listener.port());
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), 200);

        listener.stop();
    }

    #[tokio::test]
    async fn test_callback_delivers_token() {
        let mut listener = CallbackListener::start(18110, 18119).await.unwrap();

        let url = format!(
            "http://127.0.0.1:{}/callback?token=tok_abc123",
            listener.port()
        );
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.text().await.unwrap().contains("complete"));

        let token = listener.wait_for_token().await.unwrap();
        assert_eq!(token, "tok_abc123");

        listener.stop();
    }

    #[tokio::test]
    async fn test_callback_without_token_rejects() {
        let mut listener = CallbackListener::start(18120, 18129).await.unwrap();

        let url = format!("http://127.0.0.1:{}/callback", listener.port());
        reqwest::get(&url).await.unwrap();

        let result = listener.wait_for_token().await;
        assert_eq!(result, Err(CallbackError::MissingToken));

        listener.stop();
    }

    #[tokio::test]
    async fn test_error_endpoint_rejects_with_provider_message() {
        let mut listener = CallbackListener::start(18130, 18139).await.unwrap();

        let url = format!(
            "http://127.0.0.1:{}/error?message=access%20denied",
            listener.port()
        );
        reqwest::get(&url).await.unwrap();

        let result = listener.wait_for_token().await;
        assert_eq!(
            result,
            Err(CallbackError::Provider("access denied".to_string()))
        );

        listener.stop();
    }

    #[tokio::test]
    async fn test_timeout_when_no_callback_arrives() {
        let mut listener = CallbackListener::start(18140, 18149).await.unwrap();

        let result = listener
            .wait_for_token_with_timeout(Duration::from_millis(50))
            .await;
        assert_eq!(result, Err(CallbackError::TimedOut));

        listener.stop();
    }

    #[tokio::test]
    async fn test_port_fallback_on_addr_in_use() {
        // Occupy the first port of the range
        let _occupier = TcpListener::bind(("127.0.0.1", 18150)).await.unwrap();

        let listener = CallbackListener::start(18150, 18151).await.unwrap();
        assert_eq!(listener.port(), 18151);
    }

    #[tokio::test]
    async fn test_exhausted_range_fails() {
        let _a = TcpListener::bind(("127.0.0.1", 18160)).await.unwrap();
        let _b = TcpListener::bind(("127.0.0.1", 18161)).await.unwrap();

        let result = CallbackListener::start(18160, 18161).await;
        assert!(result.is_err());
        assert_eq!(
            result.err().unwrap().kind(),
            std::io::ErrorKind::AddrInUse
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut listener = CallbackListener::start(18170, 18179).await.unwrap();
        listener.stop();
        listener.stop();
    }

    #[tokio::test]
    async fn test_first_result_wins() {
        let mut listener = CallbackListener::start(18180, 18189).await.unwrap();

        let base = format!("http://127.0.0.1:{}", listener.port());
        reqwest::get(format!("{}/callback?token=first", base))
            .await
            .unwrap();
        reqwest::get(format!("{}/callback?token=second", base))
            .await
            .unwrap();

        let token = listener.wait_for_token().await.unwrap();
        assert_eq!(token, "first");

        listener.stop();
    }
}
