//! Command dispatch: gating policy and sequencing.
//!
//! Decides whether a requested operation is payment-gated and sequences
//! {authenticate → pay → execute} or {execute-only} accordingly:
//!
//! | Operation          | Gating              | Sequencing                        |
//! |--------------------|---------------------|-----------------------------------|
//! | `push`             | always              | pay first (gatekeeper)            |
//! | `commit`           | always              | tool first, pay after (soft-fail) |
//! | everything else    | universal mode only | pay first (gatekeeper)            |
//!
//! The underlying tool is git, invoked as an opaque subprocess with its
//! native arguments unchanged; its exit code propagates to the caller.

use crate::auth::AuthFlow;
use crate::config::{Config, PaymentMode};
use crate::payment::{PaymentExecutor, PaymentOptions};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// How a gated operation orders payment and tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequencing {
    /// Gatekeeper payment: pay first, abort the tool on payment failure
    PublishBefore,
    /// Tool first; pay on success, tolerating payment failure
    PublishAfter,
    /// No payment, no auth requirement
    Ungated,
}

/// Gating decision for one operation under the active policy mode.
pub fn sequencing_for(operation: &str, mode: PaymentMode) -> Sequencing {
    match operation {
        "push" => Sequencing::PublishBefore,
        "commit" => Sequencing::PublishAfter,
        _ => match mode {
            PaymentMode::Universal => Sequencing::PublishBefore,
            PaymentMode::Minimal => Sequencing::Ungated,
        },
    }
}

/// Invokes the underlying version-control tool.
///
/// `run` returns the tool's exit code; an `Err` means the tool could not
/// be spawned at all, which callers report as a generic failure distinct
/// from a non-zero tool exit.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run the tool with the given arguments, inheriting stdio.
    async fn run(&self, args: &[String]) -> Result<i32>;

    /// Run the tool and capture trimmed stdout (fails on non-zero exit).
    async fn capture(&self, args: &[String]) -> Result<String>;
}

/// Real git subprocess runner.
pub struct GitRunner {
    program: String,
}

impl GitRunner {
    pub fn new() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl Default for GitRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolRunner for GitRunner {
    async fn run(&self, args: &[String]) -> Result<i32> {
        let status = tokio::process::Command::new(&self.program)
            .args(args)
            .status()
            .await
            .with_context(|| format!("Failed to spawn '{}'", self.program))?;

        // Terminated-by-signal has no code; report it as a generic failure
        Ok(status.code().unwrap_or(1))
    }

    async fn capture(&self, args: &[String]) -> Result<String> {
        let output = tokio::process::Command::new(&self.program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to spawn '{}'", self.program))?;

        if !output.status.success() {
            anyhow::bail!(
                "'{} {}' exited with {}",
                self.program,
                args.join(" "),
                output.status.code().unwrap_or(1)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Sequences authentication, payment, and tool execution for one operation.
pub struct Dispatcher {
    auth: AuthFlow,
    executor: PaymentExecutor,
    runner: Box<dyn ToolRunner>,
    config: Config,
}

impl Dispatcher {
    pub fn new(
        auth: AuthFlow,
        executor: PaymentExecutor,
        runner: Box<dyn ToolRunner>,
        config: Config,
    ) -> Self {
        Self {
            auth,
            executor,
            runner,
            config,
        }
    }

    /// Dispatch one forwarded command line.
    ///
    /// Returns the process exit code. An `Err` is an authentication,
    /// gatekeeper-payment, or spawn failure, which the caller maps to
    /// exit code 1.
    pub async fn dispatch(&self, args: &[String]) -> Result<i32> {
        let operation = args.first().map(String::as_str).unwrap_or("").to_string();
        let sequencing = sequencing_for(&operation, self.config.payment_mode);
        debug!(
            operation = %operation,
            mode = %self.config.payment_mode,
            sequencing = ?sequencing,
            "Dispatching"
        );

        match sequencing {
            Sequencing::Ungated => self.runner.run(args).await,
            Sequencing::PublishBefore => self.publish_before(&operation, args).await,
            Sequencing::PublishAfter => self.publish_after(&operation, args).await,
        }
    }

    fn payment_options(&self) -> Result<PaymentOptions> {
        if self.config.payment.destination.is_empty() {
            anyhow::bail!(
                "No payment destination configured; set payment.destination in config.toml"
            );
        }
        Ok(PaymentOptions {
            destination: self.config.payment.destination.clone(),
            currency_code: self.config.payment.currency_code.clone(),
            preflight_balance_check: self.config.payment.preflight_balance_check,
            ..PaymentOptions::default()
        })
    }

    /// Gatekeeper sequencing: payment failure aborts before the tool runs.
    /// Once the payment settles, the tool's exit code stands on its own.
    async fn publish_before(&self, operation: &str, args: &[String]) -> Result<i32> {
        let options = self.payment_options()?;
        let mode = self.config.payment_mode.to_string();
        let token = self.auth.ensure_authenticated(&mode).await?;

        let note = format!("git {}", operation);
        self.executor
            .execute_payment(self.config.payment.amount, &note, &token, &options)
            .await?;

        self.runner.run(args).await
    }

    /// Tool-first sequencing: a failed tool run is propagated without
    /// paying; payment failure after a successful run is a soft fail.
    async fn publish_after(&self, operation: &str, args: &[String]) -> Result<i32> {
        let code = self.runner.run(args).await?;
        if code != 0 {
            debug!(code = code, "Tool failed, skipping payment");
            return Ok(code);
        }

        if let Err(e) = self.pay_for_completed(operation).await {
            // Soft fail: the operation already succeeded, payment must not
            // take that away
            warn!(error = %format!("{:#}", e), "Operation succeeded but the payment failed");
            eprintln!("warning: {} succeeded but the payment could not be completed", operation);
        }

        Ok(0)
    }

    async fn pay_for_completed(&self, operation: &str) -> Result<()> {
        let options = self.payment_options()?;
        let mode = self.config.payment_mode.to_string();
        let token = self.auth.ensure_authenticated(&mode).await?;

        // Lead the note with the content identifier so truncation keeps it
        let note = match self
            .runner
            .capture(&["rev-parse".to_string(), "--short".to_string(), "HEAD".to_string()])
            .await
        {
            Ok(commit_id) => format!("{} git {}", commit_id, operation),
            Err(e) => {
                warn!(error = %e, "Could not capture a content identifier for the payment note");
                format!("git {}", operation)
            }
        };

        let receipt = self
            .executor
            .execute_payment(self.config.payment.amount, &note, &token, &options)
            .await?;
        info!(
            transaction_id = %receipt.transaction_id,
            operation = %operation,
            "Payment settled after operation"
        );
        Ok(())
    }
}
