use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use tollgit::auth::AuthFlow;
use tollgit::cli::{AuthCommand, Cli, Command, ConfigCommand};
use tollgit::config::Config;
use tollgit::credentials::CredentialStore;
use tollgit::dispatch::{Dispatcher, GitRunner};
use tollgit::payment::PaymentExecutor;
use tollgit::provider::{PaymentProvider, ProviderClient};

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber; logs go to stderr so forwarded git
    // output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tollgit=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Map usage errors to exit code 1; --help/--version stay successful
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            print_failure(&e);
            1
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config_path = Config::default_path()
        .context("Could not resolve a per-user configuration directory")?;
    let config = Config::load_or_default(&config_path);

    match cli.command {
        Some(Command::Auth { command }) => run_auth(command, config).await,
        Some(Command::Config { command }) => run_config(command, config, &config_path),
        Some(Command::Git(args)) => run_git(args, config).await,
        // Bare invocation: forward to git, which prints its usage
        None => run_git(Vec::new(), config).await,
    }
}

/// Wire up the store, provider client, and orchestrators.
fn build_parts(config: &Config) -> Result<(AuthFlow, PaymentExecutor)> {
    let provider: Arc<dyn PaymentProvider> =
        Arc::new(ProviderClient::new(config.provider_base_url.clone()));
    let store = CredentialStore::default_location()?;

    // Deliberate startup repair: read paths stay free of side effects
    if let Err(e) = store.repair() {
        warn!(error = %e, "Credential store repair failed");
    }

    let auth = AuthFlow::new(provider.clone(), store);
    let executor = PaymentExecutor::new(provider);
    Ok((auth, executor))
}

async fn run_git(args: Vec<String>, config: Config) -> Result<i32> {
    let (auth, executor) = build_parts(&config)?;
    let dispatcher = Dispatcher::new(auth, executor, Box::new(GitRunner::new()), config);
    dispatcher.dispatch(&args).await
}

async fn run_auth(command: AuthCommand, config: Config) -> Result<i32> {
    let (auth, _executor) = build_parts(&config)?;

    match command {
        AuthCommand::Login => {
            auth.login(&config.payment_mode.to_string()).await?;
            println!("Authentication successful.");
            Ok(0)
        }
        AuthCommand::Logout => {
            if auth.logout()? {
                println!("Logged out.");
            } else {
                println!("No active session.");
            }
            Ok(0)
        }
        AuthCommand::Status => {
            let status = auth.status().await;

            if status.env_override {
                println!("Session: injected via environment");
            } else if status.has_stored_token {
                println!("Session: stored on this machine");
            } else {
                println!("Session: none (run `tollgit auth login`)");
            }

            match &status.profile {
                Some(profile) => match &profile.display_name {
                    Some(name) => println!("Account: {} ({})", profile.handle, name),
                    None => println!("Account: {}", profile.handle),
                },
                None if status.has_stored_token || status.env_override => {
                    println!("Account: unavailable (provider unreachable or session invalid)");
                }
                None => {}
            }

            if let Some(balance) = &status.balance {
                println!(
                    "Spendable balance: {} ({} local)",
                    balance.spendable, balance.spendable_local
                );
            }

            for issue in &status.store_issues {
                println!("Store issue: {}", issue);
            }

            Ok(0)
        }
    }
}

fn run_config(command: ConfigCommand, mut config: Config, config_path: &Path) -> Result<i32> {
    match command {
        ConfigCommand::PaymentMode { value: None } => {
            println!("payment-mode: {}", config.payment_mode);
            match config.payment_mode {
                tollgit::config::PaymentMode::Minimal => {
                    println!("Gated operations: push (pay first), commit (pay after)");
                }
                tollgit::config::PaymentMode::Universal => {
                    println!("Gated operations: all (commit pays after, everything else pays first)");
                }
            }
            Ok(0)
        }
        ConfigCommand::PaymentMode { value: Some(value) } => {
            // Takes effect on the next invocation; no re-authentication needed
            let mode: tollgit::config::PaymentMode =
                value.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            config.payment_mode = mode;
            config.save(config_path)?;
            println!("payment-mode set to {}", mode);
            Ok(0)
        }
    }
}

/// One-line failure summary plus a contextual remediation hint.
fn print_failure(e: &anyhow::Error) {
    eprintln!("error: {:#}", e);

    let text = format!("{:#}", e).to_lowercase();
    if text.contains("auth") || text.contains("token") || text.contains("session") {
        eprintln!("hint: run `tollgit auth login` to re-authenticate");
    } else if text.contains("insufficient")
        || text.contains("balance")
        || text.contains("funds")
        || text.contains("payment")
    {
        eprintln!("hint: add funds to your provider account, then retry");
    }
}
