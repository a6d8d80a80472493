//! Runtime configuration.
//!
//! Loaded from `<config-dir>/tollgit/config.toml`. Every field has a
//! default, and an absent or unreadable file falls back to full defaults
//! (in particular the payment mode falls back to `minimal`), so the tool
//! works before any `tollgit config` command has ever run.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// Default provider API base URL.
pub const DEFAULT_PROVIDER_URL: &str = "https://api.tollgit.dev";

/// Payment-gating policy mode.
///
/// Closed set: `minimal` gates only the declared publish operations,
/// `universal` gates every forwarded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMode {
    #[default]
    Minimal,
    Universal,
}

impl FromStr for PaymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minimal" => Ok(PaymentMode::Minimal),
            "universal" => Ok(PaymentMode::Universal),
            other => Err(format!(
                "unknown payment mode '{}', expected 'minimal' or 'universal'",
                other
            )),
        }
    }
}

impl std::fmt::Display for PaymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentMode::Minimal => write!(f, "minimal"),
            PaymentMode::Universal => write!(f, "universal"),
        }
    }
}

/// Payment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Amount charged per gated operation
    #[serde(default = "default_amount")]
    pub amount: f64,
    /// Provider currency code
    #[serde(default = "default_currency_code")]
    pub currency_code: String,
    /// Destination handle payments are sent to
    #[serde(default)]
    pub destination: String,
    /// Query the balance before paying (failures only warn)
    #[serde(default)]
    pub preflight_balance_check: bool,
}

fn default_amount() -> f64 {
    0.01
}

fn default_currency_code() -> String {
    "USD".to_string()
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            amount: default_amount(),
            currency_code: default_currency_code(),
            destination: String::new(),
            preflight_balance_check: false,
        }
    }
}

/// Complete tollgit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_provider_base_url")]
    pub provider_base_url: String,
    #[serde(default)]
    pub payment: PaymentConfig,
    #[serde(default)]
    pub payment_mode: PaymentMode,
}

fn default_provider_base_url() -> String {
    DEFAULT_PROVIDER_URL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider_base_url: default_provider_base_url(),
            payment: PaymentConfig::default(),
            payment_mode: PaymentMode::default(),
        }
    }
}

impl Config {
    /// Default config file path (`<config-dir>/tollgit/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|base| base.join("tollgit").join("config.toml"))
    }

    /// Load configuration, falling back to defaults when the file is
    /// absent or unreadable.
    pub fn load_or_default(path: &Path) -> Config {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Config file is unreadable, using defaults"
                    );
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    /// Persist the configuration, creating the parent directory if needed.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}
