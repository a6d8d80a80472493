// Command-line parsing
pub mod cli;

// Runtime configuration and payment-gating policy
pub mod config;

// Encrypted credential storage
pub mod credentials;

// Session validation with TTL cache
pub mod session;

// Remote identity/payment provider client
pub mod provider;

// Local OAuth callback capture
pub mod oauth;

// Authentication orchestration
pub mod auth;

// Payment execution with retry and backoff
pub mod payment;

// Gating policy and command sequencing
pub mod dispatch;
