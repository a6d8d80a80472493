//! Session validation against the remote identity provider.
//!
//! Checks whether a session token is still honored by the provider, with a
//! time-bounded in-memory cache in front of the remote lookup. Validation
//! fails closed: callers always receive a boolean, never a provider error.

mod cache;

pub use cache::ValidationCache;

use crate::provider::{Balance, PaymentProvider, Profile};
use std::sync::Arc;
use tracing::{debug, warn};

/// Cache TTL for validation verdicts: one hour from cache-write time.
pub const VALIDATION_TTL_SECONDS: i64 = 3600;

/// Validates session tokens with a TTL cache over the remote check.
pub struct SessionValidator {
    provider: Arc<dyn PaymentProvider>,
    cache: ValidationCache,
}

impl SessionValidator {
    pub fn new(provider: Arc<dyn PaymentProvider>) -> Self {
        Self::with_cache(provider, ValidationCache::new(VALIDATION_TTL_SECONDS))
    }

    /// Construct with an injected cache (tests use a short TTL).
    pub fn with_cache(provider: Arc<dyn PaymentProvider>, cache: ValidationCache) -> Self {
        Self { provider, cache }
    }

    /// Whether the provider still honors this token.
    ///
    /// A cache hit within the TTL window short-circuits the remote check.
    /// On miss the provider resolves a profile from the token; a well-formed
    /// profile with a non-empty handle is valid. Any provider error or
    /// malformed response is invalid (fail closed).
    pub async fn is_valid(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }

        if let Some(cached) = self.cache.get(token) {
            debug!(valid = cached, "Token validation cache hit");
            return cached;
        }

        let valid = match self.provider.profile(token).await {
            Ok(profile) => {
                let valid = !profile.handle.is_empty();
                if !valid {
                    warn!("Provider returned a profile with an empty handle");
                }
                valid
            }
            Err(e) => {
                debug!(error = %e, "Token validation failed against provider");
                false
            }
        };

        self.cache.insert(token, valid);
        valid
    }

    /// Clear all cached verdicts.
    ///
    /// Must be called after logout or re-authentication so stale results
    /// do not survive a token rotation.
    pub fn invalidate_cache(&self) {
        self.cache.clear();
        debug!("Validation cache cleared");
    }

    /// Best-effort profile query. Provider failures are logged, not raised.
    pub async fn get_profile(&self, token: &str) -> Option<Profile> {
        match self.provider.profile(token).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(error = %e, "Could not fetch profile");
                None
            }
        }
    }

    /// Best-effort balance query. Provider failures are logged, not raised.
    pub async fn get_balance(&self, token: &str) -> Option<Balance> {
        match self.provider.balance(token).await {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!(error = %e, "Could not fetch balance");
                None
            }
        }
    }
}
