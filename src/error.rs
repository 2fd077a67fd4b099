//! Error taxonomy for the scanner.
//!
//! Provider-facing failures are classified so callers can decide what to do
//! without string-matching: transient errors retry, rate limits wait, 404s
//! become sticky skips, validation failures drop the payload, and an open
//! circuit short-circuits the whole scan cycle.

use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Network-level failure (connect, timeout, transport) — retryable.
    #[error("transient network error: {0}")]
    Transient(String),

    /// Provider returned 429. Carries the server-indicated wait if present.
    #[error("provider rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    /// Provider returned 404 for the symbol. Permanent for the process.
    #[error("symbol not found: {0}")]
    NotFound(String),

    /// Payload was present but unusable (NaN/Inf prices, missing sections).
    #[error("response failed validation: {0}")]
    DataValidation(String),

    /// The shared circuit breaker is open; no request was issued.
    #[error("circuit breaker open")]
    CircuitOpen,

    /// Any other non-success status the retry policy gave up on.
    #[error("unexpected status {0} from provider")]
    Status(u16),
}

impl FetchError {
    /// Whether the generic retry policy should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Transient(_) | FetchError::RateLimited { .. }
        ) || matches!(self, FetchError::Status(s) if *s >= 500)
    }

    /// Hard failures feed the circuit breaker; rate limits and 404s do not.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(self, FetchError::Transient(_))
            || matches!(self, FetchError::Status(s) if *s >= 500)
    }
}

/// Webhook delivery failures are counted, never propagated into scan loops.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook transport error: {0}")]
    Transport(String),

    #[error("webhook rejected payload with status {0}")]
    Status(u16),
}
