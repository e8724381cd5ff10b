//! Billing error types

use thiserror::Error;

/// Errors produced by the billing subsystem
#[derive(Debug, Error)]
pub enum BillingError {
    /// The payment integration is not configured (missing credential or
    /// price mapping). Callers surface this as "billing unavailable".
    #[error("Billing not configured: {0}")]
    NotConfigured(String),

    /// User-correctable bad input (unknown plan, malformed email, ...)
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Webhook signature did not validate against the shared secret
    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    /// Outbound processor call failed or timed out; retryable by the caller
    #[error("Payment processor unavailable: {0}")]
    ProcessorUnavailable(String),

    /// Unknown account or subscription
    #[error("Not found: {0}")]
    NotFound(String),

    /// Lost an optimistic-concurrency race too many times; safe to retry
    #[error("Concurrent update conflict: {0}")]
    WriteConflict(String),

    /// Store-layer failure
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Storage(e.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
