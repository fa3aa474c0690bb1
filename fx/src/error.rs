//! Rate engine error types.

use chrono::NaiveDate;
use ratekeeper_common::{CommonError, CurrencyCode};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::model::RateKey;

/// Failure of a single call to a single provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Transport-level failure (connect, TLS, body read).
    #[error("HTTP error: {0}")]
    Http(String),

    /// Server answered with a retryable status (429 or 5xx).
    #[error("Provider returned status {code}")]
    Status { code: u16 },

    /// Attempt exceeded the per-call timeout.
    #[error("Provider call timed out")]
    Timeout,

    /// Provider has no rate for this pair and date.
    #[error("No rate published for {from}/{to} on {date}")]
    NotFound {
        from: CurrencyCode,
        to: CurrencyCode,
        date: NaiveDate,
    },

    /// Credentials missing or refused.
    #[error("Provider rejected credentials: {0}")]
    Unauthorized(String),

    /// Provider does not quote this pair.
    #[error("Pair {from}/{to} not supported")]
    Unsupported { from: CurrencyCode, to: CurrencyCode },

    /// Response body could not be understood, or carried a non-positive rate.
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether another attempt against the same provider may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Http(_) | ProviderError::Status { .. } | ProviderError::Timeout
        )
    }
}

/// All attempts against one provider, summarized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    pub attempts: u32,
    pub error: ProviderError,
}

fn describe_failures(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no eligible providers".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{} after {} attempt(s): {}", f.provider, f.attempts, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur in the rate engine.
#[derive(Debug, Clone, Error)]
pub enum FxError {
    /// Amount is negative or not a finite number.
    #[error("Invalid amount: {amount}")]
    InvalidAmount { amount: String },

    /// Currency is outside the configured set.
    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(CurrencyCode),

    /// Currency code could not be parsed.
    #[error(transparent)]
    Currency(CommonError),

    /// Every eligible provider failed.
    #[error("All providers failed for {from}/{to} on {date}: {}", describe_failures(.failures))]
    CompositeProvider {
        from: CurrencyCode,
        to: CurrencyCode,
        date: NaiveDate,
        failures: Vec<ProviderFailure>,
    },

    /// No exact, fetchable or nearby rate exists.
    #[error("Rate unavailable for {from}/{to} on {date}")]
    RateUnavailable {
        from: CurrencyCode,
        to: CurrencyCode,
        date: NaiveDate,
    },

    /// A record with a non-positive rate was written or read.
    #[error("Storage integrity violation for {key}: rate {rate}")]
    StorageIntegrity { key: RateKey, rate: Decimal },

    /// Converted amount does not fit in a decimal.
    #[error("Conversion overflow: {amount} at rate {rate}")]
    Overflow { amount: Decimal, rate: Decimal },

    /// Persistence substrate failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<CommonError> for FxError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::UnsupportedCurrency(code) => FxError::UnsupportedCurrency(code),
            other => FxError::Currency(other),
        }
    }
}

/// Result type for FX operations.
pub type FxResult<T> = Result<T, FxError>;
