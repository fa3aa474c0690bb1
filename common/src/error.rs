//! Error types shared across Ratekeeper crates.

use thiserror::Error;

use crate::CurrencyCode;

/// Errors raised while building common value types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// Input is not a three-letter ISO 4217 code.
    #[error("Invalid currency code: {0:?}")]
    InvalidCurrencyCode(String),

    /// Code is well-formed but not in the configured set.
    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(CurrencyCode),
}

/// Result type alias for common operations.
pub type Result<T> = std::result::Result<T, CommonError>;
