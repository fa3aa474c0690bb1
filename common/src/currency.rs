//! Currency codes and currency pairs.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CommonError, Result};

/// ISO 4217 currency code.
///
/// Always three upper-case ASCII letters; construction through [`CurrencyCode::parse`]
/// (or serde) rejects anything else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// Parse and normalize a currency code.
    pub fn parse(code: &str) -> Result<Self> {
        let trimmed = code.trim();
        if trimmed.len() != 3 || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(CommonError::InvalidCurrencyCode(code.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    /// Number of decimal places of the smallest subunit.
    pub fn decimal_places(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" | "CLP" | "ISK" => 0,
            "BHD" | "KWD" | "OMR" | "JOD" | "TND" => 3,
            _ => 2,
        }
    }

    fn known(code: &'static str) -> Self {
        Self(code.to_string())
    }

    pub fn usd() -> Self {
        Self::known("USD")
    }

    pub fn eur() -> Self {
        Self::known("EUR")
    }

    pub fn gbp() -> Self {
        Self::known("GBP")
    }

    pub fn ils() -> Self {
        Self::known("ILS")
    }

    pub fn jpy() -> Self {
        Self::known("JPY")
    }

    pub fn cad() -> Self {
        Self::known("CAD")
    }

    pub fn chf() -> Self {
        Self::known("CHF")
    }

    pub fn aud() -> Self {
        Self::known("AUD")
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CurrencyCode {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.0
    }
}

/// An ordered (from, to) pair of currencies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CurrencyPair {
    /// Currency being converted from.
    pub base: CurrencyCode,
    /// Currency being converted to.
    pub quote: CurrencyCode,
}

impl CurrencyPair {
    /// Create a new currency pair.
    pub fn new(base: CurrencyCode, quote: CurrencyCode) -> Self {
        Self { base, quote }
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = CommonError;

    /// Accepts `USD:EUR`, `USD/EUR` or `USDEUR`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (base, quote) = match s.split_once(|c: char| c == ':' || c == '/') {
            Some(parts) => parts,
            None if s.len() == 6 && s.is_ascii() => s.split_at(3),
            None => return Err(CommonError::InvalidCurrencyCode(s.to_string())),
        };
        Ok(Self::new(CurrencyCode::parse(base)?, CurrencyCode::parse(quote)?))
    }
}

/// The configured set of currencies the engine will convert between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SupportedCurrencies(BTreeSet<CurrencyCode>);

impl SupportedCurrencies {
    /// Build a set from explicit codes.
    pub fn new(codes: impl IntoIterator<Item = CurrencyCode>) -> Self {
        Self(codes.into_iter().collect())
    }

    /// Parse a comma-separated list such as `"USD,EUR,ILS"`.
    pub fn parse_list(list: &str) -> Result<Self> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(CurrencyCode::parse)
            .collect::<Result<BTreeSet<_>>>()
            .map(Self)
    }

    pub fn contains(&self, code: &CurrencyCode) -> bool {
        self.0.contains(code)
    }

    /// Fail with [`CommonError::UnsupportedCurrency`] when `code` is not in the set.
    pub fn ensure(&self, code: &CurrencyCode) -> Result<()> {
        if self.contains(code) {
            Ok(())
        } else {
            Err(CommonError::UnsupportedCurrency(code.clone()))
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CurrencyCode> {
        self.0.iter()
    }
}

impl Default for SupportedCurrencies {
    fn default() -> Self {
        Self::new([
            CurrencyCode::usd(),
            CurrencyCode::eur(),
            CurrencyCode::gbp(),
            CurrencyCode::ils(),
            CurrencyCode::jpy(),
            CurrencyCode::cad(),
            CurrencyCode::chf(),
            CurrencyCode::aud(),
        ])
    }
}
