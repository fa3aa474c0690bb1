//! Conversion request and result types.

use chrono::NaiveDate;
use ratekeeper_common::CurrencyCode;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{FxError, FxResult};
use crate::resolver::{Resolution, ResolutionOutcome};

/// Request to convert an amount on a given date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub amount: Decimal,
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    pub date: NaiveDate,
    /// Accept the nearest stored rate within the fallback window.
    pub allow_fallback: bool,
    /// Return the unconverted amount instead of failing when no rate exists.
    pub allow_degraded: bool,
}

impl ConversionRequest {
    /// Create a new conversion request with fallback on and degradation off.
    pub fn new(amount: Decimal, from: CurrencyCode, to: CurrencyCode, date: NaiveDate) -> Self {
        Self {
            amount,
            from,
            to,
            date,
            allow_fallback: true,
            allow_degraded: false,
        }
    }

    /// Create from a float amount. NaN and infinities are rejected.
    pub fn from_f64(amount: f64, from: CurrencyCode, to: CurrencyCode, date: NaiveDate) -> FxResult<Self> {
        let value = Decimal::from_f64(amount).ok_or_else(|| FxError::InvalidAmount {
            amount: amount.to_string(),
        })?;
        Ok(Self::new(value, from, to, date))
    }

    pub fn without_fallback(mut self) -> Self {
        self.allow_fallback = false;
        self
    }

    pub fn degraded(mut self) -> Self {
        self.allow_degraded = true;
        self
    }

    pub fn builder() -> ConversionBuilder {
        ConversionBuilder::new()
    }
}

/// Where the rate behind a conversion came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversionSource {
    SameCurrency,
    ExactDate,
    FetchedOnDemand,
    FallbackNearest,
    /// Degraded result; no rate was applied.
    None,
}

impl From<ResolutionOutcome> for ConversionSource {
    fn from(outcome: ResolutionOutcome) -> Self {
        match outcome {
            ResolutionOutcome::SameCurrency => ConversionSource::SameCurrency,
            ResolutionOutcome::ExactDate => ConversionSource::ExactDate,
            ResolutionOutcome::FetchedOnDemand => ConversionSource::FetchedOnDemand,
            ResolutionOutcome::FallbackNearest { .. } => ConversionSource::FallbackNearest,
        }
    }
}

/// Outcome of a conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub original_amount: Decimal,
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    /// Rounded to the target currency's subunit.
    pub converted_amount: Decimal,
    /// `None` only for degraded results.
    pub exchange_rate: Option<Decimal>,
    pub source: ConversionSource,
    pub fallback_used: bool,
    pub days_difference: u32,
    pub requested_date: NaiveDate,
    pub resolved_date: Option<NaiveDate>,
    /// Provider name or derivation tag of the record used.
    pub rate_source: Option<String>,
}

impl ConversionResult {
    pub(crate) fn resolved(request: &ConversionRequest, resolution: &Resolution, converted: Decimal) -> Self {
        Self {
            original_amount: request.amount,
            from: request.from.clone(),
            to: request.to.clone(),
            converted_amount: converted,
            exchange_rate: Some(resolution.rate),
            source: resolution.outcome.into(),
            fallback_used: matches!(resolution.outcome, ResolutionOutcome::FallbackNearest { .. }),
            days_difference: resolution.days_difference(),
            requested_date: request.date,
            resolved_date: Some(resolution.resolved_date),
            rate_source: resolution.source().map(str::to_string),
        }
    }

    /// The amount passed through unconverted.
    pub(crate) fn degraded(request: &ConversionRequest) -> Self {
        Self {
            original_amount: request.amount,
            from: request.from.clone(),
            to: request.to.clone(),
            converted_amount: request.amount,
            exchange_rate: None,
            source: ConversionSource::None,
            fallback_used: true,
            days_difference: 0,
            requested_date: request.date,
            resolved_date: None,
            rate_source: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.source == ConversionSource::None
    }
}

/// Builder for conversion requests.
#[derive(Debug, Clone, Default)]
pub struct ConversionBuilder {
    amount: Option<Decimal>,
    from: Option<CurrencyCode>,
    to: Option<CurrencyCode>,
    date: Option<NaiveDate>,
    allow_fallback: Option<bool>,
    allow_degraded: bool,
}

impl ConversionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn from_currency(mut self, currency: CurrencyCode) -> Self {
        self.from = Some(currency);
        self
    }

    pub fn to_currency(mut self, currency: CurrencyCode) -> Self {
        self.to = Some(currency);
        self
    }

    pub fn on(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn allow_fallback(mut self, allow: bool) -> Self {
        self.allow_fallback = Some(allow);
        self
    }

    pub fn allow_degraded(mut self, allow: bool) -> Self {
        self.allow_degraded = allow;
        self
    }

    /// Build the request. `None` if amount, currencies or date are missing.
    pub fn build(self) -> Option<ConversionRequest> {
        Some(ConversionRequest {
            amount: self.amount?,
            from: self.from?,
            to: self.to?,
            date: self.date?,
            allow_fallback: self.allow_fallback.unwrap_or(true),
            allow_degraded: self.allow_degraded,
        })
    }
}
