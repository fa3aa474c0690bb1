//! Frankfurter (European Central Bank reference rates). No credentials.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use ratekeeper_common::CurrencyCode;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::http::get_json;
use super::{RateProvider, FRANKFURTER};
use crate::error::ProviderError;
use crate::model::SourcePriority;

#[derive(Debug, Deserialize)]
struct FrankfurterResponse {
    base: String,
    #[allow(dead_code)]
    date: NaiveDate,
    rates: HashMap<String, Decimal>,
}

impl FrankfurterResponse {
    fn rate_for(&self, from: &CurrencyCode, to: &CurrencyCode) -> Result<Decimal, ProviderError> {
        if !self.base.eq_ignore_ascii_case(from.code()) {
            return Err(ProviderError::InvalidResponse(format!(
                "asked for base {}, got {}",
                from, self.base
            )));
        }
        self.rates
            .get(to.code())
            .copied()
            .ok_or_else(|| ProviderError::InvalidResponse(format!("no {} quote in response", to)))
    }
}

/// Daily ECB reference rates from `api.frankfurter.app`.
///
/// Weekends and holidays resolve to the previous business day's publication.
pub struct FrankfurterProvider {
    client: reqwest::Client,
    base_url: String,
    priority: SourcePriority,
}

impl FrankfurterProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, priority: SourcePriority) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            priority,
        }
    }
}

#[async_trait]
impl RateProvider for FrankfurterProvider {
    fn name(&self) -> &str {
        FRANKFURTER
    }

    fn priority(&self) -> SourcePriority {
        self.priority
    }

    async fn fetch_rate(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
    ) -> Result<Decimal, ProviderError> {
        let url = format!("{}/{}", self.base_url, date.format("%Y-%m-%d"));
        let response: FrankfurterResponse = get_json(
            &self.client,
            &url,
            &[("from", from.code()), ("to", to.code())],
            from,
            to,
            date,
        )
        .await?;
        response.rate_for(from, to)
    }
}
