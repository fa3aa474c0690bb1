//! exchangerate.host historical endpoint. Requires an access key.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use ratekeeper_common::CurrencyCode;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::http::get_json;
use super::{RateProvider, EXCHANGERATE_HOST};
use crate::error::ProviderError;
use crate::model::SourcePriority;

#[derive(Debug, Deserialize)]
struct ApiError {
    code: u32,
    #[serde(default)]
    info: String,
}

#[derive(Debug, Deserialize)]
struct HistoricalResponse {
    success: bool,
    #[serde(default)]
    quotes: HashMap<String, Decimal>,
    error: Option<ApiError>,
}

impl HistoricalResponse {
    fn rate_for(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
    ) -> Result<Decimal, ProviderError> {
        if !self.success {
            let (code, info) = self
                .error
                .as_ref()
                .map(|e| (e.code, e.info.clone()))
                .unwrap_or((0, "unspecified error".to_string()));
            return Err(match code {
                101 | 102 | 103 => ProviderError::Unauthorized(info),
                104 => ProviderError::Status { code: 429 },
                106 => ProviderError::NotFound {
                    from: from.clone(),
                    to: to.clone(),
                    date,
                },
                201 | 202 => ProviderError::Unsupported {
                    from: from.clone(),
                    to: to.clone(),
                },
                _ => ProviderError::InvalidResponse(format!("error {}: {}", code, info)),
            });
        }

        let quote_key = format!("{}{}", from.code(), to.code());
        self.quotes
            .get(&quote_key)
            .copied()
            .ok_or_else(|| ProviderError::InvalidResponse(format!("no {} quote in response", quote_key)))
    }
}

/// Historical rates from `api.exchangerate.host`.
pub struct ExchangeRateHostProvider {
    client: reqwest::Client,
    base_url: String,
    access_key: Option<String>,
    priority: SourcePriority,
}

impl ExchangeRateHostProvider {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        access_key: Option<String>,
        priority: SourcePriority,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_key: access_key.filter(|k| !k.trim().is_empty()),
            priority,
        }
    }
}

#[async_trait]
impl RateProvider for ExchangeRateHostProvider {
    fn name(&self) -> &str {
        EXCHANGERATE_HOST
    }

    fn priority(&self) -> SourcePriority {
        self.priority
    }

    fn is_configured(&self) -> bool {
        self.access_key.is_some()
    }

    async fn fetch_rate(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
    ) -> Result<Decimal, ProviderError> {
        let access_key = self
            .access_key
            .as_deref()
            .ok_or_else(|| ProviderError::Unauthorized("no access key configured".to_string()))?;

        let url = format!("{}/historical", self.base_url);
        let date_param = date.format("%Y-%m-%d").to_string();
        let response: HistoricalResponse = get_json(
            &self.client,
            &url,
            &[
                ("access_key", access_key),
                ("date", &date_param),
                ("source", from.code()),
                ("currencies", to.code()),
            ],
            from,
            to,
            date,
        )
        .await?;
        response.rate_for(from, to, date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
    }

    #[test]
    fn test_parse_quotes() {
        let body = r#"{"success":true,"historical":true,"date":"2024-01-02","source":"USD","quotes":{"USDILS":3.6231}}"#;
        let response: HistoricalResponse = serde_json::from_str(body).unwrap();

        let rate = response
            .rate_for(&CurrencyCode::usd(), &CurrencyCode::ils(), date())
            .unwrap();
        assert_eq!(rate, dec!(3.6231));
    }

    #[test]
    fn test_api_errors_are_classified() {
        let invalid_key = r#"{"success":false,"error":{"code":101,"type":"invalid_access_key","info":"bad key"}}"#;
        let no_result = r#"{"success":false,"error":{"code":106,"type":"no_rates_available"}}"#;
        let throttled = r#"{"success":false,"error":{"code":104,"info":"limit"}}"#;

        let parse = |body: &str| {
            serde_json::from_str::<HistoricalResponse>(body)
                .unwrap()
                .rate_for(&CurrencyCode::usd(), &CurrencyCode::eur(), date())
                .unwrap_err()
        };

        assert_eq!(parse(invalid_key), ProviderError::Unauthorized("bad key".to_string()));
        assert!(matches!(parse(no_result), ProviderError::NotFound { .. }));
        assert!(parse(throttled).is_retryable());
    }

    #[test]
    fn test_requires_access_key() {
        let without = ExchangeRateHostProvider::new(
            reqwest::Client::new(),
            "https://api.exchangerate.host",
            Some("  ".to_string()),
            SourcePriority::PROVIDER,
        );
        let with = ExchangeRateHostProvider::new(
            reqwest::Client::new(),
            "https://api.exchangerate.host",
            Some("key".to_string()),
            SourcePriority::PROVIDER,
        );
        assert!(!without.is_configured());
        assert!(with.is_configured());
    }
}
