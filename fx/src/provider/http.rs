//! Shared HTTP plumbing for the JSON rate providers.

use chrono::NaiveDate;
use ratekeeper_common::CurrencyCode;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::error::ProviderError;

/// Classify a non-success HTTP status.
pub(crate) fn status_error(
    status: StatusCode,
    from: &CurrencyCode,
    to: &CurrencyCode,
    date: NaiveDate,
) -> ProviderError {
    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound {
            from: from.clone(),
            to: to.clone(),
            date,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Unauthorized(status.to_string())
        }
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
            ProviderError::Status { code: s.as_u16() }
        }
        s if s.is_client_error() => ProviderError::Unsupported {
            from: from.clone(),
            to: to.clone(),
        },
        s => ProviderError::InvalidResponse(format!("unexpected status {}", s)),
    }
}

pub(crate) fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Http(err.to_string())
    }
}

/// GET `url` with `query` and decode a JSON body, mapping failures to [`ProviderError`].
pub(crate) async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    query: &[(&str, &str)],
    from: &CurrencyCode,
    to: &CurrencyCode,
    date: NaiveDate,
) -> Result<T, ProviderError> {
    let response = client
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(transport_error)?;

    let status = response.status();
    if !status.is_success() {
        return Err(status_error(status, from, to, date));
    }

    let body = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&body).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
}
