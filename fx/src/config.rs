//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use ratekeeper_common::SupportedCurrencies;
use serde::{Deserialize, Serialize};

use crate::error::{FxError, FxResult};
use crate::provider::{EXCHANGERATE_HOST, FRANKFURTER};

/// Serde adapter storing a `Duration` as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Per-provider retry with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per provider, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
    /// Upper bound for any single delay.
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2,
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Batch fetch scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Keys fetched per batch.
    pub batch_size: usize,
    /// Pause between consecutive batches.
    #[serde(with = "duration_ms", rename = "inter_batch_delay_ms")]
    pub inter_batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            inter_batch_delay: Duration::from_secs(1),
        }
    }
}

/// Provider selection and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider names, highest priority first.
    pub order: Vec<String>,
    pub frankfurter_base_url: String,
    pub exchangerate_host_base_url: String,
    /// Absent key disables exchangerate.host.
    pub exchangerate_host_access_key: Option<String>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            order: vec![FRANKFURTER.to_string(), EXCHANGERATE_HOST.to_string()],
            frankfurter_base_url: "https://api.frankfurter.app".to_string(),
            exchangerate_host_base_url: "https://api.exchangerate.host".to_string(),
            exchangerate_host_access_key: None,
        }
    }
}

/// Configuration for the rate engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FxConfig {
    /// Currencies the engine converts between.
    pub supported_currencies: SupportedCurrencies,
    /// Dates at most this many days old are fetched on demand.
    pub recent_date_threshold_days: u32,
    /// Widest distance, in days, accepted for a fallback rate.
    pub max_fallback_days: u32,
    pub retry: RetryConfig,
    /// Timeout for a single provider attempt.
    #[serde(with = "duration_ms", rename = "fetch_timeout_ms")]
    pub fetch_timeout: Duration,
    pub batch: BatchConfig,
    pub providers: ProvidersConfig,
}

impl Default for FxConfig {
    fn default() -> Self {
        Self {
            supported_currencies: SupportedCurrencies::default(),
            recent_date_threshold_days: 7,
            max_fallback_days: 30,
            retry: RetryConfig::default(),
            fetch_timeout: Duration::from_secs(10),
            batch: BatchConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> FxResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| FxError::Config(format!("{} has invalid value {:?}", name, value)))
}

impl FxConfig {
    /// Load configuration from environment variables on top of the defaults.
    pub fn from_env() -> FxResult<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Load a JSON file (when given), then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> FxResult<Self> {
        let base = match path {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .map_err(|e| FxError::Config(format!("{}: {}", path.display(), e)))?;
                serde_json::from_slice(&bytes)
                    .map_err(|e| FxError::Config(format!("{}: {}", path.display(), e)))?
            }
            None => Self::default(),
        };
        let config = base.with_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides read through `lookup`. Unparsable values are errors.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> FxResult<Self> {
        if let Some(list) = lookup("FX_SUPPORTED_CURRENCIES") {
            self.supported_currencies = SupportedCurrencies::parse_list(&list)?;
        }

        if let Some(v) = lookup("FX_RECENT_DATE_THRESHOLD_DAYS") {
            self.recent_date_threshold_days = parse_var("FX_RECENT_DATE_THRESHOLD_DAYS", &v)?;
        }

        if let Some(v) = lookup("FX_MAX_FALLBACK_DAYS") {
            self.max_fallback_days = parse_var("FX_MAX_FALLBACK_DAYS", &v)?;
        }

        if let Some(v) = lookup("FX_RETRY_ATTEMPTS") {
            self.retry.max_attempts = parse_var("FX_RETRY_ATTEMPTS", &v)?;
        }

        if let Some(v) = lookup("FX_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay = Duration::from_millis(parse_var("FX_RETRY_BASE_DELAY_MS", &v)?);
        }

        if let Some(v) = lookup("FX_RETRY_MAX_DELAY_MS") {
            self.retry.max_delay = Duration::from_millis(parse_var("FX_RETRY_MAX_DELAY_MS", &v)?);
        }

        if let Some(v) = lookup("FX_FETCH_TIMEOUT_MS") {
            self.fetch_timeout = Duration::from_millis(parse_var("FX_FETCH_TIMEOUT_MS", &v)?);
        }

        if let Some(v) = lookup("FX_BATCH_SIZE") {
            self.batch.batch_size = parse_var("FX_BATCH_SIZE", &v)?;
        }

        if let Some(v) = lookup("FX_BATCH_DELAY_MS") {
            self.batch.inter_batch_delay = Duration::from_millis(parse_var("FX_BATCH_DELAY_MS", &v)?);
        }

        if let Some(list) = lookup("FX_PROVIDERS") {
            self.providers.order = list
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(key) = lookup("EXCHANGERATE_HOST_ACCESS_KEY") {
            let key = key.trim().to_string();
            self.providers.exchangerate_host_access_key = (!key.is_empty()).then_some(key);
        }

        Ok(self)
    }

    /// Validate configuration.
    pub fn validate(&self) -> FxResult<()> {
        if self.supported_currencies.is_empty() {
            return Err(FxError::Config("Supported currency set cannot be empty".to_string()));
        }

        if self.retry.max_attempts == 0 {
            return Err(FxError::Config("Retry attempts must be at least 1".to_string()));
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(FxError::Config(
                "Base retry delay cannot exceed max delay".to_string(),
            ));
        }

        if self.batch.batch_size == 0 {
            return Err(FxError::Config("Batch size must be at least 1".to_string()));
        }

        if let Some(unknown) = self
            .providers
            .order
            .iter()
            .find(|name| name.as_str() != FRANKFURTER && name.as_str() != EXCHANGERATE_HOST)
        {
            return Err(FxError::Config(format!("Unknown provider: {}", unknown)));
        }

        Ok(())
    }
}
