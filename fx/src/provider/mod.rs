//! Rate providers and the retrying provider chain.

mod exchangerate_host;
mod frankfurter;
mod http;

pub use exchangerate_host::ExchangeRateHostProvider;
pub use frankfurter::FrankfurterProvider;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use ratekeeper_common::CurrencyCode;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{FxConfig, RetryConfig};
use crate::error::{FxError, FxResult, ProviderError, ProviderFailure};
use crate::model::{ExchangeRate, SourcePriority};

/// Name of the ECB-backed Frankfurter provider.
pub const FRANKFURTER: &str = "frankfurter";
/// Name of the exchangerate.host provider.
pub const EXCHANGERATE_HOST: &str = "exchangerate_host";

/// Trait for external exchange rate sources.
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Get the provider name. Used as the stored rate's source tag.
    fn name(&self) -> &str;

    /// Priority given to rates from this provider.
    fn priority(&self) -> SourcePriority;

    /// Whether required credentials are present.
    fn is_configured(&self) -> bool {
        true
    }

    /// Check if this provider quotes the given direction.
    fn supports(&self, from: &CurrencyCode, to: &CurrencyCode) -> bool {
        from != to
    }

    /// Units of `to` per unit of `from` on `date`.
    async fn fetch_rate(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
    ) -> Result<Decimal, ProviderError>;
}

/// Call counters for one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderCounters {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Provider chain statistics.
#[derive(Debug, Clone, Default)]
pub struct ProviderStats {
    /// Fetches currently running.
    pub in_flight: usize,
    pub per_provider: BTreeMap<String, ProviderCounters>,
}

/// Decrements the in-flight counter when a fetch ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum ProviderAttempt {
    Cancelled,
    Exhausted(ProviderFailure),
}

/// Ordered providers tried one after another, each with retry and backoff.
///
/// Never writes to the rate store; callers persist what they receive.
pub struct ProviderChain {
    providers: Vec<Arc<dyn RateProvider>>,
    skipped: Vec<String>,
    retry: RetryConfig,
    fetch_timeout: Duration,
    in_flight: AtomicUsize,
    counters: DashMap<String, ProviderCounters>,
}

impl ProviderChain {
    /// Create a chain from providers in priority order. Providers lacking
    /// credentials are dropped here and listed in [`ProviderChain::skipped`].
    pub fn new(
        providers: Vec<Arc<dyn RateProvider>>,
        retry: RetryConfig,
        fetch_timeout: Duration,
    ) -> Self {
        let mut eligible = Vec::with_capacity(providers.len());
        let mut skipped = Vec::new();

        for provider in providers {
            if provider.is_configured() {
                eligible.push(provider);
            } else {
                warn!(provider = provider.name(), "Provider missing credentials; disabled");
                skipped.push(provider.name().to_string());
            }
        }

        info!(
            providers = ?eligible.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "Provider chain ready"
        );

        Self {
            providers: eligible,
            skipped,
            retry,
            fetch_timeout,
            in_flight: AtomicUsize::new(0),
            counters: DashMap::new(),
        }
    }

    /// Build the HTTP providers named in `config.providers.order`.
    pub fn from_config(config: &FxConfig) -> FxResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .user_agent(concat!("ratekeeper/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FxError::Config(format!("HTTP client: {}", e)))?;

        let mut providers: Vec<Arc<dyn RateProvider>> = Vec::new();
        for (position, name) in config.providers.order.iter().enumerate() {
            let priority = SourcePriority::for_provider_position(position);
            match name.as_str() {
                FRANKFURTER => providers.push(Arc::new(FrankfurterProvider::new(
                    client.clone(),
                    config.providers.frankfurter_base_url.clone(),
                    priority,
                ))),
                EXCHANGERATE_HOST => providers.push(Arc::new(ExchangeRateHostProvider::new(
                    client.clone(),
                    config.providers.exchangerate_host_base_url.clone(),
                    config.providers.exchangerate_host_access_key.clone(),
                    priority,
                ))),
                other => return Err(FxError::Config(format!("Unknown provider: {}", other))),
            }
        }

        Ok(Self::new(providers, config.retry.clone(), config.fetch_timeout))
    }

    /// Names of the eligible providers, in order.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Providers disabled at construction for missing credentials.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Fetch a rate from the first provider that succeeds.
    ///
    /// Fails with [`FxError::CompositeProvider`] when every eligible provider
    /// fails, and with [`FxError::Cancelled`] as soon as `cancel` fires.
    #[instrument(skip_all, fields(from = %from, to = %to, date = %date))]
    pub async fn fetch_rate(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
        cancel: &CancellationToken,
    ) -> FxResult<ExchangeRate> {
        let _in_flight = InFlightGuard::enter(&self.in_flight);
        let mut failures = Vec::new();

        for provider in &self.providers {
            if !provider.supports(from, to) {
                continue;
            }

            match self.fetch_with_retry(provider.as_ref(), from, to, date, cancel).await {
                Ok(rate) => {
                    debug!(provider = provider.name(), rate = %rate, "Got rate from provider");
                    return Ok(ExchangeRate::new(
                        from.clone(),
                        to.clone(),
                        date,
                        rate,
                        provider.name(),
                        provider.priority(),
                    ));
                }
                Err(ProviderAttempt::Cancelled) => return Err(FxError::Cancelled),
                Err(ProviderAttempt::Exhausted(failure)) => {
                    warn!(
                        provider = %failure.provider,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "Provider failed to return rate"
                    );
                    failures.push(failure);
                }
            }
        }

        Err(FxError::CompositeProvider {
            from: from.clone(),
            to: to.clone(),
            date,
            failures,
        })
    }

    async fn fetch_with_retry(
        &self,
        provider: &dyn RateProvider,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<Decimal, ProviderAttempt> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.count(provider.name(), |c| c.attempts += 1);

            let call = tokio::time::timeout(self.fetch_timeout, provider.fetch_rate(from, to, date));
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderAttempt::Cancelled),
                outcome = call => outcome.unwrap_or(Err(ProviderError::Timeout)),
            };

            let error = match result {
                Ok(rate) if rate > Decimal::ZERO => {
                    self.count(provider.name(), |c| c.successes += 1);
                    return Ok(rate);
                }
                Ok(rate) => ProviderError::InvalidResponse(format!("non-positive rate {}", rate)),
                Err(e) => e,
            };
            self.count(provider.name(), |c| c.failures += 1);

            if !error.is_retryable() || attempt >= max_attempts {
                return Err(ProviderAttempt::Exhausted(ProviderFailure {
                    provider: provider.name().to_string(),
                    attempts: attempt,
                    error,
                }));
            }

            let delay = self.retry.backoff_delay(attempt);
            debug!(
                provider = provider.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying provider after delay"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderAttempt::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn count(&self, provider: &str, update: impl FnOnce(&mut ProviderCounters)) {
        update(self.counters.entry(provider.to_string()).or_default().value_mut());
    }

    /// Get chain statistics.
    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            per_provider: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

/// Scriptable provider for tests.
#[cfg(any(test, feature = "test-utils"))]
pub struct MockRateProvider {
    name: String,
    priority: SourcePriority,
    configured: bool,
    rates: DashMap<(CurrencyCode, CurrencyCode), Decimal>,
    dated_rates: DashMap<(CurrencyCode, CurrencyCode, NaiveDate), Decimal>,
    failure: parking_lot::Mutex<Option<ProviderError>>,
    transient_failures: std::sync::atomic::AtomicU32,
    delay: Option<Duration>,
    calls: std::sync::atomic::AtomicU32,
}

#[cfg(any(test, feature = "test-utils"))]
impl MockRateProvider {
    /// Create a new mock provider.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: SourcePriority::PROVIDER,
            configured: true,
            rates: DashMap::new(),
            dated_rates: DashMap::new(),
            failure: parking_lot::Mutex::new(None),
            transient_failures: std::sync::atomic::AtomicU32::new(0),
            delay: None,
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn with_priority(mut self, priority: SourcePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Report missing credentials.
    pub fn unconfigured(mut self) -> Self {
        self.configured = false;
        self
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Quote `rate` for the pair on any date.
    pub fn set_rate(&self, from: CurrencyCode, to: CurrencyCode, rate: Decimal) {
        self.rates.insert((from, to), rate);
    }

    /// Quote `rate` for the pair on one date only.
    pub fn set_rate_on(&self, from: CurrencyCode, to: CurrencyCode, date: NaiveDate, rate: Decimal) {
        self.dated_rates.insert((from, to, date), rate);
    }

    /// Fail every call with `error`.
    pub fn fail_with(&self, error: ProviderError) {
        *self.failure.lock() = Some(error);
    }

    /// Fail the next `times` calls with a retryable error.
    pub fn fail_transiently(&self, times: u32) {
        self.transient_failures.store(times, Ordering::SeqCst);
    }

    /// Number of `fetch_rate` calls received.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl RateProvider for MockRateProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> SourcePriority {
        self.priority
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn fetch_rate(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
    ) -> Result<Decimal, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.failure.lock().clone();
        if let Some(error) = scripted {
            return Err(error);
        }

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Status { code: 503 });
        }

        let dated = self
            .dated_rates
            .get(&(from.clone(), to.clone(), date))
            .map(|r| *r);
        dated
            .or_else(|| self.rates.get(&(from.clone(), to.clone())).map(|r| *r))
            .ok_or_else(|| ProviderError::NotFound {
                from: from.clone(),
                to: to.clone(),
                date,
            })
    }
}
