//! Layered rate resolution: same currency, stored rate, on-demand fetch for
//! recent dates, then the nearest stored rate within the fallback window.

use std::sync::Arc;

use chrono::NaiveDate;
use ratekeeper_common::{Clock, CurrencyCode};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::FxConfig;
use crate::error::{FxError, FxResult};
use crate::model::ExchangeRate;
use crate::provider::ProviderChain;
use crate::store::{RateStore, StoreOutcome};

/// How a rate was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    SameCurrency,
    ExactDate,
    FetchedOnDemand,
    FallbackNearest { days_difference: u32 },
}

/// A resolved rate and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Units of `to` per unit of `from`.
    pub rate: Decimal,
    /// Date of the record actually used.
    pub resolved_date: NaiveDate,
    /// Stored record behind the rate. `None` for same-currency.
    pub record: Option<ExchangeRate>,
    pub outcome: ResolutionOutcome,
}

impl Resolution {
    fn same_currency(date: NaiveDate) -> Self {
        Self {
            rate: Decimal::ONE,
            resolved_date: date,
            record: None,
            outcome: ResolutionOutcome::SameCurrency,
        }
    }

    fn from_record(record: ExchangeRate, outcome: ResolutionOutcome) -> Self {
        Self {
            rate: record.rate,
            resolved_date: record.date,
            record: Some(record),
            outcome,
        }
    }

    /// Distance between the requested and the resolved date.
    pub fn days_difference(&self) -> u32 {
        match self.outcome {
            ResolutionOutcome::FallbackNearest { days_difference } => days_difference,
            _ => 0,
        }
    }

    pub fn source(&self) -> Option<&str> {
        self.record.as_ref().map(|r| r.source.as_str())
    }
}

/// Resolves a rate for a (from, to, date) triple.
pub struct RateResolver {
    store: Arc<RateStore>,
    providers: Arc<ProviderChain>,
    clock: Arc<dyn Clock>,
    recent_date_threshold_days: u32,
    max_fallback_days: u32,
}

impl RateResolver {
    pub fn new(
        store: Arc<RateStore>,
        providers: Arc<ProviderChain>,
        clock: Arc<dyn Clock>,
        recent_date_threshold_days: u32,
        max_fallback_days: u32,
    ) -> Self {
        Self {
            store,
            providers,
            clock,
            recent_date_threshold_days,
            max_fallback_days,
        }
    }

    /// Resolver using the windows from `config`.
    pub fn with_config(
        config: &FxConfig,
        store: Arc<RateStore>,
        providers: Arc<ProviderChain>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            store,
            providers,
            clock,
            config.recent_date_threshold_days,
            config.max_fallback_days,
        )
    }

    /// Whether `date` may be fetched from providers: not in the future and
    /// at most `recent_date_threshold_days` old.
    pub fn is_recent(&self, date: NaiveDate) -> bool {
        let age = self.clock.age_of(date);
        age >= 0 && age <= i64::from(self.recent_date_threshold_days)
    }

    pub fn store(&self) -> &Arc<RateStore> {
        &self.store
    }

    pub fn providers(&self) -> &Arc<ProviderChain> {
        &self.providers
    }

    /// Resolve a rate, failing with [`FxError::RateUnavailable`] when every
    /// step comes up empty.
    #[instrument(skip_all, fields(from = %from, to = %to, date = %date))]
    pub async fn resolve(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
        allow_fallback: bool,
        cancel: &CancellationToken,
    ) -> FxResult<Resolution> {
        if from == to {
            return Ok(Resolution::same_currency(date));
        }

        match self.store.lookup_exact(from, to, date).await {
            Ok(Some(record)) => {
                return Ok(Resolution::from_record(record, ResolutionOutcome::ExactDate));
            }
            Ok(None) => {}
            Err(FxError::StorageIntegrity { key, rate }) => {
                warn!(key = %key, rate = %rate, "Stored rate is corrupt; ignoring it");
            }
            Err(e) => return Err(e),
        }

        if self.is_recent(date) {
            if let Some(resolution) = self.fetch_and_store(from, to, date, cancel).await? {
                return Ok(resolution);
            }
        } else {
            debug!(age_days = self.clock.age_of(date), "Date outside freshness window; not fetching");
        }

        if allow_fallback {
            if let Some((record, days)) = self
                .store
                .lookup_nearest(from, to, date, self.max_fallback_days)
                .await?
            {
                info!(resolved = %record.date, days, source = %record.source, "Using nearest stored rate");
                return Ok(Resolution::from_record(
                    record,
                    ResolutionOutcome::FallbackNearest {
                        days_difference: days,
                    },
                ));
            }
        }

        Err(FxError::RateUnavailable {
            from: from.clone(),
            to: to.clone(),
            date,
        })
    }

    /// Fetch from the provider chain and persist. Provider failures are
    /// logged and reported as `None` so resolution can continue. A failed
    /// write is logged and the fetched rate is still served.
    async fn fetch_and_store(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
        cancel: &CancellationToken,
    ) -> FxResult<Option<Resolution>> {
        let fetched = match self.providers.fetch_rate(from, to, date, cancel).await {
            Ok(rate) => rate,
            Err(e @ (FxError::CompositeProvider { .. } | FxError::Cancelled)) => {
                warn!(error = %e, "On-demand fetch failed");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let outcome = match self.store.store(fetched.clone()).await {
            Ok(outcome) => outcome,
            Err(e @ FxError::Storage(_)) => {
                // The fetched rate is sound; only persisting it failed.
                warn!(error = %e, source = %fetched.source, "Could not persist fetched rate");
                return Ok(Some(Resolution::from_record(
                    fetched,
                    ResolutionOutcome::FetchedOnDemand,
                )));
            }
            Err(e) => return Err(e),
        };

        match outcome {
            StoreOutcome::Rejected => {
                // A higher-priority record landed first; serve that one.
                let held = self.store.lookup_exact(from, to, date).await?;
                Ok(Some(match held {
                    Some(record) => Resolution::from_record(record, ResolutionOutcome::ExactDate),
                    None => Resolution::from_record(fetched, ResolutionOutcome::FetchedOnDemand),
                }))
            }
            _ => Ok(Some(Resolution::from_record(
                fetched,
                ResolutionOutcome::FetchedOnDemand,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::error::ProviderError;
    use crate::model::SourcePriority;
    use crate::provider::{MockRateProvider, RateProvider};
    use ratekeeper_common::FixedClock;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn today() -> NaiveDate {
        date(2024, 6, 15)
    }

    fn resolver_with(provider: Arc<MockRateProvider>, store: Arc<RateStore>) -> RateResolver {
        let chain = ProviderChain::new(
            vec![provider as Arc<dyn RateProvider>],
            RetryConfig {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                multiplier: 2,
                max_delay: Duration::from_millis(2),
            },
            Duration::from_millis(200),
        );
        RateResolver::new(store, Arc::new(chain), Arc::new(FixedClock(today())), 7, 30)
    }

    fn stored(from: CurrencyCode, to: CurrencyCode, on: NaiveDate, rate: Decimal) -> ExchangeRate {
        ExchangeRate::new(from, to, on, rate, "seed", SourcePriority::IMPORTED)
    }

    #[tokio::test]
    async fn test_same_currency_short_circuits() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        let resolver = resolver_with(provider.clone(), Arc::new(RateStore::in_memory()));

        let resolution = resolver
            .resolve(&CurrencyCode::ils(), &CurrencyCode::ils(), today(), true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolution.rate, Decimal::ONE);
        assert_eq!(resolution.outcome, ResolutionOutcome::SameCurrency);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_exact_hit_skips_providers() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        let store = Arc::new(RateStore::in_memory());
        store
            .store(stored(CurrencyCode::usd(), CurrencyCode::eur(), today(), dec!(0.92)))
            .await
            .unwrap();
        let resolver = resolver_with(provider.clone(), store);

        let resolution = resolver
            .resolve(&CurrencyCode::usd(), &CurrencyCode::eur(), today(), true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolution.outcome, ResolutionOutcome::ExactDate);
        assert_eq!(resolution.rate, dec!(0.92));
        assert_eq!(resolution.days_difference(), 0);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_recent_date_is_fetched_and_stored() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        provider.set_rate(CurrencyCode::usd(), CurrencyCode::ils(), dec!(3.7));
        let store = Arc::new(RateStore::in_memory());
        let resolver = resolver_with(provider.clone(), store.clone());
        let on = date(2024, 6, 12);

        let resolution = resolver
            .resolve(&CurrencyCode::usd(), &CurrencyCode::ils(), on, false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolution.outcome, ResolutionOutcome::FetchedOnDemand);
        assert_eq!(resolution.source(), Some("mock"));
        let persisted = store
            .lookup_exact(&CurrencyCode::usd(), &CurrencyCode::ils(), on)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.rate, dec!(3.7));
    }

    #[tokio::test]
    async fn test_freshness_boundary() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        provider.set_rate(CurrencyCode::usd(), CurrencyCode::eur(), dec!(0.9));
        let resolver = resolver_with(provider.clone(), Arc::new(RateStore::in_memory()));
        let cancel = CancellationToken::new();

        let seven_days = resolver
            .resolve(&CurrencyCode::usd(), &CurrencyCode::eur(), date(2024, 6, 8), false, &cancel)
            .await;
        assert!(seven_days.is_ok());
        assert_eq!(provider.calls(), 1);

        let eight_days = resolver
            .resolve(&CurrencyCode::usd(), &CurrencyCode::eur(), date(2024, 6, 7), false, &cancel)
            .await;
        assert!(matches!(eight_days, Err(FxError::RateUnavailable { .. })));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_future_date_is_never_fetched() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        provider.set_rate(CurrencyCode::usd(), CurrencyCode::eur(), dec!(0.9));
        let resolver = resolver_with(provider.clone(), Arc::new(RateStore::in_memory()));

        let result = resolver
            .resolve(&CurrencyCode::usd(), &CurrencyCode::eur(), date(2024, 6, 16), false, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(FxError::RateUnavailable { .. })));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_falls_back_to_nearest() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        provider.fail_with(ProviderError::Status { code: 503 });
        let store = Arc::new(RateStore::in_memory());
        store
            .store(stored(CurrencyCode::usd(), CurrencyCode::eur(), date(2024, 6, 10), dec!(0.93)))
            .await
            .unwrap();
        let resolver = resolver_with(provider.clone(), store);

        let resolution = resolver
            .resolve(&CurrencyCode::usd(), &CurrencyCode::eur(), date(2024, 6, 13), true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            resolution.outcome,
            ResolutionOutcome::FallbackNearest { days_difference: 3 }
        );
        assert_eq!(resolution.resolved_date, date(2024, 6, 10));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_fallback_disabled_is_unavailable() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        let store = Arc::new(RateStore::in_memory());
        store
            .store(stored(CurrencyCode::usd(), CurrencyCode::eur(), date(2024, 1, 10), dec!(0.93)))
            .await
            .unwrap();
        let resolver = resolver_with(provider, store);

        let result = resolver
            .resolve(&CurrencyCode::usd(), &CurrencyCode::eur(), date(2024, 1, 12), false, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(FxError::RateUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_manual_rate_outranks_provider() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        provider.set_rate(CurrencyCode::usd(), CurrencyCode::eur(), dec!(0.90));
        let store = Arc::new(RateStore::in_memory());
        let on = date(2024, 6, 14);
        store
            .store(ExchangeRate::new(
                CurrencyCode::usd(),
                CurrencyCode::eur(),
                on,
                dec!(0.95),
                "manual",
                SourcePriority::MANUAL,
            ))
            .await
            .unwrap();
        let resolver = resolver_with(provider.clone(), store);

        let resolution = resolver
            .resolve(&CurrencyCode::usd(), &CurrencyCode::eur(), on, true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolution.rate, dec!(0.95));
        assert_eq!(resolution.source(), Some("manual"));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_exact_record_is_not_used() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        let repo = Arc::new(crate::repository::InMemoryRateRepository::with_rates([
            stored(CurrencyCode::usd(), CurrencyCode::eur(), date(2024, 1, 10), Decimal::ZERO),
            stored(CurrencyCode::usd(), CurrencyCode::eur(), date(2024, 1, 9), dec!(0.91)),
        ]));
        let store = Arc::new(RateStore::new(repo));
        let resolver = resolver_with(provider, store);

        let resolution = resolver
            .resolve(&CurrencyCode::usd(), &CurrencyCode::eur(), date(2024, 1, 10), true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolution.rate, dec!(0.91));
        assert_eq!(resolution.days_difference(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_exact_record_uses_sound_inverse() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        let repo = Arc::new(crate::repository::InMemoryRateRepository::with_rates([
            stored(CurrencyCode::usd(), CurrencyCode::eur(), date(2024, 1, 10), Decimal::ZERO),
            stored(CurrencyCode::eur(), CurrencyCode::usd(), date(2024, 1, 10), dec!(1.25)),
        ]));
        let store = Arc::new(RateStore::new(repo));
        let resolver = resolver_with(provider.clone(), store);

        let resolution = resolver
            .resolve(&CurrencyCode::usd(), &CurrencyCode::eur(), date(2024, 1, 10), false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolution.outcome, ResolutionOutcome::ExactDate);
        assert_eq!(resolution.rate, dec!(0.8));
        assert_eq!(resolution.days_difference(), 0);
        assert_eq!(resolution.source(), Some("inverse-of:seed"));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_persist_still_serves_fetched_rate() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        provider.set_rate(CurrencyCode::usd(), CurrencyCode::eur(), dec!(0.92));
        let dir = tempfile::tempdir().unwrap();
        let repo = crate::repository::JsonFileRateRepository::open(dir.path().join("missing").join("rates.json"))
            .unwrap();
        let store = Arc::new(RateStore::new(Arc::new(repo)));
        let resolver = resolver_with(provider.clone(), store);

        let resolution = resolver
            .resolve(&CurrencyCode::usd(), &CurrencyCode::eur(), date(2024, 6, 14), false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolution.outcome, ResolutionOutcome::FetchedOnDemand);
        assert_eq!(resolution.rate, dec!(0.92));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_continues_to_fallback() {
        let provider = Arc::new(MockRateProvider::new("mock").with_delay(Duration::from_millis(100)));
        provider.set_rate(CurrencyCode::usd(), CurrencyCode::eur(), dec!(0.9));
        let store = Arc::new(RateStore::in_memory());
        store
            .store(stored(CurrencyCode::usd(), CurrencyCode::eur(), date(2024, 6, 13), dec!(0.88)))
            .await
            .unwrap();
        let resolver = resolver_with(provider, store);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let resolution = resolver
            .resolve(&CurrencyCode::usd(), &CurrencyCode::eur(), date(2024, 6, 14), true, &cancel)
            .await
            .unwrap();

        assert_eq!(resolution.rate, dec!(0.88));
        assert_eq!(resolution.days_difference(), 1);
    }
}
