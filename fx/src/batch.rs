//! Rate-limited bulk fetching.
//!
//! Keys are fetched in fixed-size batches, one at a time within a batch,
//! with a pause between batches. Every success is persisted before
//! [`BatchFetchScheduler::run`] returns.

use std::collections::BTreeSet;
use std::sync::Arc;

use ratekeeper_common::Clock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{BatchConfig, FxConfig};
use crate::error::FxError;
use crate::model::RateKey;
use crate::provider::ProviderChain;
use crate::store::{RateStore, StoreOutcome};

/// What happened to one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum FetchOutcome {
    Stored,
    /// Fetched, but a higher-priority record was already stored.
    Rejected,
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyReport {
    pub key: RateKey,
    pub outcome: FetchOutcome,
}

/// Per-key results of one scheduler run, in key order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub outcomes: Vec<KeyReport>,
}

impl BatchReport {
    fn count(&self, predicate: impl Fn(&FetchOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|r| predicate(&r.outcome)).count()
    }

    pub fn stored(&self) -> usize {
        self.count(|o| matches!(o, FetchOutcome::Stored))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, FetchOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, FetchOutcome::Skipped(_)))
    }

    pub fn outcome_for(&self, key: &RateKey) -> Option<&FetchOutcome> {
        self.outcomes.iter().find(|r| &r.key == key).map(|r| &r.outcome)
    }
}

/// Groups pending fetches into batches that respect provider rate limits.
pub struct BatchFetchScheduler {
    store: Arc<RateStore>,
    providers: Arc<ProviderChain>,
    clock: Arc<dyn Clock>,
    recent_date_threshold_days: u32,
    config: BatchConfig,
}

impl BatchFetchScheduler {
    pub fn new(
        store: Arc<RateStore>,
        providers: Arc<ProviderChain>,
        clock: Arc<dyn Clock>,
        recent_date_threshold_days: u32,
        config: BatchConfig,
    ) -> Self {
        Self {
            store,
            providers,
            clock,
            recent_date_threshold_days,
            config,
        }
    }

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
            config.batch.clone(),
        )
    }

    fn skip_reason(&self, key: &RateKey) -> Option<String> {
        if key.from == key.to {
            return Some("same currency".to_string());
        }
        let age = self.clock.age_of(key.date);
        if age < 0 {
            return Some("future date".to_string());
        }
        if age > i64::from(self.recent_date_threshold_days) {
            return Some(format!("{} days old; outside freshness window", age));
        }
        None
    }

    /// Fetch and store every eligible key.
    ///
    /// Duplicate keys are collapsed. A failing key never stops the others;
    /// cancellation marks every key not yet attempted as failed.
    #[instrument(skip_all, fields(keys = tracing::field::Empty))]
    pub async fn run(&self, keys: impl IntoIterator<Item = RateKey>, cancel: &CancellationToken) -> BatchReport {
        let run_id = Uuid::now_v7();
        let keys: BTreeSet<RateKey> = keys.into_iter().collect();
        tracing::Span::current().record("keys", keys.len());

        let mut outcomes = Vec::with_capacity(keys.len());
        let mut pending = Vec::new();
        for key in keys {
            match self.skip_reason(&key) {
                Some(reason) => {
                    debug!(key = %key, reason = %reason, "Skipping key");
                    outcomes.push(KeyReport {
                        key,
                        outcome: FetchOutcome::Skipped(reason),
                    });
                }
                None => pending.push(key),
            }
        }

        let batch_size = self.config.batch_size.max(1);
        let batch_count = pending.len().div_ceil(batch_size);
        info!(run_id = %run_id, pending = pending.len(), batches = batch_count, "Starting batch fetch");

        for (index, batch) in pending.chunks(batch_size).enumerate() {
            if index > 0 && !cancel.is_cancelled() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.inter_batch_delay) => {}
                }
            }

            for key in batch {
                let outcome = if cancel.is_cancelled() {
                    FetchOutcome::Failed("cancelled".to_string())
                } else {
                    self.fetch_one(key, cancel).await
                };
                outcomes.push(KeyReport {
                    key: key.clone(),
                    outcome,
                });
            }
        }

        outcomes.sort_by(|a, b| a.key.cmp(&b.key));
        let report = BatchReport { run_id, outcomes };
        info!(
            run_id = %run_id,
            stored = report.stored(),
            failed = report.failed(),
            skipped = report.skipped(),
            "Batch fetch finished"
        );
        report
    }

    async fn fetch_one(&self, key: &RateKey, cancel: &CancellationToken) -> FetchOutcome {
        let fetched = match self.providers.fetch_rate(&key.from, &key.to, key.date, cancel).await {
            Ok(rate) => rate,
            Err(FxError::Cancelled) => return FetchOutcome::Failed("cancelled".to_string()),
            Err(e) => {
                warn!(key = %key, error = %e, "Batch fetch failed");
                return FetchOutcome::Failed(e.to_string());
            }
        };

        match self.store.store(fetched).await {
            Ok(StoreOutcome::Rejected) => FetchOutcome::Rejected,
            Ok(_) => FetchOutcome::Stored,
            Err(e) => {
                warn!(key = %key, error = %e, "Could not store fetched rate");
                FetchOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::error::ProviderError;
    use crate::model::{ExchangeRate, SourcePriority};
    use crate::provider::{MockRateProvider, RateProvider};
    use chrono::NaiveDate;
    use ratekeeper_common::{CurrencyCode, FixedClock};
    use rust_decimal_macros::dec;
    use std::time::{Duration, Instant};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    fn key(from: CurrencyCode, to: CurrencyCode, d: u32) -> RateKey {
        RateKey::new(from, to, day(d))
    }

    fn scheduler(
        provider: Arc<MockRateProvider>,
        store: Arc<RateStore>,
        batch_size: usize,
        delay: Duration,
    ) -> BatchFetchScheduler {
        let chain = ProviderChain::new(
            vec![provider as Arc<dyn RateProvider>],
            RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            },
            Duration::from_millis(200),
        );
        BatchFetchScheduler::new(
            store,
            Arc::new(chain),
            Arc::new(FixedClock(day(15))),
            7,
            BatchConfig {
                batch_size,
                inter_batch_delay: delay,
            },
        )
    }

    #[tokio::test]
    async fn test_successes_are_stored_before_return() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        provider.set_rate(CurrencyCode::usd(), CurrencyCode::eur(), dec!(0.92));
        provider.set_rate(CurrencyCode::ils(), CurrencyCode::eur(), dec!(0.25));
        let store = Arc::new(RateStore::in_memory());
        let scheduler = scheduler(provider, store.clone(), 3, Duration::from_millis(1));

        let report = scheduler
            .run(
                vec![
                    key(CurrencyCode::usd(), CurrencyCode::eur(), 14),
                    key(CurrencyCode::ils(), CurrencyCode::eur(), 14),
                    key(CurrencyCode::usd(), CurrencyCode::eur(), 14),
                ],
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.stored(), 2);
        let stored = store
            .lookup_exact(&CurrencyCode::ils(), &CurrencyCode::eur(), day(14))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.rate, dec!(0.25));
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_key() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        provider.set_rate(CurrencyCode::usd(), CurrencyCode::eur(), dec!(0.92));
        provider.set_rate(CurrencyCode::gbp(), CurrencyCode::eur(), dec!(1.17));
        let store = Arc::new(RateStore::in_memory());
        let scheduler = scheduler(provider, store, 3, Duration::from_millis(1));
        let missing = key(CurrencyCode::cad(), CurrencyCode::eur(), 14);

        let report = scheduler
            .run(
                vec![
                    key(CurrencyCode::usd(), CurrencyCode::eur(), 14),
                    missing.clone(),
                    key(CurrencyCode::gbp(), CurrencyCode::eur(), 14),
                ],
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.stored(), 2);
        assert_eq!(report.failed(), 1);
        assert!(matches!(report.outcome_for(&missing), Some(FetchOutcome::Failed(_))));
    }

    #[tokio::test]
    async fn test_stale_and_same_currency_keys_are_skipped() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        provider.set_rate(CurrencyCode::usd(), CurrencyCode::eur(), dec!(0.92));
        let scheduler = scheduler(provider.clone(), Arc::new(RateStore::in_memory()), 3, Duration::ZERO);

        let report = scheduler
            .run(
                vec![
                    key(CurrencyCode::usd(), CurrencyCode::eur(), 7),
                    key(CurrencyCode::usd(), CurrencyCode::eur(), 16),
                    key(CurrencyCode::usd(), CurrencyCode::usd(), 14),
                ],
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.skipped(), 3);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_inter_batch_delay_applies_between_batches() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        provider.set_rate(CurrencyCode::usd(), CurrencyCode::eur(), dec!(0.92));
        let scheduler = scheduler(provider.clone(), Arc::new(RateStore::in_memory()), 2, Duration::from_millis(50));
        let keys: Vec<_> = (10..15).map(|d| key(CurrencyCode::usd(), CurrencyCode::eur(), d)).collect();

        let started = Instant::now();
        let report = scheduler.run(keys, &CancellationToken::new()).await;

        // Five keys in batches of two: three batches, two pauses.
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(report.stored(), 5);
        assert_eq!(provider.calls(), 5);
    }

    #[tokio::test]
    async fn test_higher_priority_record_is_kept() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        provider.set_rate(CurrencyCode::usd(), CurrencyCode::eur(), dec!(0.92));
        let store = Arc::new(RateStore::in_memory());
        store
            .store(ExchangeRate::new(
                CurrencyCode::usd(),
                CurrencyCode::eur(),
                day(14),
                dec!(0.95),
                "manual",
                SourcePriority::MANUAL,
            ))
            .await
            .unwrap();
        let scheduler = scheduler(provider, store.clone(), 3, Duration::ZERO);
        let target = key(CurrencyCode::usd(), CurrencyCode::eur(), 14);

        let report = scheduler.run(vec![target.clone()], &CancellationToken::new()).await;

        assert_eq!(report.outcome_for(&target), Some(&FetchOutcome::Rejected));
        assert_eq!(store.get_raw(&target).await.unwrap().unwrap().rate, dec!(0.95));
    }

    #[tokio::test]
    async fn test_cancellation_fails_remaining_keys() {
        let provider = Arc::new(MockRateProvider::new("mock"));
        provider.fail_with(ProviderError::Timeout);
        let scheduler = scheduler(provider.clone(), Arc::new(RateStore::in_memory()), 1, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = scheduler
            .run(
                vec![
                    key(CurrencyCode::usd(), CurrencyCode::eur(), 13),
                    key(CurrencyCode::usd(), CurrencyCode::eur(), 14),
                ],
                &cancel,
            )
            .await;

        assert_eq!(report.failed(), 2);
        assert!(report
            .outcomes
            .iter()
            .all(|r| r.outcome == FetchOutcome::Failed("cancelled".to_string())));
        assert_eq!(provider.calls(), 0);
    }
}
