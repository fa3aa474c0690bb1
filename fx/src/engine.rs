//! Conversion engine: validation, resolution, rounding and degraded mode.

use std::sync::Arc;

use futures::future::join_all;
use ratekeeper_common::{convert_amount, Clock, SystemClock};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::batch::{BatchFetchScheduler, BatchReport};
use crate::config::FxConfig;
use crate::conversion::{ConversionRequest, ConversionResult};
use crate::error::{FxError, FxResult};
use crate::model::RateKey;
use crate::provider::{ProviderChain, ProviderStats};
use crate::resolver::{RateResolver, ResolutionOutcome};
use crate::store::RateStore;

/// Engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub store_records: usize,
    pub provider: ProviderStats,
}

/// Converts amounts between currencies on a given date.
pub struct ConversionEngine {
    config: FxConfig,
    store: Arc<RateStore>,
    providers: Arc<ProviderChain>,
    resolver: RateResolver,
    scheduler: BatchFetchScheduler,
}

impl ConversionEngine {
    /// Create an engine over an existing store and provider chain.
    pub fn new(
        config: FxConfig,
        store: Arc<RateStore>,
        providers: Arc<ProviderChain>,
        clock: Arc<dyn Clock>,
    ) -> FxResult<Self> {
        config.validate()?;

        let resolver = RateResolver::with_config(&config, store.clone(), providers.clone(), clock.clone());
        let scheduler = BatchFetchScheduler::with_config(&config, store.clone(), providers.clone(), clock);

        Ok(Self {
            config,
            store,
            providers,
            resolver,
            scheduler,
        })
    }

    /// Engine with HTTP providers from `config` and the wall clock.
    pub fn from_config(config: FxConfig, store: Arc<RateStore>) -> FxResult<Self> {
        let providers = Arc::new(ProviderChain::from_config(&config)?);
        Self::new(config, store, providers, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &FxConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RateStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &BatchFetchScheduler {
        &self.scheduler
    }

    /// Convert without a caller-supplied cancellation token.
    pub async fn convert(&self, request: ConversionRequest) -> FxResult<ConversionResult> {
        self.convert_with_cancel(request, &CancellationToken::new()).await
    }

    /// Convert an amount. A cancelled token aborts any provider fetch, which
    /// then counts as a provider failure.
    #[instrument(skip_all, fields(
        from = %request.from,
        to = %request.to,
        date = %request.date,
        amount = %request.amount
    ))]
    pub async fn convert_with_cancel(
        &self,
        request: ConversionRequest,
        cancel: &CancellationToken,
    ) -> FxResult<ConversionResult> {
        self.validate(&request)?;

        let resolution = match self
            .resolver
            .resolve(&request.from, &request.to, request.date, request.allow_fallback, cancel)
            .await
        {
            Ok(resolution) => resolution,
            Err(e @ FxError::RateUnavailable { .. }) if request.allow_degraded => {
                warn!(error = %e, "No rate available; returning unconverted amount");
                return Ok(ConversionResult::degraded(&request));
            }
            Err(e) => return Err(e),
        };

        // Same-currency amounts pass through untouched.
        let converted = match resolution.outcome {
            ResolutionOutcome::SameCurrency => request.amount,
            _ => convert_amount(request.amount, resolution.rate, &request.to).ok_or_else(|| {
                FxError::Overflow {
                    amount: request.amount,
                    rate: resolution.rate,
                }
            })?,
        };

        let result = ConversionResult::resolved(&request, &resolution, converted);
        info!(
            converted = %result.converted_amount,
            rate = %resolution.rate,
            source = ?result.source,
            days_difference = result.days_difference,
            "Conversion completed"
        );
        Ok(result)
    }

    fn validate(&self, request: &ConversionRequest) -> FxResult<()> {
        if request.amount < Decimal::ZERO {
            return Err(FxError::InvalidAmount {
                amount: request.amount.to_string(),
            });
        }
        self.config.supported_currencies.ensure(&request.from)?;
        self.config.supported_currencies.ensure(&request.to)?;
        Ok(())
    }

    /// Convert many requests, prefetching missing recent rates in batches first.
    ///
    /// Results come back in input order.
    pub async fn convert_many(
        &self,
        requests: Vec<ConversionRequest>,
        cancel: &CancellationToken,
    ) -> Vec<FxResult<ConversionResult>> {
        let report = self.prefetch(&requests, cancel).await;
        if let Some(report) = report {
            info!(
                run_id = %report.run_id,
                stored = report.stored(),
                failed = report.failed(),
                "Prefetched rates for bulk conversion"
            );
        }

        join_all(requests.into_iter().map(|r| self.convert_with_cancel(r, cancel))).await
    }

    /// Batch-fetch the recent keys the store cannot answer yet.
    async fn prefetch(&self, requests: &[ConversionRequest], cancel: &CancellationToken) -> Option<BatchReport> {
        let mut missing = Vec::new();
        for request in requests {
            if request.from == request.to
                || self.validate(request).is_err()
                || !self.resolver.is_recent(request.date)
            {
                continue;
            }
            match self.store.lookup_exact(&request.from, &request.to, request.date).await {
                Ok(Some(_)) => {}
                _ => missing.push(RateKey::new(request.from.clone(), request.to.clone(), request.date)),
            }
        }

        if missing.is_empty() {
            return None;
        }
        Some(self.scheduler.run(missing, cancel).await)
    }

    /// Get engine statistics.
    pub async fn stats(&self) -> FxResult<EngineStats> {
        Ok(EngineStats {
            store_records: self.store.len().await?,
            provider: self.providers.stats(),
        })
    }
}
