//! Rate store: exact, inverse-derived and nearest-date lookups over a
//! [`RateRepository`], plus the priority-aware upsert.

use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use ratekeeper_common::CurrencyCode;
use tracing::{debug, info, warn};

use crate::error::{FxError, FxResult};
use crate::model::{ExchangeRate, RateKey};
use crate::repository::{InMemoryRateRepository, RateRepository, UpsertOutcome};

/// What a call to [`RateStore::store`] did.
pub type StoreOutcome = UpsertOutcome;

/// Shared handle to the persisted rates.
pub struct RateStore {
    repo: Arc<dyn RateRepository>,
}

impl RateStore {
    pub fn new(repo: Arc<dyn RateRepository>) -> Self {
        Self { repo }
    }

    /// A store backed by a fresh in-memory repository.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryRateRepository::new()))
    }

    /// Exact-date lookup, falling back to the inverse of the opposite direction.
    ///
    /// A corrupt direct record (non-positive rate) is passed over in favour of a
    /// sound inverse. [`FxError::StorageIntegrity`] is returned only when no
    /// usable record exists for the date. Synthesized inverses are never written back.
    pub async fn lookup_exact(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
    ) -> FxResult<Option<ExchangeRate>> {
        let key = RateKey::new(from.clone(), to.clone(), date);
        let mut corrupt = None;

        if let Some(direct) = self.repo.get(&key).await? {
            match direct.validate() {
                Ok(()) => {
                    debug!(key = %key, source = %direct.source, "Exact hit");
                    return Ok(Some(direct));
                }
                Err(e) => {
                    warn!(key = %key, rate = %direct.rate, "Corrupt direct rate; trying inverse");
                    corrupt = Some(e);
                }
            }
        }

        if let Some(inverse) = self.repo.get(&key.inverse()).await? {
            match inverse.inverted() {
                Ok(derived) => {
                    debug!(key = %key, source = %derived.source, "Exact hit via inverse");
                    return Ok(Some(derived));
                }
                Err(e) => {
                    corrupt.get_or_insert(e);
                }
            }
        }

        match corrupt {
            Some(e) => Err(e),
            None => {
                debug!(key = %key, "Exact miss");
                Ok(None)
            }
        }
    }

    /// Closest rate within `max_days` (inclusive) of `date`, with its distance in days.
    ///
    /// Offsets are scanned outward from zero; at each offset the earlier date is
    /// tried before the later one, so equidistant candidates resolve to the
    /// earlier date. Corrupt candidates are skipped.
    pub async fn lookup_nearest(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
        max_days: u32,
    ) -> FxResult<Option<(ExchangeRate, u32)>> {
        let key = RateKey::new(from.clone(), to.clone(), date);

        for offset in 0..=max_days {
            let delta = Duration::days(i64::from(offset));
            let earlier = date.checked_sub_signed(delta);
            let later = if offset == 0 {
                None
            } else {
                date.checked_add_signed(delta)
            };

            for candidate in [earlier, later].into_iter().flatten() {
                if let Some(rate) = self.usable_on(&key.on(candidate)).await? {
                    debug!(key = %key, found = %candidate, days = offset, "Nearest hit");
                    return Ok(Some((rate, offset)));
                }
            }
        }

        debug!(key = %key, max_days, "No rate within window");
        Ok(None)
    }

    /// Exact lookup for one candidate date, treating corrupt records as a miss.
    async fn usable_on(&self, key: &RateKey) -> FxResult<Option<ExchangeRate>> {
        match self.lookup_exact(&key.from, &key.to, key.date).await {
            Err(FxError::StorageIntegrity { key, rate }) => {
                warn!(key = %key, rate = %rate, "Skipping corrupt rate during nearest search");
                Ok(None)
            }
            other => other,
        }
    }

    /// Priority-aware idempotent upsert.
    ///
    /// The write is a no-op when the existing record has strictly higher
    /// priority; otherwise the incoming record replaces it.
    pub async fn store(&self, rate: ExchangeRate) -> FxResult<StoreOutcome> {
        rate.validate()?;

        let key = rate.key();
        let incoming = rate.priority;
        let source = rate.source.clone();
        let accept = move |existing: Option<&ExchangeRate>| match existing {
            Some(current) => current.priority <= incoming,
            None => true,
        };

        let outcome = self.repo.upsert_if(rate, &accept).await?;

        match outcome {
            UpsertOutcome::Rejected => {
                debug!(key = %key, source = %source, priority = %incoming, "Kept higher-priority rate");
            }
            _ => {
                info!(key = %key, source = %source, priority = %incoming, outcome = ?outcome, "Stored rate");
            }
        }

        Ok(outcome)
    }

    /// Raw record under `key`, without inverse derivation or validation.
    pub async fn get_raw(&self, key: &RateKey) -> FxResult<Option<ExchangeRate>> {
        self.repo.get(key).await
    }

    pub async fn len(&self) -> FxResult<usize> {
        self.repo.len().await
    }

    pub async fn is_empty(&self) -> FxResult<bool> {
        Ok(self.len().await? == 0)
    }
}

impl Default for RateStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
