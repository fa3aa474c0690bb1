//! Persistence substrate for exchange rates.
//!
//! The rate store only needs get/put by composite key plus a conditional
//! upsert. [`InMemoryRateRepository`] keeps everything in a `DashMap`;
//! [`JsonFileRateRepository`] adds a JSON snapshot on disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{FxError, FxResult};
use crate::model::{ExchangeRate, RateKey};

/// Result of a conditional upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No record existed for the key.
    Inserted,
    /// An existing record was replaced.
    Replaced,
    /// The predicate refused the write; the existing record stays.
    Rejected,
}

/// Decides whether an incoming record may replace the existing one (if any).
pub type AcceptFn<'a> = &'a (dyn Fn(Option<&ExchangeRate>) -> bool + Send + Sync);

/// Key-value persistence for exchange rates.
#[async_trait]
pub trait RateRepository: Send + Sync {
    /// Fetch the record stored under `key`.
    async fn get(&self, key: &RateKey) -> FxResult<Option<ExchangeRate>>;

    /// Unconditionally write `rate` under its key.
    async fn put(&self, rate: ExchangeRate) -> FxResult<()>;

    /// Write `rate` if `accept` approves of the existing record.
    ///
    /// The default does a get followed by a put and is not atomic;
    /// implementations that can do better should override it.
    async fn upsert_if(&self, rate: ExchangeRate, accept: AcceptFn<'_>) -> FxResult<UpsertOutcome> {
        let existing = self.get(&rate.key()).await?;
        if !accept(existing.as_ref()) {
            return Ok(UpsertOutcome::Rejected);
        }
        let outcome = if existing.is_some() {
            UpsertOutcome::Replaced
        } else {
            UpsertOutcome::Inserted
        };
        self.put(rate).await?;
        Ok(outcome)
    }

    /// Number of stored records.
    async fn len(&self) -> FxResult<usize>;

    /// Every stored record, in no particular order.
    async fn all(&self) -> FxResult<Vec<ExchangeRate>>;
}

/// Thread-safe in-memory repository.
#[derive(Debug, Default)]
pub struct InMemoryRateRepository {
    rates: DashMap<RateKey, ExchangeRate>,
}

impl InMemoryRateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with existing records, last one per key wins.
    pub fn with_rates(rates: impl IntoIterator<Item = ExchangeRate>) -> Self {
        let repo = Self::new();
        for rate in rates {
            repo.rates.insert(rate.key(), rate);
        }
        repo
    }

    fn upsert_sync(&self, rate: ExchangeRate, accept: AcceptFn<'_>) -> UpsertOutcome {
        // The entry guard holds the shard lock, so check and write are atomic per key.
        match self.rates.entry(rate.key()) {
            Entry::Occupied(mut occupied) => {
                if accept(Some(occupied.get())) {
                    occupied.insert(rate);
                    UpsertOutcome::Replaced
                } else {
                    UpsertOutcome::Rejected
                }
            }
            Entry::Vacant(vacant) => {
                if accept(None) {
                    vacant.insert(rate);
                    UpsertOutcome::Inserted
                } else {
                    UpsertOutcome::Rejected
                }
            }
        }
    }

    fn snapshot(&self) -> Vec<ExchangeRate> {
        self.rates.iter().map(|e| e.value().clone()).collect()
    }
}

#[async_trait]
impl RateRepository for InMemoryRateRepository {
    async fn get(&self, key: &RateKey) -> FxResult<Option<ExchangeRate>> {
        Ok(self.rates.get(key).map(|r| r.clone()))
    }

    async fn put(&self, rate: ExchangeRate) -> FxResult<()> {
        self.rates.insert(rate.key(), rate);
        Ok(())
    }

    async fn upsert_if(&self, rate: ExchangeRate, accept: AcceptFn<'_>) -> FxResult<UpsertOutcome> {
        Ok(self.upsert_sync(rate, accept))
    }

    async fn len(&self) -> FxResult<usize> {
        Ok(self.rates.len())
    }

    async fn all(&self) -> FxResult<Vec<ExchangeRate>> {
        Ok(self.snapshot())
    }
}

/// In-memory repository mirrored to a JSON file.
///
/// The whole snapshot is rewritten after every accepted write, through a
/// temporary file and a rename so a crash never leaves a truncated file.
pub struct JsonFileRateRepository {
    path: PathBuf,
    inner: InMemoryRateRepository,
    /// Serializes snapshot writes so two flushes never interleave on disk.
    flush_lock: Mutex<()>,
}

impl JsonFileRateRepository {
    /// Open `path`, loading existing records. A missing file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> FxResult<Self> {
        let path = path.into();
        let rates: Vec<ExchangeRate> = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| FxError::Storage(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(FxError::Storage(format!("{}: {}", path.display(), e))),
        };

        info!(path = %path.display(), records = rates.len(), "Opened rate file");

        Ok(Self {
            path,
            inner: InMemoryRateRepository::with_rates(rates),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self) -> FxResult<()> {
        // Held across the write; the snapshot is taken under it so the last
        // flush to finish always carries every accepted record.
        let _guard = self.flush_lock.lock().await;

        let mut rates = self.inner.snapshot();
        rates.sort_by(|a, b| a.key().cmp(&b.key()));
        let records = rates.len();

        let json = serde_json::to_vec_pretty(&rates).map_err(|e| FxError::Storage(e.to_string()))?;
        let path = self.path.clone();
        let tmp = path.with_extension("json.tmp");

        tokio::task::spawn_blocking(move || {
            std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, &path))
        })
        .await
        .map_err(|e| FxError::Storage(format!("flush task failed: {}", e)))?
        .map_err(|e| FxError::Storage(format!("{}: {}", self.path.display(), e)))?;

        debug!(path = %self.path.display(), records, "Flushed rate file");
        Ok(())
    }
}

#[async_trait]
impl RateRepository for JsonFileRateRepository {
    async fn get(&self, key: &RateKey) -> FxResult<Option<ExchangeRate>> {
        self.inner.get(key).await
    }

    async fn put(&self, rate: ExchangeRate) -> FxResult<()> {
        self.inner.put(rate).await?;
        self.flush().await
    }

    async fn upsert_if(&self, rate: ExchangeRate, accept: AcceptFn<'_>) -> FxResult<UpsertOutcome> {
        let outcome = self.inner.upsert_sync(rate, accept);
        if outcome != UpsertOutcome::Rejected {
            self.flush().await?;
        }
        Ok(outcome)
    }

    async fn len(&self) -> FxResult<usize> {
        self.inner.len().await
    }

    async fn all(&self) -> FxResult<Vec<ExchangeRate>> {
        self.inner.all().await
    }
}
