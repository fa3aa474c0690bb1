//! Ratekeeper FX Engine
//!
//! Historical exchange rate resolution and currency conversion.
//!
//! # Features
//!
//! - Persistent rate store with inverse derivation and priority-aware upserts
//! - Ordered provider chain with retry, backoff and cancellation
//! - On-demand fetching for recent dates, nearest-date fallback for older ones
//! - Rate-limited batch fetching for bulk syncs
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ratekeeper_fx::{ConversionEngine, ConversionRequest, FxConfig, RateStore};
//! use ratekeeper_common::CurrencyCode;
//!
//! let engine = ConversionEngine::from_config(FxConfig::from_env()?, Arc::new(RateStore::in_memory()))?;
//!
//! let request = ConversionRequest::new(dec!(60000), CurrencyCode::ils(), CurrencyCode::eur(), date);
//! let result = engine.convert(request).await?;
//! ```

pub mod batch;
pub mod config;
pub mod conversion;
pub mod engine;
pub mod error;
pub mod model;
pub mod provider;
pub mod repository;
pub mod resolver;
pub mod store;

pub use batch::{BatchFetchScheduler, BatchReport, FetchOutcome};
pub use config::FxConfig;
pub use conversion::{ConversionRequest, ConversionResult, ConversionSource};
pub use engine::{ConversionEngine, EngineStats};
pub use error::{FxError, FxResult, ProviderError};
pub use model::{ExchangeRate, RateKey, SourcePriority};
pub use provider::{ProviderChain, RateProvider};
pub use repository::{InMemoryRateRepository, JsonFileRateRepository, RateRepository};
pub use resolver::{RateResolver, Resolution, ResolutionOutcome};
pub use store::{RateStore, StoreOutcome};
