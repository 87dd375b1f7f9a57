//! Source adapters and the source registry
//!
//! Each exchange is reached through a [`QuoteFeed`] implementation. The
//! registry carries the per-source fault flag, fee schedule and rate limit
//! consulted by the trade engine and the orchestrator.

mod rest;
mod sim;

pub use rest::RestTickerFeed;
pub use sim::SimulatedFeed;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::config::{decimal_from_config, AppConfig};
use crate::error::FeedError;
use crate::types::{Candle, Pair, Quote, Source};

/// Fees charged by one exchange
#[derive(Debug, Clone)]
pub struct FeeSchedule {
    /// Deposit + withdraw flat fee, charged once per leg (USD)
    pub fixed_usd: Decimal,
    /// Taker fee percentage per fill
    pub taker_pct: Decimal,
}

/// Adapter over one exchange's market-data endpoints
#[async_trait]
pub trait QuoteFeed: Send + Sync {
    fn source(&self) -> Source;

    /// Fetch the latest quotes for every pair this feed serves.
    async fn fetch_quotes(&self) -> Result<Vec<Quote>, FeedError>;

    /// Fetch up to `limit` recent candles for one pair.
    async fn fetch_candles(
        &self,
        pair: &Pair,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError>;
}

struct RegistryEntry {
    faulty: AtomicBool,
    fees: FeeSchedule,
    rate_limit_per_min: u32,
}

/// Per-source operational state shared across cycles
pub struct SourceRegistry {
    entries: HashMap<Source, RegistryEntry>,
}

impl SourceRegistry {
    pub fn from_config(config: &AppConfig) -> Self {
        let entries = config
            .sources
            .enabled()
            .into_iter()
            .map(|source| {
                let settings = config.sources.get(source);
                (
                    source,
                    RegistryEntry {
                        faulty: AtomicBool::new(false),
                        fees: FeeSchedule {
                            fixed_usd: decimal_from_config(settings.fixed_fee_usd),
                            taker_pct: decimal_from_config(settings.taker_fee_pct),
                        },
                        rate_limit_per_min: settings.rate_limit_per_min.max(1),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Registry for tests: flat fees, uniform rate limit
    pub fn with_uniform_fees(sources: &[Source], fees: FeeSchedule, rate_limit_per_min: u32) -> Self {
        let entries = sources
            .iter()
            .map(|source| {
                (
                    *source,
                    RegistryEntry {
                        faulty: AtomicBool::new(false),
                        fees: fees.clone(),
                        rate_limit_per_min: rate_limit_per_min.max(1),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub fn is_faulty(&self, source: Source) -> bool {
        self.entries
            .get(&source)
            .map(|e| e.faulty.load(Ordering::Relaxed))
            .unwrap_or(true)
    }

    pub fn set_faulty(&self, source: Source, faulty: bool) {
        if let Some(entry) = self.entries.get(&source) {
            entry.faulty.store(faulty, Ordering::Relaxed);
        }
    }

    pub fn fees(&self, source: Source) -> FeeSchedule {
        self.entries
            .get(&source)
            .map(|e| e.fees.clone())
            .unwrap_or(FeeSchedule {
                fixed_usd: Decimal::ZERO,
                taker_pct: Decimal::ZERO,
            })
    }

    pub fn rate_limit(&self, source: Source) -> u32 {
        self.entries
            .get(&source)
            .map(|e| e.rate_limit_per_min)
            .unwrap_or(60)
    }

    pub fn sources(&self) -> Vec<Source> {
        let mut sources: Vec<Source> = self.entries.keys().copied().collect();
        sources.sort_by_key(|s| Source::ALL.iter().position(|x| x == s));
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fault_flag_roundtrip() {
        let registry = SourceRegistry::with_uniform_fees(
            &[Source::Binance],
            FeeSchedule {
                fixed_usd: Decimal::ZERO,
                taker_pct: dec!(0.1),
            },
            60,
        );

        assert!(!registry.is_faulty(Source::Binance));
        registry.set_faulty(Source::Binance, true);
        assert!(registry.is_faulty(Source::Binance));
        registry.set_faulty(Source::Binance, false);
        assert!(!registry.is_faulty(Source::Binance));
    }

    #[test]
    fn test_unknown_source_is_faulty() {
        let registry = SourceRegistry::with_uniform_fees(
            &[Source::Binance],
            FeeSchedule {
                fixed_usd: Decimal::ZERO,
                taker_pct: Decimal::ZERO,
            },
            60,
        );
        assert!(registry.is_faulty(Source::Kraken));
        assert_eq!(registry.rate_limit(Source::Kraken), 60);
    }
}
