//! Live quote store
//!
//! Holds the latest top-of-book quote per (source, pair). The store is
//! sharded by source (one lock per source, allocated up front) so that
//! concurrent polling cycles for different sources never contend.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::types::{Pair, Quote, Source};

pub struct QuoteStore {
    shards: HashMap<Source, RwLock<HashMap<Pair, Quote>>>,
}

impl QuoteStore {
    /// Build a store with one independent shard per configured source.
    pub fn new(sources: &[Source]) -> Self {
        let shards = sources
            .iter()
            .map(|s| (*s, RwLock::new(HashMap::new())))
            .collect();
        Self { shards }
    }

    /// Replace quotes whose bid or ask moved, carrying the previous
    /// bid/ask into the new record. Quotes with unchanged prices are left
    /// untouched so their observation time keeps aging toward staleness.
    pub fn update(&self, source: Source, quotes: Vec<Quote>) {
        if quotes.is_empty() {
            return;
        }
        let Some(shard) = self.shards.get(&source) else {
            debug!(source = %source, "Dropping quotes for unregistered source");
            return;
        };

        let mut table = shard.write().unwrap();
        for mut incoming in quotes {
            if let Some(existing) = table.get(&incoming.pair) {
                if !existing.price_changed(&incoming) {
                    continue;
                }
                incoming.prev_bid = Some(existing.bid);
                incoming.prev_ask = Some(existing.ask);
            }
            table.insert(incoming.pair.clone(), incoming);
        }
    }

    /// Point lookup. Cross-cycle visibility lag is handled by the caller
    /// via [`quote_with_retry`], not here.
    pub fn get(&self, source: Source, pair: &Pair) -> Option<Quote> {
        self.shards
            .get(&source)
            .and_then(|shard| shard.read().unwrap().get(pair).cloned())
    }

    /// All quotes currently held for one source.
    pub fn snapshot(&self, source: Source) -> Vec<Quote> {
        self.shards
            .get(&source)
            .map(|shard| shard.read().unwrap().values().cloned().collect())
            .unwrap_or_default()
    }

    /// Latch the stored quote's stale flag once its age reaches the
    /// threshold, returning the resulting flag. Returns `true` for a
    /// missing quote: absent data is never fresh.
    pub fn mark_stale_if_expired(&self, source: Source, pair: &Pair, threshold_ms: i64) -> bool {
        let Some(shard) = self.shards.get(&source) else {
            return true;
        };
        let mut table = shard.write().unwrap();
        match table.get_mut(pair) {
            Some(quote) => quote.mark_stale_if_expired(threshold_ms, Utc::now().timestamp_millis()),
            None => true,
        }
    }
}

/// Bounded-retry lookup for consumers that expect a just-published quote.
///
/// A quote published by another source's cycle may not be visible yet when
/// this cycle reads; a few short retries separate that benign lag from a
/// genuinely missing quote.
pub async fn quote_with_retry(
    store: &QuoteStore,
    source: Source,
    pair: &Pair,
    retries: u32,
    delay: Duration,
) -> Option<Quote> {
    for attempt in 0..=retries {
        if let Some(quote) = store.get(source, pair) {
            return Some(quote);
        }
        if attempt < retries {
            tokio::time::sleep(delay).await;
        }
    }
    debug!(source = %source, pair = %pair, retries, "Quote not visible after retries");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn quote(source: Source, bid: rust_decimal::Decimal, ask: rust_decimal::Decimal) -> Quote {
        Quote::new(source, Pair::new("BTC", "USDT"), bid, ask, bid)
    }

    #[test]
    fn test_update_carries_previous_prices() {
        let store = QuoteStore::new(&[Source::Binance]);
        let pair = Pair::new("BTC", "USDT");

        store.update(Source::Binance, vec![quote(Source::Binance, dec!(100), dec!(101))]);
        store.update(Source::Binance, vec![quote(Source::Binance, dec!(102), dec!(103))]);

        let stored = store.get(Source::Binance, &pair).unwrap();
        assert_eq!(stored.bid, dec!(102));
        assert_eq!(stored.prev_bid, Some(dec!(100)));
        assert_eq!(stored.prev_ask, Some(dec!(101)));
    }

    #[test]
    fn test_unchanged_quote_left_untouched() {
        let store = QuoteStore::new(&[Source::Binance]);
        let pair = Pair::new("BTC", "USDT");

        let mut first = quote(Source::Binance, dec!(100), dec!(101));
        first.time_ms = 1_000;
        store.update(Source::Binance, vec![first]);

        let mut repeat = quote(Source::Binance, dec!(100), dec!(101));
        repeat.time_ms = 9_000;
        store.update(Source::Binance, vec![repeat]);

        // Same prices: the original observation time survives
        let stored = store.get(Source::Binance, &pair).unwrap();
        assert_eq!(stored.time_ms, 1_000);
        assert_eq!(stored.prev_bid, None);
    }

    #[test]
    fn test_update_clears_staleness() {
        let store = QuoteStore::new(&[Source::Binance]);
        let pair = Pair::new("BTC", "USDT");

        let mut old = quote(Source::Binance, dec!(100), dec!(101));
        old.time_ms = 0;
        store.update(Source::Binance, vec![old]);
        assert!(store.mark_stale_if_expired(Source::Binance, &pair, 1));

        store.update(Source::Binance, vec![quote(Source::Binance, dec!(100), dec!(102))]);
        let stored = store.get(Source::Binance, &pair).unwrap();
        assert!(!stored.stale);
    }

    #[test]
    fn test_missing_quote_is_stale() {
        let store = QuoteStore::new(&[Source::Binance]);
        assert!(store.mark_stale_if_expired(Source::Binance, &Pair::new("ETH", "USDT"), 1_000));
    }

    #[test]
    fn test_empty_update_is_noop() {
        let store = QuoteStore::new(&[Source::Binance]);
        store.update(Source::Binance, Vec::new());
        assert!(store.snapshot(Source::Binance).is_empty());
    }

    #[tokio::test]
    async fn test_quote_with_retry_gives_up() {
        let store = QuoteStore::new(&[Source::Binance]);
        let pair = Pair::new("BTC", "USDT");
        let found = quote_with_retry(
            &store,
            Source::Binance,
            &pair,
            2,
            Duration::from_millis(1),
        )
        .await;
        assert!(found.is_none());
    }
}
