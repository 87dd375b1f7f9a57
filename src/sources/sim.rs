//! Deterministic simulated feed
//!
//! A seeded random walk around a configured mid price, used for dry runs
//! and tests. Two feeds built with the same seed produce identical quote
//! streams, which keeps engine-level tests reproducible.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

use crate::error::FeedError;
use crate::sources::QuoteFeed;
use crate::types::{round_price, Candle, Pair, Quote, Source};

/// Half-spread applied around the simulated mid, in basis points
const HALF_SPREAD_BPS: f64 = 2.0;

struct SimState {
    rng: StdRng,
    mids: HashMap<Pair, f64>,
}

pub struct SimulatedFeed {
    source: Source,
    seed: u64,
    volatility_bps: f64,
    state: Mutex<SimState>,
}

impl SimulatedFeed {
    pub fn new(
        source: Source,
        pairs: Vec<Pair>,
        seed: u64,
        volatility_bps: f64,
        start_mid: f64,
    ) -> Self {
        let mids = pairs.into_iter().map(|p| (p, start_mid)).collect();
        Self {
            source,
            seed,
            volatility_bps,
            state: Mutex::new(SimState {
                rng: StdRng::seed_from_u64(seed),
                mids,
            }),
        }
    }

    fn to_quote(&self, pair: &Pair, mid: f64) -> Quote {
        let half_spread = mid * HALF_SPREAD_BPS / 10_000.0;
        let bid = decimal(mid - half_spread);
        let ask = decimal(mid + half_spread);
        Quote::new(self.source, pair.clone(), bid, ask, decimal(mid))
    }
}

fn decimal(value: f64) -> Decimal {
    round_price(Decimal::try_from(value).unwrap_or(Decimal::ZERO))
}

#[async_trait]
impl QuoteFeed for SimulatedFeed {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch_quotes(&self) -> Result<Vec<Quote>, FeedError> {
        let mut state = self.state.lock().unwrap();
        let step_bound = self.volatility_bps / 10_000.0;
        let mut quotes = Vec::with_capacity(state.mids.len());

        let mut pairs: Vec<Pair> = state.mids.keys().cloned().collect();
        pairs.sort_by(|a, b| a.to_string().cmp(&b.to_string()));

        for pair in pairs {
            let step = state.rng.gen_range(-step_bound..=step_bound);
            let mid = state.mids.get_mut(&pair).expect("pair registered");
            *mid *= 1.0 + step;
            let mid = *mid;
            quotes.push(self.to_quote(&pair, mid));
        }
        Ok(quotes)
    }

    async fn fetch_candles(
        &self,
        pair: &Pair,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        let current_mid = {
            let state = self.state.lock().unwrap();
            *state
                .mids
                .get(pair)
                .ok_or_else(|| FeedError::UnknownPair(pair.to_string()))?
        };

        // A candle history independent of the live walk but stable per seed
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(pair.base.len() as u64));
        let step_bound = self.volatility_bps / 10_000.0;
        let now_ms = Utc::now().timestamp_millis();
        let mut mid = current_mid;

        let mut candles: Vec<Candle> = (0..limit)
            .map(|i| {
                let step = rng.gen_range(-step_bound..=step_bound);
                let open = mid;
                mid *= 1.0 + step;
                let close = mid;
                Candle {
                    source: self.source,
                    pair: pair.clone(),
                    open: decimal(open),
                    high: decimal(open.max(close)),
                    low: decimal(open.min(close)),
                    close: decimal(close),
                    volume: decimal(1.0),
                    open_time_ms: now_ms - ((limit - i) as i64) * 60_000,
                    timeframe: timeframe.to_string(),
                }
            })
            .collect();
        candles.sort_by_key(|c| c.open_time_ms);
        Ok(candles)
    }
}
