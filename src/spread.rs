//! Spread tracking and breakthrough detection
//!
//! For every ordered (pair, sourceA, sourceB) combination the tracker keeps
//! a rolling window of bid-ask difference samples and their average. A
//! breakthrough fires when a positive difference climbs above its own
//! rolling average. The average, not the instantaneous diff, becomes the
//! expected-reversion baseline handed to the trade engine, which keeps a
//! trivially-positive spread from opening a position on every tick.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::engine::TradeEngine;
use crate::phase::RunPhase;
use crate::quotes::QuoteStore;
use crate::types::{round_price, Pair, Quote, Source};

/// Ordered key: sourceA's bid minus sourceB's ask. Not symmetric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SpreadKey {
    pair: Pair,
    source_a: Source,
    source_b: Source,
}

#[derive(Debug, Default)]
struct SpreadSeries {
    samples: VecDeque<Decimal>,
    average: Decimal,
    /// Expected-reversion baseline and the time it was established
    breakthrough: Option<(Decimal, i64)>,
    last_sample_ms: i64,
}

/// Emitted when a recorded difference exceeds its rolling average
#[derive(Debug, Clone)]
pub struct BreakthroughEvent {
    pub pair: Pair,
    pub source_a: Source,
    pub source_b: Source,
    pub diff: Decimal,
    /// Reversion baseline for the entry profitability check
    pub reference: Decimal,
}

pub struct SpreadTracker {
    series: RwLock<HashMap<SpreadKey, SpreadSeries>>,
    window_size: usize,
    capture_interval_ms: i64,
    breakthrough_max_age_ms: i64,
}

impl SpreadTracker {
    pub fn new(window_size: usize, capture_interval_ms: i64, breakthrough_max_age_ms: i64) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            window_size,
            capture_interval_ms,
            breakthrough_max_age_ms,
        }
    }

    /// Record one difference sample and evaluate the breakthrough condition.
    ///
    /// Samples are throttled to one per capture interval. During warm-up the
    /// window grows freely; afterwards the oldest sample is evicted before
    /// the newest is appended, so the window length never exceeds the
    /// configured size once warm-up has ended.
    pub fn record_and_evaluate(
        &self,
        pair: &Pair,
        source_a: Source,
        source_b: Source,
        quote_a: &Quote,
        quote_b: &Quote,
        phase: &RunPhase,
    ) -> Option<BreakthroughEvent> {
        let now_ms = Utc::now().timestamp_millis();
        let key = SpreadKey {
            pair: pair.clone(),
            source_a,
            source_b,
        };

        let mut series = self.series.write().unwrap();
        let entry = series.entry(key).or_default();

        if entry.last_sample_ms != 0 && now_ms - entry.last_sample_ms < self.capture_interval_ms {
            return None;
        }

        let diff = round_price(quote_a.bid - quote_b.ask);
        if phase.past_warmup() {
            while entry.samples.len() >= self.window_size {
                entry.samples.pop_front();
            }
        }
        entry.samples.push_back(diff);
        entry.average = mean(&entry.samples);
        entry.last_sample_ms = now_ms;

        if !phase.past_warmup() || phase.trading_stopped() || phase.run_ended() {
            return None;
        }
        if diff <= Decimal::ZERO || diff <= entry.average {
            return None;
        }

        let reference = match entry.breakthrough {
            Some((value, set_at)) if now_ms - set_at <= self.breakthrough_max_age_ms => value,
            _ => {
                entry.breakthrough = Some((entry.average, now_ms));
                entry.average
            }
        };

        debug!(
            pair = %pair,
            source_a = %source_a,
            source_b = %source_b,
            diff = %diff,
            average = %entry.average,
            reference = %reference,
            "Breakthrough detected"
        );

        Some(BreakthroughEvent {
            pair: pair.clone(),
            source_a,
            source_b,
            diff,
            reference,
        })
    }

    /// Preload path: append baseline samples without throttling, leaving the
    /// capture timer untouched so the first live sample is not dropped.
    pub fn seed(&self, pair: &Pair, source_a: Source, source_b: Source, samples: &[Decimal]) {
        if samples.is_empty() {
            return;
        }
        let key = SpreadKey {
            pair: pair.clone(),
            source_a,
            source_b,
        };
        let mut series = self.series.write().unwrap();
        let entry = series.entry(key).or_default();
        for sample in samples {
            entry.samples.push_back(round_price(*sample));
        }
        entry.average = mean(&entry.samples);
    }

    /// Current rolling average, if any samples exist (test/inspection hook)
    pub fn average(&self, pair: &Pair, source_a: Source, source_b: Source) -> Option<Decimal> {
        let key = SpreadKey {
            pair: pair.clone(),
            source_a,
            source_b,
        };
        self.series.read().unwrap().get(&key).map(|s| s.average)
    }

    /// Current breakthrough reference value, if one is established
    pub fn breakthrough_reference(
        &self,
        pair: &Pair,
        source_a: Source,
        source_b: Source,
    ) -> Option<Decimal> {
        let key = SpreadKey {
            pair: pair.clone(),
            source_a,
            source_b,
        };
        self.series
            .read()
            .unwrap()
            .get(&key)
            .and_then(|s| s.breakthrough.map(|(v, _)| v))
    }

    pub fn sample_count(&self, pair: &Pair, source_a: Source, source_b: Source) -> usize {
        let key = SpreadKey {
            pair: pair.clone(),
            source_a,
            source_b,
        };
        self.series
            .read()
            .unwrap()
            .get(&key)
            .map(|s| s.samples.len())
            .unwrap_or(0)
    }
}

fn mean(samples: &VecDeque<Decimal>) -> Decimal {
    if samples.is_empty() {
        return Decimal::ZERO;
    }
    let sum: Decimal = samples.iter().copied().sum();
    round_price(sum / Decimal::from(samples.len() as u64))
}

// ─────────────────────────────────────────────────────────────────
// Spread evaluator
// ─────────────────────────────────────────────────────────────────

/// Pairs the cycling source against every other known source, records the
/// resulting differences and forwards breakthroughs to the trade engine.
pub struct SpreadEvaluator {
    store: Arc<QuoteStore>,
    tracker: Arc<SpreadTracker>,
    phase: Arc<RunPhase>,
    engine: Arc<TradeEngine>,
    sources: Vec<Source>,
    staleness_ms: i64,
}

impl SpreadEvaluator {
    pub fn new(
        store: Arc<QuoteStore>,
        tracker: Arc<SpreadTracker>,
        phase: Arc<RunPhase>,
        engine: Arc<TradeEngine>,
        sources: Vec<Source>,
        staleness_ms: i64,
    ) -> Self {
        Self {
            store,
            tracker,
            phase,
            engine,
            sources,
            staleness_ms,
        }
    }

    /// One evaluation pass for the cycling source.
    pub fn evaluate_source(&self, cycling: Source) {
        for other in self.sources.iter().copied().filter(|s| *s != cycling) {
            for other_quote in self.store.snapshot(other) {
                if self
                    .store
                    .mark_stale_if_expired(other, &other_quote.pair, self.staleness_ms)
                {
                    continue;
                }
                let Some(cycling_quote) = self.store.get(cycling, &other_quote.pair) else {
                    continue;
                };

                let event = self.tracker.record_and_evaluate(
                    &other_quote.pair,
                    other,
                    cycling,
                    &other_quote,
                    &cycling_quote,
                    &self.phase,
                );

                if let Some(event) = event {
                    // SHORT is the side being sold: the higher bid
                    let (short, long) = if other_quote.bid >= cycling_quote.bid {
                        (other_quote.clone(), cycling_quote)
                    } else {
                        (cycling_quote, other_quote.clone())
                    };
                    if let Some(id) = self.engine.try_open(&short, &long, event.reference) {
                        info!(
                            position_id = id,
                            pair = %event.pair,
                            short_source = %short.source,
                            long_source = %long.source,
                            "Opened position from breakthrough"
                        );
                    }
                }
            }
        }
    }
}
