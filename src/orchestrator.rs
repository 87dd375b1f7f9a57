//! Run orchestration
//!
//! One independently-timed polling task per source, each at that source's
//! own rate limit. A cycle is strictly sequential: fetch quotes → evaluate
//! entries → evaluate exits. The run phase gates what each cycle does:
//! warm-up accumulates spread samples only, trading runs entries and exits,
//! wind-down runs exits only until the run-end deadline forces the book
//! empty. Cycles for different sources interleave freely; nothing here
//! blocks another source's fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::TradeEngine;
use crate::persistence::{CsvPersistence, RunMetaRecord};
use crate::phase::RunPhase;
use crate::quotes::QuoteStore;
use crate::sources::{QuoteFeed, SourceRegistry};
use crate::spread::{SpreadEvaluator, SpreadTracker};
use crate::types::{Pair, Source};

/// Candle preload settings
#[derive(Debug, Clone)]
pub struct PreloadSettings {
    pub enabled: bool,
    pub timeframe: String,
    pub limit: usize,
}

/// Configured run-phase durations, echoed into the run metadata row
#[derive(Debug, Clone, Copy)]
pub struct RunWindow {
    pub warmup_secs: i64,
    pub trading_secs: i64,
    pub winddown_secs: i64,
}

pub struct RunOrchestrator {
    run_id: Uuid,
    tag: String,
    pairs: Vec<Pair>,
    feeds: HashMap<Source, Arc<dyn QuoteFeed>>,
    store: Arc<QuoteStore>,
    tracker: Arc<SpreadTracker>,
    evaluator: SpreadEvaluator,
    engine: Arc<TradeEngine>,
    registry: Arc<SourceRegistry>,
    phase: Arc<RunPhase>,
    persistence: Option<Arc<CsvPersistence>>,
    preload: PreloadSettings,
    window: RunWindow,
    export_interval: Duration,
}

impl RunOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tag: String,
        pairs: Vec<Pair>,
        feeds: HashMap<Source, Arc<dyn QuoteFeed>>,
        store: Arc<QuoteStore>,
        tracker: Arc<SpreadTracker>,
        evaluator: SpreadEvaluator,
        engine: Arc<TradeEngine>,
        registry: Arc<SourceRegistry>,
        phase: Arc<RunPhase>,
        persistence: Option<Arc<CsvPersistence>>,
        preload: PreloadSettings,
        window: RunWindow,
        export_interval: Duration,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            tag,
            pairs,
            feeds,
            store,
            tracker,
            evaluator,
            engine,
            registry,
            phase,
            persistence,
            preload,
            window,
            export_interval,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Drive the whole run to completion.
    pub async fn run(self: Arc<Self>) {
        self.save_run_meta().await;

        if self.preload.enabled {
            self.preload_baseline().await;
        }

        info!(run_id = %self.run_id, phase = self.phase.phase_name(), "Starting source cycles");

        let mut handles = Vec::new();
        for source in self.feeds.keys().copied() {
            let orchestrator = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                orchestrator.source_loop(source).await;
            }));
        }

        let exporter = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            exporter.export_loop().await;
        }));

        futures_util::future::join_all(handles).await;

        // Anything closed between the exporter's last tick and loop exit
        self.export_completed().await;

        info!(run_id = %self.run_id, "Run complete");
    }

    async fn source_loop(&self, source: Source) {
        let rate_limit = self.registry.rate_limit(source).max(1);
        let period = Duration::from_millis(60_000 / rate_limit as u64);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(source = %source, period_ms = period.as_millis() as u64, "Source cycle started");
        loop {
            interval.tick().await;
            self.run_cycle(source).await;
            if self.phase.run_ended() && self.engine.book().is_empty() {
                break;
            }
        }
        info!(source = %source, "Source cycle finished");
    }

    /// One polling cycle for `source`: fetch → entries → exits.
    ///
    /// Public so a scheduling harness can drive cycles directly.
    pub async fn run_cycle(&self, source: Source) {
        let Some(feed) = self.feeds.get(&source) else {
            return;
        };

        match feed.fetch_quotes().await {
            Ok(quotes) => {
                self.registry.set_faulty(source, false);
                self.store.update(source, quotes);
            }
            Err(e) => {
                warn!(source = %source, error = %e, transient = e.is_transient(), "Quote fetch failed, source marked faulty");
                self.registry.set_faulty(source, true);
                return;
            }
        }

        // Sample accumulation and entry evaluation end at trading stop;
        // the tracker itself suppresses breakthroughs during warm-up.
        if !self.phase.trading_stopped() {
            self.evaluator.evaluate_source(source);
        }

        // No positions can exist before warm-up ends
        if self.phase.past_warmup() {
            self.engine.evaluate_open(source).await;
        }
    }

    /// Seed the spread tracker from recent candles so warm-up starts from a
    /// realistic difference baseline instead of an empty window.
    async fn preload_baseline(&self) {
        let mut closes: HashMap<(Source, Pair), Vec<rust_decimal::Decimal>> = HashMap::new();

        for (source, feed) in &self.feeds {
            for pair in &self.pairs {
                match feed
                    .fetch_candles(pair, &self.preload.timeframe, self.preload.limit)
                    .await
                {
                    Ok(candles) => {
                        if let Some(persistence) = &self.persistence {
                            for candle in &candles {
                                if let Err(e) = persistence.save_candle(candle).await {
                                    error!(error = %e, "Failed to persist preload candle");
                                }
                            }
                        }
                        closes.insert(
                            (*source, pair.clone()),
                            candles.into_iter().map(|c| c.close).collect(),
                        );
                    }
                    Err(e) => {
                        warn!(source = %source, pair = %pair, error = %e, "Candle preload failed for source");
                    }
                }
            }
        }

        let sources: Vec<Source> = self.feeds.keys().copied().collect();
        let mut seeded = 0usize;
        for pair in &self.pairs {
            for &a in &sources {
                for &b in &sources {
                    if a == b {
                        continue;
                    }
                    let (Some(closes_a), Some(closes_b)) = (
                        closes.get(&(a, pair.clone())),
                        closes.get(&(b, pair.clone())),
                    ) else {
                        continue;
                    };
                    let diffs: Vec<rust_decimal::Decimal> = closes_a
                        .iter()
                        .zip(closes_b.iter())
                        .map(|(ca, cb)| *ca - *cb)
                        .collect();
                    if !diffs.is_empty() {
                        self.tracker.seed(pair, a, b, &diffs);
                        seeded += 1;
                    }
                }
            }
        }
        info!(series = seeded, "Spread baseline preloaded from candles");
    }

    async fn export_loop(&self) {
        let mut interval = tokio::time::interval(self.export_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.export_completed().await;
            if self.phase.run_ended()
                && self.engine.book().is_empty()
                && self.engine.completed_pending() == 0
            {
                break;
            }
        }
        info!("Exporter finished");
    }

    async fn export_completed(&self) {
        let completed = self.engine.take_completed();
        if completed.is_empty() {
            return;
        }
        match &self.persistence {
            Some(persistence) => {
                let run_id = self.run_id.to_string();
                if let Err(e) = persistence.export_positions(&run_id, &completed).await {
                    error!(error = %e, count = completed.len(), "Failed to export completed positions");
                }
            }
            None => {
                info!(count = completed.len(), "CSV disabled, dropping completed positions");
            }
        }
    }

    async fn save_run_meta(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let record = RunMetaRecord {
            run_id: self.run_id.to_string(),
            tag: self.tag.clone(),
            started_ts: Utc::now().timestamp_millis(),
            pairs: self
                .pairs
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(" "),
            sources: self
                .feeds
                .keys()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(" "),
            warmup_secs: self.window.warmup_secs,
            trading_secs: self.window.trading_secs,
            winddown_secs: self.window.winddown_secs,
        };
        if let Err(e) = persistence.save_run_meta(record).await {
            error!(error = %e, "Failed to persist run metadata");
        }
    }
}
