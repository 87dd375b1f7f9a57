//! SpreadBot entrypoint
//!
//! Wires configuration into the engine containers, builds one feed per
//! enabled source and hands everything to the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use spreadbot::config::AppConfig;
use spreadbot::engine::{EngineSettings, PositionBook, TradeEngine};
use spreadbot::orchestrator::{PreloadSettings, RunOrchestrator, RunWindow};
use spreadbot::persistence::CsvPersistence;
use spreadbot::phase::RunPhase;
use spreadbot::quotes::QuoteStore;
use spreadbot::sources::{QuoteFeed, RestTickerFeed, SimulatedFeed, SourceRegistry};
use spreadbot::spread::{SpreadEvaluator, SpreadTracker};
use spreadbot::types::Source;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("Configuration load failed")?;
    info!(config = %config.digest(), "SpreadBot starting");

    let pairs = config.pairs();
    let sources = config.sources.enabled();

    let registry = Arc::new(SourceRegistry::from_config(&config));
    let store = Arc::new(QuoteStore::new(&sources));
    let tracker = Arc::new(SpreadTracker::new(
        config.spread.window_size,
        config.spread.capture_interval_ms,
        config.spread.breakthrough_max_age_ms,
    ));
    let book = Arc::new(PositionBook::new());
    let phase = Arc::new(RunPhase::new(
        Utc::now().timestamp_millis(),
        config.run.warmup_secs,
        config.run.trading_secs,
        config.run.winddown_secs,
    ));

    let engine = Arc::new(TradeEngine::new(
        EngineSettings::from_config(&config),
        Arc::clone(&store),
        Arc::clone(&book),
        Arc::clone(&registry),
        Arc::clone(&phase),
    ));

    let evaluator = SpreadEvaluator::new(
        Arc::clone(&store),
        Arc::clone(&tracker),
        Arc::clone(&phase),
        Arc::clone(&engine),
        sources.clone(),
        config.quotes.staleness_ms,
    );

    let feeds = build_feeds(&config, &sources);

    let persistence = if config.persistence.csv_enabled {
        Some(Arc::new(
            CsvPersistence::new(&config.persistence.data_dir)
                .context("Persistence setup failed")?,
        ))
    } else {
        None
    };

    let orchestrator = Arc::new(RunOrchestrator::new(
        config.bot.tag.clone(),
        pairs,
        feeds,
        store,
        tracker,
        evaluator,
        engine,
        registry,
        phase,
        persistence,
        PreloadSettings {
            enabled: config.run.preload_enabled,
            timeframe: config.run.preload_timeframe.clone(),
            limit: config.run.preload_limit,
        },
        RunWindow {
            warmup_secs: config.run.warmup_secs,
            trading_secs: config.run.trading_secs,
            winddown_secs: config.run.winddown_secs,
        },
        Duration::from_secs(config.persistence.export_interval_secs.max(1)),
    ));

    tokio::select! {
        _ = Arc::clone(&orchestrator).run() => {
            info!("Run finished cleanly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
        }
    }

    Ok(())
}

/// One feed per enabled source. Dry-run mode forces the simulated feed for
/// every source; otherwise the configured adapter kind decides.
fn build_feeds(config: &AppConfig, sources: &[Source]) -> HashMap<Source, Arc<dyn QuoteFeed>> {
    let pairs = config.pairs();
    sources
        .iter()
        .enumerate()
        .map(|(index, &source)| {
            let settings = config.sources.get(source);
            let feed: Arc<dyn QuoteFeed> = if config.bot.dry_run || settings.kind == "sim" {
                Arc::new(SimulatedFeed::new(
                    source,
                    pairs.clone(),
                    // Distinct stream per source, still deterministic per run seed
                    config.sim.seed.wrapping_add(index as u64),
                    config.sim.volatility_bps,
                    config.sim.start_mid,
                ))
            } else {
                Arc::new(RestTickerFeed::new(
                    source,
                    settings.endpoint.clone(),
                    pairs.clone(),
                ))
            };
            (source, feed)
        })
        .collect()
}
