//! Configuration management for SpreadBot
//!
//! Loads from YAML files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::types::{Pair, Source};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub sources: SourcesConfig,
    pub quotes: QuotesConfig,
    pub spread: SpreadConfig,
    pub trading: TradingConfig,
    pub run: RunConfig,
    pub persistence: PersistenceConfig,
    pub sim: SimConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Bot version tag for logging and CSV
    pub tag: String,
    /// Trading pairs to monitor ("BTC/USDT" notation)
    pub pairs: Vec<String>,
    /// Dry run mode: use simulated feeds regardless of source kind
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    pub binance: SourceSettings,
    pub bybit: SourceSettings,
    pub coinbase: SourceSettings,
    pub kraken: SourceSettings,
}

impl SourcesConfig {
    pub fn get(&self, source: Source) -> &SourceSettings {
        match source {
            Source::Binance => &self.binance,
            Source::Bybit => &self.bybit,
            Source::Coinbase => &self.coinbase,
            Source::Kraken => &self.kraken,
        }
    }

    /// Sources enabled for this run, in registry order
    pub fn enabled(&self) -> Vec<Source> {
        Source::ALL
            .into_iter()
            .filter(|s| self.get(*s).enabled)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    pub enabled: bool,
    /// Adapter kind: "rest" or "sim"
    pub kind: String,
    /// Ticker endpoint template for REST adapters
    pub endpoint: String,
    /// Fetch cycles per minute
    pub rate_limit_per_min: u32,
    /// Deposit + withdraw flat fee, charged once per leg (USD)
    pub fixed_fee_usd: f64,
    /// Taker fee percentage per fill
    pub taker_fee_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotesConfig {
    /// Quote staleness threshold in milliseconds
    pub staleness_ms: i64,
    /// Bounded retry for cross-cycle visibility lag
    pub lookup_retries: u32,
    /// Delay between lookup retries in milliseconds
    pub lookup_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpreadConfig {
    /// Sliding window size once warm-up has ended
    pub window_size: usize,
    /// Minimum interval between recorded samples in milliseconds
    pub capture_interval_ms: i64,
    /// Breakthrough reference invalidation age in milliseconds
    pub breakthrough_max_age_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Entry percentage-difference range
    pub entry_min_pct: f64,
    pub entry_max_pct: f64,
    /// Minimum projected income at entry, as a percentage of the minimum notional
    pub entry_profit_pct: f64,
    /// Additional profit demanded at exit, decaying over time
    pub exit_profit_pct: f64,
    /// Decay step subtracted from exit_profit_pct
    pub profit_decay_pct: f64,
    /// Elapsed seconds per decay step
    pub profit_decay_interval_secs: i64,
    /// Maximum position age in seconds (0 = no timeout)
    pub trade_timeout_secs: i64,
    /// Adverse cutoff as a percentage of the minimum notional
    pub detriment_pct: f64,
    /// Suppress adverse closes while leg PnLs stay within this percentage
    /// of each other (relative to the larger absolute value)
    pub desync_pct: f64,
    /// Cool-down after an adverse close, in seconds
    pub suspense_secs: i64,
    /// Max live positions touching one source (0 = unlimited)
    pub parallel_positions: usize,
    /// Notional used for all trading decisions (USD)
    pub min_notional_usd: f64,
    /// Notionals evaluated for reporting
    pub reporting_notionals: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Warm-up duration in seconds (sample accumulation only)
    pub warmup_secs: i64,
    /// Active trading duration after warm-up, in seconds
    pub trading_secs: i64,
    /// Wind-down duration after trading stops, in seconds
    pub winddown_secs: i64,
    /// Candle preload toggle
    pub preload_enabled: bool,
    /// Candle timeframe for the preload
    pub preload_timeframe: String,
    /// Candles fetched per pair per source during preload
    pub preload_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory
    pub data_dir: String,
    /// Enable CSV logging
    pub csv_enabled: bool,
    /// Completed-position export interval in seconds
    pub export_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    /// Seed for the simulated feeds (deterministic per seed)
    pub seed: u64,
    /// Random-walk step size in basis points of the mid price
    pub volatility_bps: f64,
    /// Starting mid price applied to every configured pair
    pub start_mid: f64,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let mut builder = Config::builder()
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.pairs", vec!["BTC/USDT", "ETH/USDT"])?
            .set_default("bot.dry_run", true)?
            // Quote store defaults
            .set_default("quotes.staleness_ms", 20_000)?
            .set_default("quotes.lookup_retries", 3)?
            .set_default("quotes.lookup_retry_delay_ms", 50)?
            // Spread tracker defaults
            .set_default("spread.window_size", 120)?
            .set_default("spread.capture_interval_ms", 1_000)?
            .set_default("spread.breakthrough_max_age_ms", 300_000)?
            // Trading defaults
            .set_default("trading.entry_min_pct", 0.5)?
            .set_default("trading.entry_max_pct", 10.0)?
            .set_default("trading.entry_profit_pct", 0.2)?
            .set_default("trading.exit_profit_pct", 0.3)?
            .set_default("trading.profit_decay_pct", 0.05)?
            .set_default("trading.profit_decay_interval_secs", 600)?
            .set_default("trading.trade_timeout_secs", 0)?
            .set_default("trading.detriment_pct", 1.0)?
            .set_default("trading.desync_pct", 20.0)?
            .set_default("trading.suspense_secs", 1_800)?
            .set_default("trading.parallel_positions", 2)?
            .set_default("trading.min_notional_usd", 100.0)?
            .set_default("trading.reporting_notionals", vec![100.0, 500.0, 1000.0])?
            // Run phase defaults
            .set_default("run.warmup_secs", 600)?
            .set_default("run.trading_secs", 3_600)?
            .set_default("run.winddown_secs", 600)?
            .set_default("run.preload_enabled", true)?
            .set_default("run.preload_timeframe", "1m")?
            .set_default("run.preload_limit", 60)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.csv_enabled", true)?
            .set_default("persistence.export_interval_secs", 10)?
            // Simulated feed defaults
            .set_default("sim.seed", 42)?
            .set_default("sim.volatility_bps", 5.0)?
            .set_default("sim.start_mid", 100.0)?;

        for source in ["binance", "bybit", "coinbase", "kraken"] {
            builder = builder
                .set_default(format!("sources.{source}.enabled"), source != "kraken")?
                .set_default(format!("sources.{source}.kind"), "sim")?
                .set_default(format!("sources.{source}.endpoint"), "")?
                .set_default(format!("sources.{source}.rate_limit_per_min"), 60)?
                .set_default(format!("sources.{source}.fixed_fee_usd"), 0.0)?
                .set_default(format!("sources.{source}.taker_fee_pct"), 0.1)?;
        }

        let config = builder
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (SPREADBOT_*)
            .add_source(Environment::with_prefix("SPREADBOT").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Sanity checks before startup wiring
    pub fn validate(&self) -> Result<()> {
        if self.sources.enabled().len() < 2 {
            bail!("At least two sources must be enabled to compare spreads");
        }
        if self.bot.pairs.is_empty() {
            bail!("No trading pairs configured");
        }
        for raw in &self.bot.pairs {
            if Pair::from_str(raw).is_none() {
                bail!("Malformed trading pair '{}' (expected BASE/TARGET)", raw);
            }
        }
        if self.trading.entry_min_pct > self.trading.entry_max_pct {
            bail!("trading.entry_min_pct exceeds trading.entry_max_pct");
        }
        if self.spread.window_size < 2 {
            bail!("spread.window_size must be at least 2");
        }
        if self.trading.min_notional_usd <= 0.0 {
            bail!("trading.min_notional_usd must be positive");
        }
        Ok(())
    }

    /// Configured pairs parsed into typed form
    pub fn pairs(&self) -> Vec<Pair> {
        self.bot
            .pairs
            .iter()
            .filter_map(|raw| Pair::from_str(raw))
            .collect()
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} pairs={:?} sources={:?} dry_run={} window={} entry=[{:.2}%,{:.2}%]",
            self.bot.tag,
            self.bot.pairs,
            self.sources.enabled(),
            self.bot.dry_run,
            self.spread.window_size,
            self.trading.entry_min_pct,
            self.trading.entry_max_pct,
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

/// Converts an f64 config value into a Decimal at load time.
///
/// Config files carry plain floats; everything downstream of this point
/// works in fixed-scale decimals only.
pub fn decimal_from_config(value: f64) -> Decimal {
    Decimal::try_from(value).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::load().expect("defaults should load")
    }

    #[test]
    fn test_defaults_load() {
        let cfg = base_config();
        assert!(cfg.bot.dry_run);
        assert_eq!(cfg.sources.enabled().len(), 3);
        assert_eq!(cfg.pairs().len(), 2);
        assert_eq!(cfg.spread.window_size, 120);
    }

    #[test]
    fn test_validate_rejects_single_source() {
        let mut cfg = base_config();
        cfg.sources.binance.enabled = false;
        cfg.sources.bybit.enabled = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_pair() {
        let mut cfg = base_config();
        cfg.bot.pairs = vec!["BTCUSDT".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_decimal_from_config() {
        use rust_decimal_macros::dec;
        assert_eq!(decimal_from_config(100.0), dec!(100));
        assert_eq!(decimal_from_config(0.1), dec!(0.1));
    }
}
