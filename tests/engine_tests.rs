//! End-to-end tests over the trade engine and its containers

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use spreadbot::engine::{EngineSettings, PositionBook, TradeEngine};
use spreadbot::phase::RunPhase;
use spreadbot::quotes::QuoteStore;
use spreadbot::sources::{FeeSchedule, SourceRegistry};
use spreadbot::types::{CloseReason, Pair, Quote, Source};

// ============================================================================
// Fixtures
// ============================================================================

const SOURCES: [Source; 3] = [Source::Binance, Source::Bybit, Source::Coinbase];

fn settings() -> EngineSettings {
    EngineSettings {
        staleness_ms: 60_000,
        entry_min_pct: dec!(1),
        entry_max_pct: dec!(10),
        entry_profit_pct: dec!(0.1),
        exit_profit_pct: dec!(0.2),
        profit_decay_pct: dec!(0.05),
        profit_decay_interval_ms: 600_000,
        trade_timeout_ms: 0,
        detriment_pct: dec!(1),
        desync_pct: dec!(20),
        suspense_ms: 60_000,
        parallel_positions: 0,
        min_notional: dec!(100),
        reporting_notionals: vec![dec!(100)],
        lookup_retries: 1,
        lookup_retry_delay: Duration::from_millis(1),
    }
}

fn zero_fees() -> FeeSchedule {
    FeeSchedule {
        fixed_usd: Decimal::ZERO,
        taker_pct: Decimal::ZERO,
    }
}

fn trading_phase() -> RunPhase {
    RunPhase::new(Utc::now().timestamp_millis() - 10_000, 1, 3_600, 600)
}

fn ended_phase() -> RunPhase {
    RunPhase::new(Utc::now().timestamp_millis() - 100_000, 1, 1, 1)
}

struct Fixture {
    engine: Arc<TradeEngine>,
    store: Arc<QuoteStore>,
    book: Arc<PositionBook>,
}

fn fixture_with(settings: EngineSettings, phase: RunPhase) -> Fixture {
    let store = Arc::new(QuoteStore::new(&SOURCES));
    let book = Arc::new(PositionBook::new());
    let registry = Arc::new(SourceRegistry::with_uniform_fees(&SOURCES, zero_fees(), 60));
    let engine = Arc::new(TradeEngine::new(
        settings,
        Arc::clone(&store),
        Arc::clone(&book),
        registry,
        Arc::new(phase),
    ));
    Fixture { engine, store, book }
}

fn fixture() -> Fixture {
    fixture_with(settings(), trading_phase())
}

fn btc() -> Pair {
    Pair::new("BTC", "USDT")
}

fn quote(source: Source, pair: &Pair, bid: Decimal, ask: Decimal) -> Quote {
    Quote::new(source, pair.clone(), bid, ask, (bid + ask) / dec!(2))
}

/// Publish a quote and return a copy for the engine call
fn publish(fx: &Fixture, source: Source, pair: &Pair, bid: Decimal, ask: Decimal) -> Quote {
    let q = quote(source, pair, bid, ask);
    fx.store.update(source, vec![q.clone()]);
    q
}

/// Standard profitable entry: Binance bid 100 over Bybit ask 95
fn open_standard(fx: &Fixture) -> u64 {
    let short = publish(fx, Source::Binance, &btc(), dec!(100), dec!(100.2));
    let long = publish(fx, Source::Bybit, &btc(), dec!(94.8), dec!(95));
    fx.engine
        .try_open(&short, &long, dec!(1))
        .expect("standard entry should open")
}

// ============================================================================
// Entry
// ============================================================================

#[test]
fn test_open_respects_leg_invariant() {
    let fx = fixture();
    let id = open_standard(&fx);

    let position = fx.book.get(id).unwrap();
    assert!(position.short.open_price > position.long.open_price);
    assert_eq!(position.short.open_price, dec!(100));
    assert_eq!(position.long.open_price, dec!(95));
    assert_eq!(position.entry_pct_diff, dec!(5.263));
}

#[test]
fn test_open_rejects_missing_quotes() {
    let fx = fixture();
    // Quotes never published to the store: the staleness probe fails them
    let short = quote(Source::Binance, &btc(), dec!(100), dec!(100.2));
    let long = quote(Source::Bybit, &btc(), dec!(94.8), dec!(95));
    assert!(fx.engine.try_open(&short, &long, dec!(1)).is_none());
}

#[test]
fn test_open_rejects_outside_entry_range() {
    let fx = fixture();
    // 0.2% spread, below the 1% entry minimum
    let short = publish(&fx, Source::Binance, &btc(), dec!(100.2), dec!(100.3));
    let long = publish(&fx, Source::Bybit, &btc(), dec!(99.9), dec!(100));
    assert!(fx.engine.try_open(&short, &long, dec!(0.01)).is_none());
}

#[test]
fn test_open_rejects_unprofitable_reversion() {
    let fx = fixture();
    let short = publish(&fx, Source::Binance, &btc(), dec!(100), dec!(100.2));
    let long = publish(&fx, Source::Bybit, &btc(), dec!(94.8), dec!(95));
    // Reference equals the current diff: nothing left to revert
    assert!(fx.engine.try_open(&short, &long, dec!(5)).is_none());
}

#[test]
fn test_one_live_position_per_unordered_source_pair() {
    let fx = fixture();
    open_standard(&fx);

    // Same pair and sources with roles swapped: still the same slot
    let short = publish(&fx, Source::Bybit, &btc(), dec!(100), dec!(100.2));
    let long = publish(&fx, Source::Binance, &btc(), dec!(94.8), dec!(95));
    assert!(fx.engine.try_open(&short, &long, dec!(1)).is_none());
    assert_eq!(fx.book.live_count(), 1);
}

#[test]
fn test_parallel_position_cap() {
    let mut cfg = settings();
    cfg.parallel_positions = 2;
    let fx = fixture_with(cfg, trading_phase());

    // Two positions already referencing Binance on either leg
    let short = publish(&fx, Source::Binance, &btc(), dec!(100), dec!(100.2));
    let long = publish(&fx, Source::Bybit, &btc(), dec!(94.8), dec!(95));
    fx.engine.try_open(&short, &long, dec!(1)).unwrap();

    let eth = Pair::new("ETH", "USDT");
    let short = publish(&fx, Source::Binance, &eth, dec!(100), dec!(100.2));
    let long = publish(&fx, Source::Coinbase, &eth, dec!(94.8), dec!(95));
    fx.engine.try_open(&short, &long, dec!(1)).unwrap();

    // Third entry touching Binance is rejected regardless of profitability
    let sol = Pair::new("SOL", "USDT");
    let short = publish(&fx, Source::Binance, &sol, dec!(100), dec!(100.2));
    let long = publish(&fx, Source::Bybit, &sol, dec!(94.8), dec!(95));
    assert!(fx.engine.try_open(&short, &long, dec!(1)).is_none());
    assert_eq!(fx.book.live_count(), 2);
}

#[test]
fn test_open_rejects_faulty_source() {
    let fx = fixture();
    let registry = Arc::new(SourceRegistry::with_uniform_fees(&SOURCES, zero_fees(), 60));
    registry.set_faulty(Source::Binance, true);
    let engine = TradeEngine::new(
        settings(),
        Arc::clone(&fx.store),
        Arc::clone(&fx.book),
        registry,
        Arc::new(trading_phase()),
    );

    let short = publish(&fx, Source::Binance, &btc(), dec!(100), dec!(100.2));
    let long = publish(&fx, Source::Bybit, &btc(), dec!(94.8), dec!(95));
    assert!(engine.try_open(&short, &long, dec!(1)).is_none());
}

// ============================================================================
// Exit
// ============================================================================

#[tokio::test]
async fn test_profit_close() {
    let fx = fixture();
    let id = open_standard(&fx);

    // Spread converged: SHORT buys back cheap, LONG sells higher
    publish(&fx, Source::Binance, &btc(), dec!(95.8), dec!(96));
    publish(&fx, Source::Bybit, &btc(), dec!(96.5), dec!(96.7));

    fx.engine.evaluate_open(Source::Binance).await;

    assert!(fx.book.is_empty());
    let completed = fx.engine.take_completed();
    assert_eq!(completed.len(), 1);
    let position = &completed[0];
    assert_eq!(position.id, id);
    assert_eq!(position.close_reason, Some(CloseReason::Profit));
    // SHORT closed at the ask, LONG at the bid
    assert_eq!(position.short.close_price, Some(dec!(96)));
    assert_eq!(position.long.close_price, Some(dec!(96.5)));
    assert!(position.income > Decimal::ZERO);
    assert_eq!(fx.book.cooldown_count(), 0);
}

#[tokio::test]
async fn test_timeout_close() {
    let mut cfg = settings();
    cfg.trade_timeout_ms = 1;
    let fx = fixture_with(cfg, trading_phase());
    let id = open_standard(&fx);

    tokio::time::sleep(Duration::from_millis(10)).await;
    fx.engine.evaluate_open(Source::Bybit).await;

    let completed = fx.engine.take_completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, id);
    assert_eq!(completed[0].close_reason, Some(CloseReason::Timeout));
}

#[tokio::test]
async fn test_adverse_close_creates_cooldown_and_blocks_reentry() {
    let fx = fixture();
    open_standard(&fx);

    // Spread widens hard against the position, legs far out of sync
    publish(&fx, Source::Binance, &btc(), dec!(102.8), dec!(103));
    publish(&fx, Source::Bybit, &btc(), dec!(95.1), dec!(95.3));

    fx.engine.evaluate_open(Source::Binance).await;

    let completed = fx.engine.take_completed();
    assert_eq!(completed.len(), 1);
    let position = &completed[0];
    assert_eq!(position.close_reason, Some(CloseReason::Adverse));
    assert_eq!(fx.book.cooldown_count(), 1);

    // Re-entry on the same source pair is blocked while the cool-down lives
    let short = publish(&fx, Source::Binance, &btc(), dec!(100), dec!(100.2));
    let long = publish(&fx, Source::Bybit, &btc(), dec!(94.8), dec!(95));
    assert!(fx.engine.try_open(&short, &long, dec!(1)).is_none());
}

#[tokio::test]
async fn test_adverse_close_suppressed_when_legs_in_sync() {
    let fx = fixture();
    open_standard(&fx);

    // Both legs lose similar amounts: a market-wide move, not a spread
    // failure. SHORT pnl -2, LONG pnl about -1.9.
    publish(&fx, Source::Binance, &btc(), dec!(101.8), dec!(102));
    publish(&fx, Source::Bybit, &btc(), dec!(93.2), dec!(93.4));

    fx.engine.evaluate_open(Source::Binance).await;

    // Income is past the detriment cutoff, but the close is suppressed
    assert_eq!(fx.book.live_count(), 1);
    assert!(fx.engine.take_completed().is_empty());
}

#[tokio::test]
async fn test_run_end_close() {
    let fx = fixture();
    let id = open_standard(&fx);

    // Swap in an ended phase: same book, same store
    let registry = Arc::new(SourceRegistry::with_uniform_fees(&SOURCES, zero_fees(), 60));
    let engine = TradeEngine::new(
        settings(),
        Arc::clone(&fx.store),
        Arc::clone(&fx.book),
        registry,
        Arc::new(ended_phase()),
    );

    engine.evaluate_open(Source::Binance).await;

    let completed = engine.take_completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, id);
    assert_eq!(completed[0].close_reason, Some(CloseReason::RunEnd));
    assert!(fx.book.is_empty());
}

#[test]
fn test_double_close_is_noop() {
    let fx = fixture();
    let id = open_standard(&fx);

    let short = quote(Source::Binance, &btc(), dec!(96), dec!(96.2));
    let long = quote(Source::Bybit, &btc(), dec!(96.5), dec!(96.7));

    fx.engine.close(id, CloseReason::Profit, &short, &long);
    // Second close on the same id: logged no-op, nothing added
    fx.engine.close(id, CloseReason::Profit, &short, &long);

    assert_eq!(fx.engine.take_completed().len(), 1);
}

#[tokio::test]
async fn test_min_max_pnl_tracked_across_evaluations() {
    let fx = fixture();
    let id = open_standard(&fx);

    // First evaluation: small loss on the short leg
    publish(&fx, Source::Binance, &btc(), dec!(100.3), dec!(100.5));
    publish(&fx, Source::Bybit, &btc(), dec!(95.0), dec!(95.2));
    fx.engine.evaluate_open(Source::Binance).await;

    // Second evaluation: short leg recovers a little, still short of the
    // profit target so the position stays open
    publish(&fx, Source::Binance, &btc(), dec!(99.6), dec!(99.8));
    fx.engine.evaluate_open(Source::Binance).await;

    let position = fx.book.get(id).expect("still open");
    let (min_pnl, _) = position.short.min_pnl.unwrap();
    let (max_pnl, _) = position.short.max_pnl.unwrap();
    assert!(min_pnl < max_pnl);
    assert_eq!(min_pnl, dec!(-0.5));
    assert_eq!(max_pnl, dec!(0.2));
}
