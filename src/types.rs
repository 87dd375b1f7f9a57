//! Core types used throughout SpreadBot
//!
//! Defines quotes, candles, trading pairs and the fixed-scale decimal
//! helpers shared by the spread tracker and the trade engine.

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported quote sources (exchanges)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Binance,
    Bybit,
    Coinbase,
    Kraken,
}

impl Source {
    /// All known sources, in registry order
    pub const ALL: [Source; 4] = [
        Source::Binance,
        Source::Bybit,
        Source::Coinbase,
        Source::Kraken,
    ];

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "binance" => Some(Source::Binance),
            "bybit" => Some(Source::Bybit),
            "coinbase" => Some(Source::Coinbase),
            "kraken" => Some(Source::Kraken),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Binance => write!(f, "Binance"),
            Source::Bybit => write!(f, "Bybit"),
            Source::Coinbase => write!(f, "Coinbase"),
            Source::Kraken => write!(f, "Kraken"),
        }
    }
}

/// A traded pair: base asset priced in the target currency
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pair {
    pub base: String,
    pub target: String,
}

impl Pair {
    pub fn new(base: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            target: target.into().to_uppercase(),
        }
    }

    /// Parse "BTC/USDT" style notation
    pub fn from_str(s: &str) -> Option<Self> {
        let (base, target) = s.split_once('/')?;
        if base.is_empty() || target.is_empty() {
            return None;
        }
        Some(Self::new(base, target))
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.target)
    }
}

/// Latest observed top-of-book quote on one source.
///
/// Replaced wholesale when bid or ask moves; the previous bid/ask are
/// carried over so consumers can distinguish true price changes from
/// repeated identical snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub source: Source,
    pub pair: Pair,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    /// Observation timestamp (epoch ms)
    pub time_ms: i64,
    /// Sticky until the next full update
    pub stale: bool,
    pub prev_bid: Option<Decimal>,
    pub prev_ask: Option<Decimal>,
}

impl Quote {
    pub fn new(source: Source, pair: Pair, bid: Decimal, ask: Decimal, last: Decimal) -> Self {
        Self {
            source,
            pair,
            bid,
            ask,
            last,
            time_ms: Utc::now().timestamp_millis(),
            stale: false,
            prev_bid: None,
            prev_ask: None,
        }
    }

    /// True if bid or ask moved relative to `other`
    pub fn price_changed(&self, other: &Quote) -> bool {
        self.bid != other.bid || self.ask != other.ask
    }

    /// Latch the stale flag once the quote's age reaches `threshold_ms`.
    /// Idempotent; the flag is only cleared by a full replacement.
    pub fn mark_stale_if_expired(&mut self, threshold_ms: i64, now_ms: i64) -> bool {
        if !self.stale && now_ms - self.time_ms >= threshold_ms {
            self.stale = true;
        }
        self.stale
    }
}

/// OHLCV candle used by the preload path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub source: Source,
    pub pair: Pair,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Candle open timestamp (epoch ms)
    pub open_time_ms: i64,
    /// Timeframe label, e.g. "1m"
    pub timeframe: String,
}

/// Side of one leg of a paired position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegSide {
    Short,
    Long,
}

impl fmt::Display for LegSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegSide::Short => write!(f, "SHORT"),
            LegSide::Long => write!(f, "LONG"),
        }
    }
}

/// Why a position left the live set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    Profit,
    Timeout,
    Adverse,
    RunEnd,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Profit => write!(f, "PROFIT"),
            CloseReason::Timeout => write!(f, "TIMEOUT"),
            CloseReason::Adverse => write!(f, "ADVERSE"),
            CloseReason::RunEnd => write!(f, "RUN_END"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Fixed-scale decimal arithmetic
// ─────────────────────────────────────────────────────────────────

/// Scale for prices and PnL amounts
pub const PRICE_SCALE: u32 = 8;
/// Scale for percentage values
pub const PCT_SCALE: u32 = 3;
/// Scale for fee amounts
pub const FEE_SCALE: u32 = 6;
/// Scale for traded volume (amount units)
pub const VOLUME_SCALE: u32 = 3;

const ROUNDING: RoundingStrategy = RoundingStrategy::MidpointAwayFromZero;

pub fn round_price(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(PRICE_SCALE, ROUNDING)
}

pub fn round_pct(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(PCT_SCALE, ROUNDING)
}

pub fn round_fee(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(FEE_SCALE, ROUNDING)
}

pub fn round_volume(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(VOLUME_SCALE, ROUNDING)
}

/// Entry spread as a percentage of the buy-side price:
/// `(bid_short - ask_long) / ask_long * 100`
pub fn percent_difference(bid_short: Decimal, ask_long: Decimal) -> Decimal {
    if ask_long.is_zero() {
        return Decimal::ZERO;
    }
    round_pct((bid_short - ask_long) / ask_long * Decimal::ONE_HUNDRED)
}
