//! Trade engine
//!
//! Validates and opens paired positions on breakthrough events, evaluates
//! open positions on every cycle and closes them when an exit condition
//! fires. A position is `OPEN` until closed with one of PROFIT, TIMEOUT,
//! ADVERSE or RUN_END; closes are terminal.
//!
//! All trading decisions are sized by the minimum configured notional; the
//! larger reporting notionals only feed the completed-position export.

pub mod book;
pub mod position;

pub use book::PositionBook;
pub use position::{leg_pnl, total_expenses, Leg, NotionalReport, Position};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::config::{decimal_from_config, AppConfig};
use crate::phase::RunPhase;
use crate::quotes::{quote_with_retry, QuoteStore};
use crate::sources::SourceRegistry;
use crate::types::{percent_difference, round_price, CloseReason, LegSide, Quote};

/// Engine thresholds, converted to fixed-scale decimals at startup
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub staleness_ms: i64,
    pub entry_min_pct: Decimal,
    pub entry_max_pct: Decimal,
    pub entry_profit_pct: Decimal,
    pub exit_profit_pct: Decimal,
    pub profit_decay_pct: Decimal,
    pub profit_decay_interval_ms: i64,
    /// 0 disables the timeout exit
    pub trade_timeout_ms: i64,
    pub detriment_pct: Decimal,
    pub desync_pct: Decimal,
    pub suspense_ms: i64,
    /// 0 = unlimited
    pub parallel_positions: usize,
    pub min_notional: Decimal,
    pub reporting_notionals: Vec<Decimal>,
    pub lookup_retries: u32,
    pub lookup_retry_delay: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let trading = &config.trading;
        let mut reporting: Vec<Decimal> = trading
            .reporting_notionals
            .iter()
            .map(|&n| decimal_from_config(n))
            .collect();
        let min_notional = decimal_from_config(trading.min_notional_usd);
        if !reporting.contains(&min_notional) {
            reporting.insert(0, min_notional);
        }

        Self {
            staleness_ms: config.quotes.staleness_ms,
            entry_min_pct: decimal_from_config(trading.entry_min_pct),
            entry_max_pct: decimal_from_config(trading.entry_max_pct),
            entry_profit_pct: decimal_from_config(trading.entry_profit_pct),
            exit_profit_pct: decimal_from_config(trading.exit_profit_pct),
            profit_decay_pct: decimal_from_config(trading.profit_decay_pct),
            profit_decay_interval_ms: trading.profit_decay_interval_secs * 1_000,
            trade_timeout_ms: trading.trade_timeout_secs * 1_000,
            detriment_pct: decimal_from_config(trading.detriment_pct),
            desync_pct: decimal_from_config(trading.desync_pct),
            suspense_ms: trading.suspense_secs * 1_000,
            parallel_positions: trading.parallel_positions,
            min_notional,
            reporting_notionals: reporting,
            lookup_retries: config.quotes.lookup_retries,
            lookup_retry_delay: Duration::from_millis(config.quotes.lookup_retry_delay_ms),
        }
    }

    /// Percentage of the minimum notional, as an absolute USD amount
    fn pct_of_notional(&self, pct: Decimal) -> Decimal {
        round_price(pct / Decimal::ONE_HUNDRED * self.min_notional)
    }
}

pub struct TradeEngine {
    settings: EngineSettings,
    store: Arc<QuoteStore>,
    book: Arc<PositionBook>,
    registry: Arc<SourceRegistry>,
    phase: Arc<RunPhase>,
    /// Closed positions awaiting export
    completed: Mutex<Vec<Position>>,
}

impl TradeEngine {
    pub fn new(
        settings: EngineSettings,
        store: Arc<QuoteStore>,
        book: Arc<PositionBook>,
        registry: Arc<SourceRegistry>,
        phase: Arc<RunPhase>,
    ) -> Self {
        Self {
            settings,
            store,
            book,
            registry,
            phase,
            completed: Mutex::new(Vec::new()),
        }
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    // ── Entry ──────────────────────────────────────────────────

    /// Validate a breakthrough and open a paired position if every gate
    /// passes. Returns the new position id on success.
    pub fn try_open(
        &self,
        quote_short: &Quote,
        quote_long: &Quote,
        breakthrough_ref: Decimal,
    ) -> Option<u64> {
        let pair = &quote_short.pair;
        let short_source = quote_short.source;
        let long_source = quote_long.source;

        // 1. Fresh quotes from healthy sources only. The staleness probe
        //    latches the flag on the stored quote as a side effect.
        let short_stale =
            self.store
                .mark_stale_if_expired(short_source, pair, self.settings.staleness_ms);
        let long_stale =
            self.store
                .mark_stale_if_expired(long_source, pair, self.settings.staleness_ms);
        if short_stale || long_stale {
            debug!(pair = %pair, short_stale, long_stale, "Rejecting entry on stale quote");
            return None;
        }
        if self.registry.is_faulty(short_source) || self.registry.is_faulty(long_source) {
            debug!(pair = %pair, short = %short_source, long = %long_source, "Rejecting entry on faulty source");
            return None;
        }

        // 2. One live position per unordered source pair, and no re-entry
        //    while a cool-down from an adverse close is active.
        if self.book.has_equivalent(short_source, long_source, pair) {
            debug!(pair = %pair, short = %short_source, long = %long_source, "Rejecting entry: equivalent position live");
            return None;
        }
        if self.book.has_cooldown(short_source, long_source, pair) {
            debug!(pair = %pair, short = %short_source, long = %long_source, "Rejecting entry: cool-down active");
            return None;
        }

        // 3. Parallel exposure cap per source
        let cap = self.settings.parallel_positions;
        if cap != 0 {
            let (count_short, count_long) = self.book.count_by_leg(short_source, long_source);
            if count_short >= cap || count_long >= cap {
                debug!(
                    pair = %pair,
                    count_short,
                    count_long,
                    cap,
                    "Rejecting entry: parallel position cap reached"
                );
                return None;
            }
        }

        // 4. Entry range on the percentage difference
        let bid_short = quote_short.bid;
        let ask_long = quote_long.ask;
        if bid_short <= ask_long {
            debug!(pair = %pair, bid_short = %bid_short, ask_long = %ask_long, "Rejecting entry: spread not positive");
            return None;
        }
        let pct_diff = percent_difference(bid_short, ask_long);
        if pct_diff < self.settings.entry_min_pct || pct_diff > self.settings.entry_max_pct {
            debug!(pair = %pair, pct_diff = %pct_diff, "Rejecting entry: outside entry range");
            return None;
        }

        let fee_short = self.registry.fees(short_source);
        let fee_long = self.registry.fees(long_source);
        let notional = self.settings.min_notional;
        let expenses = total_expenses(notional, &fee_short, &fee_long);
        let detriment_amount = self.settings.pct_of_notional(self.settings.detriment_pct);

        // 5. Open-detriment pre-check: what closing immediately would cost,
        //    crossing each leg's own spread
        let immediate_short = leg_pnl(LegSide::Short, quote_short.bid, quote_short.ask, notional);
        let immediate_long = leg_pnl(LegSide::Long, quote_long.ask, quote_long.bid, notional);
        let immediate_income = round_price(immediate_short + immediate_long - expenses);
        if immediate_income <= -detriment_amount {
            debug!(
                pair = %pair,
                immediate_income = %immediate_income,
                detriment = %detriment_amount,
                "Rejecting entry: immediate close already past detriment"
            );
            return None;
        }

        // 6. Profitability: the spread is expected to revert to the
        //    breakthrough reference; project that move at the mean open price
        let current_diff = round_price(bid_short - ask_long);
        let reversion = current_diff - breakthrough_ref;
        let mean_open = (bid_short + ask_long) / Decimal::TWO;
        let projected = leg_pnl(LegSide::Short, mean_open, mean_open - reversion, notional);
        let projected_income = round_price(projected - expenses);
        let entry_profit_amount = self.settings.pct_of_notional(self.settings.entry_profit_pct);
        if projected_income < entry_profit_amount {
            debug!(
                pair = %pair,
                projected_income = %projected_income,
                required = %entry_profit_amount,
                "Rejecting entry: projected income below entry profit"
            );
            return None;
        }

        // 7. Open
        let now_ms = Utc::now().timestamp_millis();
        let position = Position::open(
            pair.clone(),
            pct_diff,
            Leg::new(LegSide::Short, short_source, bid_short),
            Leg::new(LegSide::Long, long_source, ask_long),
            now_ms,
            expenses,
        );
        match self.book.try_add(position) {
            Some(id) => {
                info!(
                    position_id = id,
                    pair = %pair,
                    short = %short_source,
                    long = %long_source,
                    bid_short = %bid_short,
                    ask_long = %ask_long,
                    pct_diff = %pct_diff,
                    "Position opened"
                );
                Some(id)
            }
            None => {
                // Lost the race to a concurrent cycle on the same pair
                warn!(pair = %pair, short = %short_source, long = %long_source, "Entry lost add race, skipped");
                None
            }
        }
    }

    // ── Exit ───────────────────────────────────────────────────

    /// Evaluate every live position touching `source` and close the ones
    /// whose exit condition fires.
    pub async fn evaluate_open(&self, source: crate::types::Source) {
        for id in self.book.positions_touching(source) {
            let Some(position) = self.book.get(id) else {
                continue;
            };
            let Some(quote_short) = quote_with_retry(
                &self.store,
                position.short.source,
                &position.pair,
                self.settings.lookup_retries,
                self.settings.lookup_retry_delay,
            )
            .await
            else {
                warn!(position_id = id, source = %position.short.source, "Short-leg quote missing, skipping evaluation");
                continue;
            };
            let Some(quote_long) = quote_with_retry(
                &self.store,
                position.long.source,
                &position.pair,
                self.settings.lookup_retries,
                self.settings.lookup_retry_delay,
            )
            .await
            else {
                warn!(position_id = id, source = %position.long.source, "Long-leg quote missing, skipping evaluation");
                continue;
            };

            let now_ms = Utc::now().timestamp_millis();

            if self.phase.run_ended() {
                self.close(id, CloseReason::RunEnd, &quote_short, &quote_long);
                continue;
            }

            let elapsed_ms = now_ms - position.start_ms;
            if self.settings.trade_timeout_ms > 0 && elapsed_ms > self.settings.trade_timeout_ms {
                self.close(id, CloseReason::Timeout, &quote_short, &quote_long);
                continue;
            }

            // Mark each leg against the side we would have to transact to
            // unwind: SHORT buys back at the ask, LONG sells into the bid.
            let notional = self.settings.min_notional;
            let pnl_short = position.short.pnl_at(quote_short.ask, notional);
            let pnl_long = position.long.pnl_at(quote_long.bid, notional);
            self.book.with_position_mut(id, |p| {
                p.short.track(pnl_short, now_ms);
                p.long.track(pnl_long, now_ms);
            });

            let income = round_price(pnl_short + pnl_long - position.expenses);

            let profit_target = self.settings.pct_of_notional(self.settings.entry_profit_pct)
                + self.settings.pct_of_notional(self.decayed_exit_pct(elapsed_ms));
            if income >= profit_target {
                self.close(id, CloseReason::Profit, &quote_short, &quote_long);
                continue;
            }

            let detriment_amount = self.settings.pct_of_notional(self.settings.detriment_pct);
            if income <= -detriment_amount && !self.legs_in_sync(pnl_short, pnl_long) {
                self.close(id, CloseReason::Adverse, &quote_short, &quote_long);
            }
        }
    }

    /// Exit-profit percentage after time decay: drops by one step per
    /// elapsed interval, floored at zero.
    fn decayed_exit_pct(&self, elapsed_ms: i64) -> Decimal {
        if self.settings.profit_decay_interval_ms <= 0 {
            return self.settings.exit_profit_pct;
        }
        let steps = elapsed_ms / self.settings.profit_decay_interval_ms;
        let decayed =
            self.settings.exit_profit_pct - self.settings.profit_decay_pct * Decimal::from(steps);
        decayed.max(Decimal::ZERO)
    }

    /// Legs are "in sync" when their absolute PnLs stay within the
    /// configured percentage of each other, relative to the larger value.
    /// That pattern is a market-wide move rather than a spread-specific
    /// failure, so the adverse close is suppressed.
    fn legs_in_sync(&self, pnl_short: Decimal, pnl_long: Decimal) -> bool {
        let abs_short = pnl_short.abs();
        let abs_long = pnl_long.abs();
        let larger = abs_short.max(abs_long);
        if larger.is_zero() {
            return true;
        }
        let gap_pct = (larger - abs_short.min(abs_long)) / larger * Decimal::ONE_HUNDRED;
        gap_pct <= self.settings.desync_pct
    }

    // ── Close ──────────────────────────────────────────────────

    /// Close and remove a position. A second close on the same id is a
    /// logged no-op: the book hands the position out exactly once.
    pub fn close(&self, id: u64, reason: CloseReason, quote_short: &Quote, quote_long: &Quote) {
        let Some(mut position) = self.book.take(id) else {
            error!(position_id = id, reason = %reason, "Close on already-removed position, ignoring");
            return;
        };

        let end_ms = Utc::now().timestamp_millis();
        let fee_short = self.registry.fees(position.short.source);
        let fee_long = self.registry.fees(position.long.source);
        position.finalize(
            reason,
            quote_short.ask,
            quote_long.bid,
            end_ms,
            &fee_short,
            &fee_long,
            self.settings.min_notional,
            &self.settings.reporting_notionals,
        );

        if reason == CloseReason::Adverse {
            self.book.add_cooldown(
                position.short.source,
                position.long.source,
                &position.pair,
                end_ms + self.settings.suspense_ms,
            );
        }

        info!(
            position_id = id,
            pair = %position.pair,
            reason = %reason,
            income = %position.income,
            held_ms = end_ms - position.start_ms,
            "Position closed"
        );

        self.completed.lock().unwrap().push(position);
    }

    /// Drain the completed-not-exported buffer.
    pub fn take_completed(&self) -> Vec<Position> {
        std::mem::take(&mut *self.completed.lock().unwrap())
    }

    pub fn completed_pending(&self) -> usize {
        self.completed.lock().unwrap().len()
    }
}
