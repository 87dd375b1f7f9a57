//! Paired positions and fee-adjusted PnL arithmetic
//!
//! A position has a SHORT leg on the source quoting the higher bid and a
//! LONG leg on the source quoting the lower ask. All amounts are computed
//! at fixed decimal scales with round-half-up so reported values are
//! reproducible bit for bit.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::sources::FeeSchedule;
use crate::types::{round_fee, round_price, round_volume, CloseReason, LegSide, Pair, Source};

/// One side of a paired position
#[derive(Debug, Clone, Serialize)]
pub struct Leg {
    pub side: LegSide,
    pub source: Source,
    pub open_price: Decimal,
    pub close_price: Option<Decimal>,
    /// Worst mark-to-market PnL seen and when it occurred (epoch ms)
    pub min_pnl: Option<(Decimal, i64)>,
    /// Best mark-to-market PnL seen and when it occurred (epoch ms)
    pub max_pnl: Option<(Decimal, i64)>,
}

impl Leg {
    pub fn new(side: LegSide, source: Source, open_price: Decimal) -> Self {
        Self {
            side,
            source,
            open_price,
            close_price: None,
            min_pnl: None,
            max_pnl: None,
        }
    }

    /// Mark-to-market PnL of this leg at `mark`, sized by `notional`.
    pub fn pnl_at(&self, mark: Decimal, notional: Decimal) -> Decimal {
        leg_pnl(self.side, self.open_price, mark, notional)
    }

    /// Fold one observed PnL value into the running min/max.
    pub fn track(&mut self, pnl: Decimal, at_ms: i64) {
        match self.min_pnl {
            Some((current, _)) if pnl >= current => {}
            _ => self.min_pnl = Some((pnl, at_ms)),
        }
        match self.max_pnl {
            Some((current, _)) if pnl <= current => {}
            _ => self.max_pnl = Some((pnl, at_ms)),
        }
    }
}

/// `amount_units = notional / open_price`, then price difference times units.
/// SHORT profits when the mark falls below the open, LONG when it rises.
pub fn leg_pnl(side: LegSide, open_price: Decimal, mark: Decimal, notional: Decimal) -> Decimal {
    if open_price.is_zero() {
        return Decimal::ZERO;
    }
    let units = round_volume(notional / open_price);
    match side {
        LegSide::Short => round_price((open_price - mark) * units),
        LegSide::Long => round_price((mark - open_price) * units),
    }
}

/// Total expenses for both legs at one notional: flat deposit/withdraw fees
/// charged once per leg plus the taker percentage of the notional per leg.
pub fn total_expenses(notional: Decimal, fee_short: &FeeSchedule, fee_long: &FeeSchedule) -> Decimal {
    let hundred = Decimal::ONE_HUNDRED;
    round_fee(
        fee_short.fixed_usd
            + fee_long.fixed_usd
            + notional * fee_short.taker_pct / hundred
            + notional * fee_long.taker_pct / hundred,
    )
}

/// PnL/expense/income breakdown at one reporting notional
#[derive(Debug, Clone, Serialize)]
pub struct NotionalReport {
    pub notional: Decimal,
    pub pnl_short: Decimal,
    pub pnl_long: Decimal,
    pub expenses: Decimal,
    pub income: Decimal,
}

/// A live or completed paired position
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    /// Assigned by the position book on insert
    pub id: u64,
    pub pair: Pair,
    /// Percentage difference between the legs at open
    pub entry_pct_diff: Decimal,
    pub short: Leg,
    pub long: Leg,
    pub start_ms: i64,
    pub end_ms: Option<i64>,
    pub close_reason: Option<CloseReason>,
    /// Expenses at the decision notional, fixed at open
    pub expenses: Decimal,
    /// Income at the decision notional, set at close
    pub income: Decimal,
    /// Per-notional breakdowns, computed at close for reporting
    pub reports: Vec<NotionalReport>,
}

impl Position {
    pub fn open(
        pair: Pair,
        entry_pct_diff: Decimal,
        short: Leg,
        long: Leg,
        start_ms: i64,
        expenses: Decimal,
    ) -> Self {
        Self {
            id: 0,
            pair,
            entry_pct_diff,
            short,
            long,
            start_ms,
            end_ms: None,
            close_reason: None,
            expenses,
            income: Decimal::ZERO,
            reports: Vec::new(),
        }
    }

    /// The unordered source pair this position occupies
    pub fn sources(&self) -> (Source, Source) {
        (self.short.source, self.long.source)
    }

    pub fn touches(&self, source: Source) -> bool {
        self.short.source == source || self.long.source == source
    }

    /// Finalize close prices and compute the per-notional reports.
    pub fn finalize(
        &mut self,
        reason: CloseReason,
        short_close: Decimal,
        long_close: Decimal,
        end_ms: i64,
        fee_short: &FeeSchedule,
        fee_long: &FeeSchedule,
        decision_notional: Decimal,
        reporting_notionals: &[Decimal],
    ) {
        self.short.close_price = Some(short_close);
        self.long.close_price = Some(long_close);
        self.end_ms = Some(end_ms);
        self.close_reason = Some(reason);

        self.reports = reporting_notionals
            .iter()
            .map(|&notional| {
                let pnl_short = self.short.pnl_at(short_close, notional);
                let pnl_long = self.long.pnl_at(long_close, notional);
                let expenses = total_expenses(notional, fee_short, fee_long);
                NotionalReport {
                    notional,
                    pnl_short,
                    pnl_long,
                    expenses,
                    income: round_price(pnl_short + pnl_long - expenses),
                }
            })
            .collect();

        let pnl_short = self.short.pnl_at(short_close, decision_notional);
        let pnl_long = self.long.pnl_at(long_close, decision_notional);
        self.income = round_price(pnl_short + pnl_long - self.expenses);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn flat_fee(taker_pct: Decimal) -> FeeSchedule {
        FeeSchedule {
            fixed_usd: Decimal::ZERO,
            taker_pct,
        }
    }

    #[test]
    fn test_short_leg_pnl() {
        // notional 100 at open 100 -> 1 unit; close 98 -> +2
        assert_eq!(
            leg_pnl(LegSide::Short, dec!(100), dec!(98), dec!(100)),
            dec!(2)
        );
        assert_eq!(
            leg_pnl(LegSide::Short, dec!(100), dec!(103), dec!(100)),
            dec!(-3)
        );
    }

    #[test]
    fn test_long_leg_pnl() {
        assert_eq!(
            leg_pnl(LegSide::Long, dec!(50), dec!(55), dec!(100)),
            dec!(10)
        );
        assert_eq!(leg_pnl(LegSide::Long, dec!(50), dec!(45), dec!(100)), dec!(-10));
    }

    #[test]
    fn test_zero_open_price_guard() {
        assert_eq!(
            leg_pnl(LegSide::Short, Decimal::ZERO, dec!(1), dec!(100)),
            Decimal::ZERO
        );
    }

    #[test]
    fn test_total_expenses_taker_only() {
        // 0.2% per leg on 100 -> 0.4
        let fees = flat_fee(dec!(0.2));
        assert_eq!(total_expenses(dec!(100), &fees, &fees), dec!(0.4));
    }

    #[test]
    fn test_total_expenses_with_fixed() {
        let fee_short = FeeSchedule {
            fixed_usd: dec!(1.5),
            taker_pct: dec!(0.1),
        };
        let fee_long = FeeSchedule {
            fixed_usd: dec!(2),
            taker_pct: dec!(0.1),
        };
        // 1.5 + 2 + 0.1 + 0.1 = 3.7, fixed fees independent of notional
        assert_eq!(total_expenses(dec!(100), &fee_short, &fee_long), dec!(3.7));
        assert_eq!(total_expenses(dec!(200), &fee_short, &fee_long), dec!(3.9));
    }

    #[test]
    fn test_min_max_tracking() {
        let mut leg = Leg::new(LegSide::Short, Source::Binance, dec!(100));
        leg.track(dec!(1), 10);
        leg.track(dec!(-2), 20);
        leg.track(dec!(0.5), 30);

        assert_eq!(leg.min_pnl, Some((dec!(-2), 20)));
        assert_eq!(leg.max_pnl, Some((dec!(1), 10)));
    }

    #[test]
    fn test_finalize_reports_per_notional() {
        let short = Leg::new(LegSide::Short, Source::Binance, dec!(100));
        let long = Leg::new(LegSide::Long, Source::Bybit, dec!(95));
        let fees = flat_fee(dec!(0.2));
        let mut position = Position::open(
            Pair::new("BTC", "USDT"),
            dec!(5.263),
            short,
            long,
            1_000,
            total_expenses(dec!(100), &fees, &fees),
        );

        position.finalize(
            CloseReason::Profit,
            dec!(97),
            dec!(97),
            2_000,
            &fees,
            &fees,
            dec!(100),
            &[dec!(100), dec!(500)],
        );

        assert_eq!(position.reports.len(), 2);
        let at_100 = &position.reports[0];
        // SHORT: (100 - 97) * 1 = 3; LONG: (97 - 95) * 1.053 = 2.106
        assert_eq!(at_100.pnl_short, dec!(3));
        assert_eq!(at_100.pnl_long, dec!(2.106));
        assert_eq!(at_100.expenses, dec!(0.4));
        assert_eq!(at_100.income, dec!(4.706));
        assert_eq!(position.income, at_100.income);
        assert_eq!(position.close_reason, Some(CloseReason::Profit));
    }
}
