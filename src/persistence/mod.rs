//! CSV Persistence Module
//!
//! Handles storage of completed positions, preloaded candles and run
//! metadata for later analysis. Files are daily, append-only, with headers
//! written once per file.

use anyhow::{Context, Result};
use chrono::Utc;
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::info;

use crate::engine::Position;
use crate::types::Candle;

/// Completed-position row, one per reporting notional
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedPositionRecord {
    pub run_id: String,
    pub position_id: u64,
    pub pair: String,
    pub short_source: String,
    pub long_source: String,
    pub entry_pct_diff: String,
    pub short_open: String,
    pub short_close: String,
    pub long_open: String,
    pub long_close: String,
    pub short_min_pnl: String,
    pub short_min_pnl_ts: i64,
    pub short_max_pnl: String,
    pub short_max_pnl_ts: i64,
    pub long_min_pnl: String,
    pub long_min_pnl_ts: i64,
    pub long_max_pnl: String,
    pub long_max_pnl_ts: i64,
    pub notional: String,
    pub pnl_short: String,
    pub pnl_long: String,
    pub expenses: String,
    pub income: String,
    pub opened_ts: i64,
    pub closed_ts: i64,
    pub close_reason: String,
}

/// Candle row from the preload path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleRecord {
    pub source: String,
    pub pair: String,
    pub timeframe: String,
    pub open_time_ts: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
}

/// One row per run, written at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetaRecord {
    pub run_id: String,
    pub tag: String,
    pub started_ts: i64,
    pub pairs: String,
    pub sources: String,
    pub warmup_secs: i64,
    pub trading_secs: i64,
    pub winddown_secs: i64,
}

/// CSV persistence manager
pub struct CsvPersistence {
    position_writer: Arc<AsyncRwLock<csv::Writer<std::fs::File>>>,
    candle_writer: Arc<AsyncRwLock<csv::Writer<std::fs::File>>>,
    run_writer: Arc<AsyncRwLock<csv::Writer<std::fs::File>>>,
}

impl CsvPersistence {
    /// Create a new CSV persistence manager
    pub fn new(data_dir: &str) -> Result<Self> {
        let data_dir = PathBuf::from(data_dir);

        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        fs::create_dir_all(data_dir.join("positions"))?;
        fs::create_dir_all(data_dir.join("candles"))?;
        fs::create_dir_all(data_dir.join("runs"))?;

        let today = Utc::now().format("%Y-%m-%d");

        let position_writer = Self::create_writer(
            &data_dir.join("positions"),
            &format!("positions_{}.csv", today),
        )?;
        let candle_writer =
            Self::create_writer(&data_dir.join("candles"), &format!("candles_{}.csv", today))?;
        let run_writer =
            Self::create_writer(&data_dir.join("runs"), &format!("runs_{}.csv", today))?;

        Ok(Self {
            position_writer: Arc::new(AsyncRwLock::new(position_writer)),
            candle_writer: Arc::new(AsyncRwLock::new(candle_writer)),
            run_writer: Arc::new(AsyncRwLock::new(run_writer)),
        })
    }

    fn create_writer(dir: &Path, filename: &str) -> Result<csv::Writer<std::fs::File>> {
        let path = dir.join(filename);
        let file_has_data =
            path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open CSV file")?;

        let writer = WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file);

        Ok(writer)
    }

    /// Save one completed-position row
    pub async fn save_position(&self, record: CompletedPositionRecord) -> Result<()> {
        let mut writer = self.position_writer.write().await;
        writer
            .serialize(&record)
            .context("Failed to write position record")?;
        writer.flush().context("Failed to flush position writer")?;
        Ok(())
    }

    /// Save a preloaded candle
    pub async fn save_candle(&self, candle: &Candle) -> Result<()> {
        let record = CandleRecord {
            source: candle.source.to_string(),
            pair: candle.pair.to_string(),
            timeframe: candle.timeframe.clone(),
            open_time_ts: candle.open_time_ms,
            open: candle.open.to_string(),
            high: candle.high.to_string(),
            low: candle.low.to_string(),
            close: candle.close.to_string(),
            volume: candle.volume.to_string(),
        };
        let mut writer = self.candle_writer.write().await;
        writer
            .serialize(&record)
            .context("Failed to write candle record")?;
        writer.flush().context("Failed to flush candle writer")?;
        Ok(())
    }

    /// Save the run metadata row
    pub async fn save_run_meta(&self, record: RunMetaRecord) -> Result<()> {
        let mut writer = self.run_writer.write().await;
        writer
            .serialize(&record)
            .context("Failed to write run record")?;
        writer.flush().context("Failed to flush run writer")?;
        Ok(())
    }

    /// Export a batch of completed positions, one row per reporting
    /// notional. Returns how many rows were written.
    pub async fn export_positions(&self, run_id: &str, positions: &[Position]) -> Result<usize> {
        let mut rows = 0usize;
        for position in positions {
            for record in position_records(run_id, position) {
                self.save_position(record).await?;
                rows += 1;
            }
        }
        if rows > 0 {
            info!(rows, positions = positions.len(), "Exported completed positions");
        }
        Ok(rows)
    }
}

/// Flatten one completed position into CSV rows, one per reporting notional
pub fn position_records(run_id: &str, position: &Position) -> Vec<CompletedPositionRecord> {
    let decimal_or_empty =
        |value: Option<rust_decimal::Decimal>| value.map(|d| d.to_string()).unwrap_or_default();
    let pnl_value = |pnl: Option<(rust_decimal::Decimal, i64)>| decimal_or_empty(pnl.map(|(v, _)| v));
    let pnl_ts = |pnl: Option<(rust_decimal::Decimal, i64)>| pnl.map(|(_, ts)| ts).unwrap_or(0);

    position
        .reports
        .iter()
        .map(|report| CompletedPositionRecord {
            run_id: run_id.to_string(),
            position_id: position.id,
            pair: position.pair.to_string(),
            short_source: position.short.source.to_string(),
            long_source: position.long.source.to_string(),
            entry_pct_diff: position.entry_pct_diff.to_string(),
            short_open: position.short.open_price.to_string(),
            short_close: decimal_or_empty(position.short.close_price),
            long_open: position.long.open_price.to_string(),
            long_close: decimal_or_empty(position.long.close_price),
            short_min_pnl: pnl_value(position.short.min_pnl),
            short_min_pnl_ts: pnl_ts(position.short.min_pnl),
            short_max_pnl: pnl_value(position.short.max_pnl),
            short_max_pnl_ts: pnl_ts(position.short.max_pnl),
            long_min_pnl: pnl_value(position.long.min_pnl),
            long_min_pnl_ts: pnl_ts(position.long.min_pnl),
            long_max_pnl: pnl_value(position.long.max_pnl),
            long_max_pnl_ts: pnl_ts(position.long.max_pnl),
            notional: report.notional.to_string(),
            pnl_short: report.pnl_short.to_string(),
            pnl_long: report.pnl_long.to_string(),
            expenses: report.expenses.to_string(),
            income: report.income.to_string(),
            opened_ts: position.start_ms,
            closed_ts: position.end_ms.unwrap_or(0),
            close_reason: position
                .close_reason
                .map(|r| r.to_string())
                .unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{total_expenses, Leg, Position};
    use crate::sources::FeeSchedule;
    use crate::types::{CloseReason, LegSide, Pair, Source};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn completed_position() -> Position {
        let fees = FeeSchedule {
            fixed_usd: Decimal::ZERO,
            taker_pct: dec!(0.2),
        };
        let mut position = Position::open(
            Pair::new("BTC", "USDT"),
            dec!(5.263),
            Leg::new(LegSide::Short, Source::Binance, dec!(100)),
            Leg::new(LegSide::Long, Source::Bybit, dec!(95)),
            1_000,
            total_expenses(dec!(100), &fees, &fees),
        );
        position.id = 7;
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
        position
    }

    #[test]
    fn test_position_records_one_row_per_notional() {
        let records = position_records("run-1", &completed_position());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].notional, "100");
        assert_eq!(records[1].notional, "500");
        assert_eq!(records[0].close_reason, "PROFIT");
        assert_eq!(records[0].position_id, 7);
    }

    #[tokio::test]
    async fn test_export_writes_header_once() {
        let dir = std::env::temp_dir().join(format!("spreadbot_test_{}", std::process::id()));
        let dir_str = dir.to_string_lossy().to_string();
        let _ = fs::remove_dir_all(&dir);

        let persistence = CsvPersistence::new(&dir_str).unwrap();
        let position = completed_position();
        persistence
            .export_positions("run-1", std::slice::from_ref(&position))
            .await
            .unwrap();
        persistence
            .export_positions("run-1", std::slice::from_ref(&position))
            .await
            .unwrap();

        let today = Utc::now().format("%Y-%m-%d");
        let path = dir.join("positions").join(format!("positions_{}.csv", today));
        let content = fs::read_to_string(path).unwrap();
        let header_rows = content
            .lines()
            .filter(|l| l.starts_with("run_id"))
            .count();
        assert_eq!(header_rows, 1);
        // Two exports x two notionals
        assert_eq!(content.lines().count(), 5);

        let _ = fs::remove_dir_all(&dir);
    }
}
