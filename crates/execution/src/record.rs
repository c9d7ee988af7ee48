//! Per-interval trade records.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use updown_core::{BookSummary, Outcome};

use crate::interval::Interval;
use crate::position::{ExitTrigger, PositionState};

/// How a traded interval ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitKind {
    Dynamic,
    Target,
    Forced,
    Expiry,
    Abandoned,
    Faulted,
    /// The buy was accepted but nothing filled.
    Unfilled,
}

impl From<ExitTrigger> for ExitKind {
    fn from(trigger: ExitTrigger) -> Self {
        match trigger {
            ExitTrigger::Dynamic => Self::Dynamic,
            ExitTrigger::Target => Self::Target,
            ExitTrigger::Forced => Self::Forced,
        }
    }
}

/// Summary of one resolved, traded interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalRecord {
    pub interval_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub side: Option<Outcome>,
    pub token_id: Option<String>,
    pub entry_price: Option<Decimal>,
    /// VWAP of all sells.
    pub exit_price: Option<Decimal>,
    pub shares_requested: Decimal,
    pub shares_filled: Decimal,
    pub shares_sold: Decimal,
    pub fee_shares: Decimal,
    pub cost: Decimal,
    pub realized_proceeds: Decimal,
    pub final_pnl: Decimal,
    pub exit_kind: ExitKind,
    pub early_exit: bool,
    pub winner: Outcome,
    pub open_price: Decimal,
    pub close_price: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub entry_book: Option<BookSummary>,
    pub entry_edge: Option<Decimal>,
    pub entry_fair_value: Option<Decimal>,
    pub entry_elapsed_secs: Option<i64>,
    pub fault: Option<String>,
}

impl IntervalRecord {
    /// Builds the record of a settled interval. `final_pnl` comes from settlement.
    #[must_use]
    pub fn from_interval(interval: &Interval, final_pnl: Decimal) -> Self {
        let winner = interval.winner();
        let entry = interval.entry.as_ref();
        let mut record = Self {
            interval_id: interval.id.clone(),
            start: interval.start,
            end: interval.end,
            side: None,
            token_id: None,
            entry_price: None,
            exit_price: None,
            shares_requested: Decimal::ZERO,
            shares_filled: Decimal::ZERO,
            shares_sold: Decimal::ZERO,
            fee_shares: Decimal::ZERO,
            cost: Decimal::ZERO,
            realized_proceeds: Decimal::ZERO,
            final_pnl,
            exit_kind: ExitKind::Unfilled,
            early_exit: false,
            winner,
            open_price: interval.open_price,
            close_price: interval.last,
            high: interval.high,
            low: interval.low,
            entry_book: entry.map(|e| e.book),
            entry_edge: entry.map(|e| e.edge),
            entry_fair_value: entry.map(|e| e.fair_value),
            entry_elapsed_secs: entry.map(|e| e.elapsed_secs),
            fault: None,
        };

        if let Some(p) = &interval.position {
            record.side = Some(p.outcome);
            record.token_id = Some(p.token_id.clone());
            record.entry_price = Some(p.entry_price);
            record.exit_price = p.exit_price();
            record.shares_requested = p.requested_shares;
            record.shares_filled = p.filled_shares;
            record.shares_sold = p.shares_sold;
            record.fee_shares = p.fee_shares;
            record.cost = p.cost();
            record.realized_proceeds = p.realized_proceeds;
            record.early_exit = p.shares_sold > Decimal::ZERO;
            record.fault = p.fault.clone();
            record.exit_kind = match p.state {
                PositionState::Faulted => ExitKind::Faulted,
                PositionState::Abandoned => ExitKind::Abandoned,
                _ if p.open_shares.is_zero() => {
                    p.last_exit.map_or(ExitKind::Expiry, ExitKind::from)
                }
                _ => ExitKind::Expiry,
            };
        }
        record
    }
}

/// Errors writing records.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Destination for interval records.
pub trait RecordSink: Send + Sync {
    /// Persists one record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be written.
    fn emit(&self, record: &IntervalRecord) -> Result<(), RecordError>;
}

/// Appends records as JSON lines.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    /// Creates the sink, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for JsonlSink {
    fn emit(&self, record: &IntervalRecord) -> Result<(), RecordError> {
        let line = serde_json::to_string(record)?;
        let _guard = self.lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<IntervalRecord>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<IntervalRecord> {
        self.records.lock().clone()
    }
}

impl RecordSink for MemorySink {
    fn emit(&self, record: &IntervalRecord) -> Result<(), RecordError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Discards records.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RecordSink for NullSink {
    fn emit(&self, _record: &IntervalRecord) -> Result<(), RecordError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fill::{FillRecord, FillStatus, PriceSource};
    use crate::position::{ExitBudgets, Position};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use updown_core::TrendBias;

    fn interval_with_position() -> Interval {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut iv = Interval::new("btc-updown-15m", start, dec!(100000), false);
        iv.on_price(dec!(100100));
        let fill = FillRecord {
            order_id: "b1".to_string(),
            requested_size: dec!(7),
            limit_price: dec!(0.71),
            matched_size: dec!(7),
            price: dec!(0.70),
            price_source: PriceSource::Venue,
            status: FillStatus::Filled,
        };
        iv.position = Some(
            Position::open(
                iv.id.clone(),
                Outcome::Up,
                "tok-up",
                &fill,
                None,
                ExitBudgets::new(3, 10, 3),
                TrendBias::Neutral,
                start,
            )
            .unwrap(),
        );
        iv
    }

    #[test]
    fn test_record_exit_kinds() {
        let mut iv = interval_with_position();
        let pnl = iv.position.as_mut().unwrap().settle(Outcome::Up);
        let record = IntervalRecord::from_interval(&iv, pnl);
        assert_eq!(record.exit_kind, ExitKind::Expiry);
        assert!(!record.early_exit);
        assert_eq!(record.final_pnl, dec!(2.10));
        assert_eq!(record.cost, dec!(4.90));

        let mut iv = interval_with_position();
        let pos = iv.position.as_mut().unwrap();
        pos.apply_sell(dec!(7), dec!(0.78), ExitTrigger::Forced).unwrap();
        let pnl = pos.settle(Outcome::Down);
        let record = IntervalRecord::from_interval(&iv, pnl);
        assert_eq!(record.exit_kind, ExitKind::Forced);
        assert!(record.early_exit);
        assert_eq!(record.exit_price, Some(dec!(0.78)));
        assert_eq!(record.final_pnl, dec!(0.56));

        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut unfilled = Interval::new("p", start, dec!(1), false);
        unfilled.traded = true;
        let record = IntervalRecord::from_interval(&unfilled, Decimal::ZERO);
        assert_eq!(record.exit_kind, ExitKind::Unfilled);
        assert_eq!(record.side, None);
    }

    #[test]
    fn test_jsonl_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("intervals.jsonl");
        let sink = JsonlSink::new(&path).unwrap();

        let mut iv = interval_with_position();
        let pnl = iv.position.as_mut().unwrap().settle(Outcome::Up);
        let record = IntervalRecord::from_interval(&iv, pnl);
        sink.emit(&record).unwrap();
        sink.emit(&record).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let back: IntervalRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        let iv = interval_with_position();
        sink.emit(&IntervalRecord::from_interval(&iv, dec!(1))).unwrap();
        assert_eq!(sink.records().len(), 1);
    }
}
