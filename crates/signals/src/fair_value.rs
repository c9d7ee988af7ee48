//! Fair-value oracles.
//!
//! A fair value is the estimated probability that the side a move points to
//! wins the window, given how far price has moved from the open and how much
//! of the window has elapsed.
//!
//! Two implementations:
//! - [`StaticFairValue`]: fixed heuristic by signal strength and time.
//! - [`FairValueTable`]: calibrated win rates keyed by move bucket × elapsed
//!   bucket, loaded from a JSON file. Empty or low-sample cells fall back to
//!   the static heuristic.
//!
//! Table file layout:
//!
//! ```json
//! {
//!   "move_bins": ["0.03-0.05", "0.05-0.10", "0.10-0.20", "0.20+"],
//!   "elapsed_bins": ["60-180", "180-420", "420-600", "600-840"],
//!   "bot_table": {
//!     "0.10-0.20": { "600-840": 0.83, "420-600": null },
//!     "0.20+": { "600-840": { "win_rate": 0.91, "count": 12 } }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};
use updown_core::{FairValueOracle, SignalsConfig};

use crate::SignalError;

// =============================================================================
// Static heuristic
// =============================================================================

/// Fixed fair values by signal strength.
#[derive(Debug, Clone)]
pub struct StaticFairValue {
    strong_move_pct: f64,
    strong: f64,
    strong_late: f64,
    late_after_secs: f64,
    moderate: f64,
}

impl StaticFairValue {
    #[must_use]
    pub fn new(strong_move_pct: f64, signals: &SignalsConfig) -> Self {
        Self {
            strong_move_pct,
            strong: signals.strong_fair_value,
            strong_late: signals.strong_late_fair_value,
            late_after_secs: signals.late_after_secs as f64,
            moderate: signals.moderate_fair_value,
        }
    }
}

impl FairValueOracle for StaticFairValue {
    fn lookup(&self, move_pct: f64, elapsed_secs: f64) -> f64 {
        if move_pct.abs() >= self.strong_move_pct {
            if elapsed_secs > self.late_after_secs {
                self.strong_late
            } else {
                self.strong
            }
        } else {
            self.moderate
        }
    }
}

// =============================================================================
// Calibrated table
// =============================================================================

/// Half-open bucket `[lo, hi)`; the last bucket on an axis also includes `hi`.
#[derive(Debug, Clone, PartialEq)]
struct Bucket {
    label: String,
    lo: f64,
    hi: f64,
}

impl Bucket {
    /// Parses "0.05-0.10" or "0.20+".
    fn parse(label: &str) -> Result<Self, SignalError> {
        let bad = || SignalError::BadBucket(label.to_string());
        let trimmed = label.trim();
        let (lo, hi) = if let Some(lo) = trimmed.strip_suffix('+') {
            (lo.parse::<f64>().map_err(|_| bad())?, f64::INFINITY)
        } else {
            let (lo, hi) = trimmed.split_once('-').ok_or_else(bad)?;
            (
                lo.parse::<f64>().map_err(|_| bad())?,
                hi.parse::<f64>().map_err(|_| bad())?,
            )
        };
        if lo >= hi {
            return Err(bad());
        }
        Ok(Self {
            label: label.to_string(),
            lo,
            hi,
        })
    }

    fn contains(&self, x: f64, last: bool) -> bool {
        x >= self.lo && (x < self.hi || (last && x <= self.hi))
    }
}

fn find_bucket(buckets: &[Bucket], x: f64) -> Option<&Bucket> {
    let last = buckets.len().saturating_sub(1);
    buckets
        .iter()
        .enumerate()
        .find(|(i, b)| b.contains(x, *i == last))
        .map(|(_, b)| b)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCell {
    Rate(f64),
    Counted { win_rate: Option<f64>, count: u32 },
}

#[derive(Debug, Deserialize)]
struct RawTable {
    move_bins: Vec<String>,
    elapsed_bins: Vec<String>,
    bot_table: HashMap<String, HashMap<String, Option<RawCell>>>,
}

/// Calibrated win-rate table with a static fallback.
#[derive(Debug, Clone)]
pub struct FairValueTable {
    move_bins: Vec<Bucket>,
    elapsed_bins: Vec<Bucket>,
    cells: HashMap<(String, String), f64>,
    fallback: StaticFairValue,
}

impl FairValueTable {
    /// Parses a table from JSON. Cells with a count below `min_samples` are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON, bad bucket labels, or win rates outside `[0, 1]`.
    pub fn from_json(
        json: &str,
        min_samples: u32,
        fallback: StaticFairValue,
    ) -> Result<Self, SignalError> {
        let raw: RawTable = serde_json::from_str(json)?;
        let move_bins = raw
            .move_bins
            .iter()
            .map(|l| Bucket::parse(l))
            .collect::<Result<Vec<_>, _>>()?;
        let elapsed_bins = raw
            .elapsed_bins
            .iter()
            .map(|l| Bucket::parse(l))
            .collect::<Result<Vec<_>, _>>()?;

        let mut cells = HashMap::new();
        for (move_label, row) in raw.bot_table {
            for (elapsed_label, cell) in row {
                let rate = match cell {
                    Some(RawCell::Rate(r)) => Some(r),
                    Some(RawCell::Counted { win_rate, count }) if count >= min_samples => win_rate,
                    _ => None,
                };
                let Some(rate) = rate else { continue };
                if !(0.0..=1.0).contains(&rate) {
                    return Err(SignalError::BadWinRate {
                        cell: format!("{move_label}/{elapsed_label}"),
                        value: rate,
                    });
                }
                cells.insert((move_label.clone(), elapsed_label), rate);
            }
        }

        Ok(Self {
            move_bins,
            elapsed_bins,
            cells,
            fallback,
        })
    }

    /// Loads a table file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(
        path: impl AsRef<Path>,
        min_samples: u32,
        fallback: StaticFairValue,
    ) -> Result<Self, SignalError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| SignalError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let table = Self::from_json(&json, min_samples, fallback)?;
        info!(
            path = %path.display(),
            cells = table.cells.len(),
            "Loaded fair value table"
        );
        Ok(table)
    }

    /// Number of calibrated cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl FairValueOracle for FairValueTable {
    fn lookup(&self, move_pct: f64, elapsed_secs: f64) -> f64 {
        let abs_move = move_pct.abs();
        let cell = find_bucket(&self.move_bins, abs_move).and_then(|m| {
            find_bucket(&self.elapsed_bins, elapsed_secs)
                .and_then(|e| self.cells.get(&(m.label.clone(), e.label.clone())))
        });

        match cell {
            Some(rate) => *rate,
            None => {
                debug!(move_pct = abs_move, elapsed_secs, "No calibrated cell, using static fair value");
                self.fallback.lookup(move_pct, elapsed_secs)
            }
        }
    }
}

/// Builds the oracle the config asks for: the table when a path is set, else the heuristic.
///
/// # Errors
///
/// Returns an error if a configured table cannot be loaded.
pub fn oracle_from_config(
    strong_move_pct: Decimal,
    signals: &SignalsConfig,
) -> Result<Box<dyn FairValueOracle>, SignalError> {
    let fallback = StaticFairValue::new(strong_move_pct.to_f64().unwrap_or(f64::MAX), signals);
    match &signals.fair_value_table {
        Some(path) => Ok(Box::new(FairValueTable::load(
            path,
            signals.min_samples,
            fallback,
        )?)),
        None => Ok(Box::new(fallback)),
    }
}
