//! Reference signal implementations: fair-value oracles and trend filters.

pub mod fair_value;
pub mod trend;

use thiserror::Error;

pub use fair_value::{oracle_from_config, FairValueTable, StaticFairValue};
pub use trend::{ema_series, tema, CrossoverTracker, TemaTrend};

/// Errors loading signal inputs.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid fair value table: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid bucket label: {0}")]
    BadBucket(String),

    #[error("win rate out of range in cell {cell}: {value}")]
    BadWinRate { cell: String, value: f64 },
}
