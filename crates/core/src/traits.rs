use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{MarketTokens, TokenMapError, TrendBias};

/// Estimated win probability for the side a move points to.
pub trait FairValueOracle: Send + Sync {
    /// `move_pct` is the absolute move from the window open in percent,
    /// `elapsed_secs` the seconds since the window opened. Returns a value in `[0, 1]`.
    fn lookup(&self, move_pct: f64, elapsed_secs: f64) -> f64;
}

/// Directional filter fed by reference price ticks.
pub trait TrendFilter: Send {
    fn on_price(&mut self, timestamp: DateTime<Utc>, price: Decimal);

    fn bias(&self, now: DateTime<Utc>) -> TrendBias;
}

/// Errors resolving a market's outcome tokens.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("market not found: {0}")]
    NotFound(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("malformed market metadata: {0}")]
    Malformed(String),

    #[error("market not accepting orders: {0}")]
    NotAccepting(String),

    #[error(transparent)]
    TokenMap(#[from] TokenMapError),
}

/// Resolves a market id (slug) to its outcome tokens.
#[async_trait]
pub trait MarketDiscovery: Send + Sync {
    async fn resolve(&self, market_id: &str) -> Result<MarketTokens, DiscoveryError>;
}
