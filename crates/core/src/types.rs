//! Shared domain types: outcomes, trend bias, book snapshots, market windows.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of one market window in seconds.
pub const WINDOW_SECS: i64 = 900;

// =============================================================================
// Outcome / Bias
// =============================================================================

/// One of the two mutually exclusive outcome tokens of an up/down market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// Reference price closes at or above the window open.
    Up,
    /// Reference price closes below the window open.
    Down,
}

impl Outcome {
    /// Returns the other outcome.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }

    /// Determines the winning outcome from open and close reference prices.
    ///
    /// A tie resolves as `Up`.
    #[must_use]
    pub fn settle(open: Decimal, close: Decimal) -> Self {
        if close >= open {
            Self::Up
        } else {
            Self::Down
        }
    }

    /// Parses a market outcome label ("Up", "DOWN", ...).
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "up" | "yes" => Some(Self::Up),
            "down" | "no" => Some(Self::Down),
            _ => None,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "Up"),
            Self::Down => write!(f, "Down"),
        }
    }
}

/// Directional bias reported by a trend filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrendBias {
    Up,
    Down,
    Neutral,
}

impl TrendBias {
    /// Returns true if the bias points against `outcome`. `Neutral` never opposes.
    #[must_use]
    pub fn opposes(self, outcome: Outcome) -> bool {
        matches!(
            (self, outcome),
            (Self::Up, Outcome::Down) | (Self::Down, Outcome::Up)
        )
    }

    /// Returns true if the bias points the same way as `outcome`.
    #[must_use]
    pub fn agrees(self, outcome: Outcome) -> bool {
        matches!(
            (self, outcome),
            (Self::Up, Outcome::Up) | (Self::Down, Outcome::Down)
        )
    }
}

impl std::fmt::Display for TrendBias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "Up"),
            Self::Down => write!(f, "Down"),
            Self::Neutral => write!(f, "Neutral"),
        }
    }
}

// =============================================================================
// Order Book Snapshot
// =============================================================================

/// A single price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    #[must_use]
    pub const fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Top-of-book view of one outcome token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub token_id: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp: DateTime<Utc>,
}

impl BookSnapshot {
    #[must_use]
    pub fn new(
        token_id: impl Into<String>,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            token_id: token_id.into(),
            bids,
            asks,
            timestamp,
        }
    }

    /// Highest bid, if any.
    #[must_use]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.iter().map(|l| l.price).max()
    }

    /// Lowest ask, if any.
    #[must_use]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.iter().map(|l| l.price).min()
    }

    /// Ask minus bid, or zero for a crossed/locked book. `None` when a side is empty.
    #[must_use]
    pub fn spread(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some((ask - bid).max(Decimal::ZERO))
    }

    /// Dollar depth resting on the bid side.
    #[must_use]
    pub fn bid_depth(&self) -> Decimal {
        self.bids.iter().map(|l| l.price * l.size).sum()
    }

    /// Dollar depth resting on the ask side.
    #[must_use]
    pub fn ask_depth(&self) -> Decimal {
        self.asks.iter().map(|l| l.price * l.size).sum()
    }

    /// Condensed view for logging and interval records.
    #[must_use]
    pub fn summary(&self) -> BookSummary {
        BookSummary {
            best_bid: self.best_bid(),
            best_ask: self.best_ask(),
            spread: self.spread(),
            bid_depth: self.bid_depth(),
            ask_depth: self.ask_depth(),
        }
    }
}

/// Book figures captured at a decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSummary {
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub spread: Option<Decimal>,
    pub bid_depth: Decimal,
    pub ask_depth: Decimal,
}

// =============================================================================
// Market tokens
// =============================================================================

/// Errors mapping market metadata to outcome tokens.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenMapError {
    #[error("outcome and token lists differ in length: {outcomes} vs {tokens}")]
    LengthMismatch { outcomes: usize, tokens: usize },

    #[error("unknown outcome label: {0}")]
    UnknownLabel(String),

    #[error("missing token for outcome {0}")]
    MissingOutcome(Outcome),
}

/// The two outcome tokens of one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketTokens {
    pub market_id: String,
    pub up_token: String,
    pub down_token: String,
}

impl MarketTokens {
    /// Builds the mapping from parallel outcome-label and token-id lists.
    ///
    /// Labels decide the mapping, never the list order.
    ///
    /// # Errors
    ///
    /// Fails on mismatched lengths, unknown labels, or a missing outcome.
    pub fn from_outcomes(
        market_id: impl Into<String>,
        outcomes: &[String],
        token_ids: &[String],
    ) -> Result<Self, TokenMapError> {
        if outcomes.len() != token_ids.len() {
            return Err(TokenMapError::LengthMismatch {
                outcomes: outcomes.len(),
                tokens: token_ids.len(),
            });
        }

        let mut up = None;
        let mut down = None;
        for (label, token) in outcomes.iter().zip(token_ids) {
            match Outcome::from_label(label) {
                Some(Outcome::Up) => up = Some(token.clone()),
                Some(Outcome::Down) => down = Some(token.clone()),
                None => return Err(TokenMapError::UnknownLabel(label.clone())),
            }
        }

        Ok(Self {
            market_id: market_id.into(),
            up_token: up.ok_or(TokenMapError::MissingOutcome(Outcome::Up))?,
            down_token: down.ok_or(TokenMapError::MissingOutcome(Outcome::Down))?,
        })
    }

    /// Token id for an outcome.
    #[must_use]
    pub fn token_for(&self, outcome: Outcome) -> &str {
        match outcome {
            Outcome::Up => &self.up_token,
            Outcome::Down => &self.down_token,
        }
    }

    /// Outcome a token id belongs to.
    #[must_use]
    pub fn outcome_for(&self, token_id: &str) -> Option<Outcome> {
        if token_id == self.up_token {
            Some(Outcome::Up)
        } else if token_id == self.down_token {
            Some(Outcome::Down)
        } else {
            None
        }
    }
}

// =============================================================================
// Window math
// =============================================================================

/// Start of the 15-minute window containing `ts` (aligned to :00/:15/:30/:45).
#[must_use]
pub fn window_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let aligned = secs - secs.rem_euclid(WINDOW_SECS);
    Utc.timestamp_opt(aligned, 0).single().unwrap_or(ts)
}

/// End of the window starting at `start`.
#[must_use]
pub fn window_end(start: DateTime<Utc>) -> DateTime<Utc> {
    start + Duration::seconds(WINDOW_SECS)
}

/// Market slug for a window, e.g. `btc-updown-15m-1767225600`.
#[must_use]
pub fn market_slug(prefix: &str, start: DateTime<Utc>) -> String {
    format!("{prefix}-{}", start.timestamp())
}
