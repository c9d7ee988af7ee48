//! Per-window interval state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use updown_core::{market_slug, window_end, BookSummary, MarketTokens, Outcome};

use crate::entry::EntryRejection;
use crate::position::Position;

/// Lifecycle phase, derived from the interval's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalPhase {
    /// First window after startup; never traded.
    Skipped,
    Armed,
    /// Buy in flight.
    Evaluating,
    Positioned,
    /// Sell in flight.
    Exiting,
    Resolved,
}

/// Entry details kept for the interval record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub book: BookSummary,
    pub edge: Decimal,
    pub fair_value: Decimal,
    pub elapsed_secs: i64,
}

/// One market window.
#[derive(Debug, Clone)]
pub struct Interval {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub open_price: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub last: Decimal,
    pub skipped: bool,
    /// Set once the gateway accepted a buy.
    pub traded: bool,
    /// Buy in flight.
    pub evaluating: bool,
    pub tokens: Option<MarketTokens>,
    pub discovery_in_flight: bool,
    pub position: Option<Position>,
    pub entry: Option<EntrySnapshot>,
    pub resolved: bool,
}

impl Interval {
    /// Creates the interval from its first tick, which latches the open.
    #[must_use]
    pub fn new(slug_prefix: &str, start: DateTime<Utc>, open_price: Decimal, skipped: bool) -> Self {
        Self {
            id: market_slug(slug_prefix, start),
            start,
            end: window_end(start),
            open_price,
            high: open_price,
            low: open_price,
            last: open_price,
            skipped,
            traded: false,
            evaluating: false,
            tokens: None,
            discovery_in_flight: false,
            position: None,
            entry: None,
            resolved: false,
        }
    }

    pub fn on_price(&mut self, price: Decimal) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.last = price;
    }

    #[must_use]
    pub fn phase(&self) -> IntervalPhase {
        if self.resolved {
            IntervalPhase::Resolved
        } else if self.skipped {
            IntervalPhase::Skipped
        } else if self.evaluating {
            IntervalPhase::Evaluating
        } else if let Some(position) = &self.position {
            if position.exit_in_progress {
                IntervalPhase::Exiting
            } else {
                IntervalPhase::Positioned
            }
        } else {
            IntervalPhase::Armed
        }
    }

    /// Signed move from the open in percent.
    #[must_use]
    pub fn move_pct(&self) -> Decimal {
        if self.open_price.is_zero() {
            return Decimal::ZERO;
        }
        (self.last - self.open_price) / self.open_price * Decimal::ONE_HUNDRED
    }

    #[must_use]
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.start).num_seconds()
    }

    #[must_use]
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.end - now).num_seconds()
    }

    #[must_use]
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        now >= self.end
    }

    /// Winner by the last observed price; ties go to `Up`.
    #[must_use]
    pub fn winner(&self) -> Outcome {
        Outcome::settle(self.open_price, self.last)
    }

    /// Interval-state entry checks.
    ///
    /// # Errors
    ///
    /// Returns why this interval cannot enter right now.
    pub fn entry_gate(&self) -> Result<&MarketTokens, EntryRejection> {
        if self.skipped || self.resolved {
            return Err(EntryRejection::Skipped);
        }
        if self.traded || self.position.is_some() {
            return Err(EntryRejection::AlreadyTraded);
        }
        if self.evaluating {
            return Err(EntryRejection::InFlight);
        }
        self.tokens.as_ref().ok_or(EntryRejection::MarketUnknown)
    }

    /// Returns true if work is still outstanding for this interval.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.evaluating
            || self.discovery_in_flight
            || self
                .position
                .as_ref()
                .is_some_and(|p| p.exit_in_progress || p.target_poll_in_flight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn tokens() -> MarketTokens {
        MarketTokens {
            market_id: "m".to_string(),
            up_token: "u".to_string(),
            down_token: "d".to_string(),
        }
    }

    #[test]
    fn test_new_latches_open() {
        let iv = Interval::new("btc-updown-15m", start(), dec!(97000), false);
        assert_eq!(iv.id, "btc-updown-15m-1767225600");
        assert_eq!(iv.end, start() + chrono::Duration::seconds(900));
        assert_eq!(iv.phase(), IntervalPhase::Armed);
        assert_eq!(iv.move_pct(), Decimal::ZERO);
    }

    #[test]
    fn test_range_and_move() {
        let mut iv = Interval::new("p", start(), dec!(100000), false);
        iv.on_price(dec!(100150));
        iv.on_price(dec!(99900));
        iv.on_price(dec!(100200));
        assert_eq!(iv.high, dec!(100200));
        assert_eq!(iv.low, dec!(99900));
        assert_eq!(iv.move_pct(), dec!(0.2));
        assert_eq!(iv.winner(), Outcome::Up);
    }

    #[test]
    fn test_tie_wins_up() {
        let mut iv = Interval::new("p", start(), dec!(100000), false);
        iv.on_price(dec!(99000));
        iv.on_price(dec!(100000));
        assert_eq!(iv.winner(), Outcome::Up);
    }

    #[test]
    fn test_entry_gate() {
        let mut iv = Interval::new("p", start(), dec!(100), true);
        assert_eq!(iv.entry_gate().unwrap_err(), EntryRejection::Skipped);
        assert_eq!(iv.phase(), IntervalPhase::Skipped);

        iv.skipped = false;
        assert_eq!(iv.entry_gate().unwrap_err(), EntryRejection::MarketUnknown);

        iv.tokens = Some(tokens());
        assert!(iv.entry_gate().is_ok());

        iv.evaluating = true;
        assert_eq!(iv.entry_gate().unwrap_err(), EntryRejection::InFlight);
        assert_eq!(iv.phase(), IntervalPhase::Evaluating);
        assert!(iv.is_busy());

        iv.evaluating = false;
        iv.traded = true;
        assert_eq!(iv.entry_gate().unwrap_err(), EntryRejection::AlreadyTraded);
    }

    #[test]
    fn test_time_math() {
        let iv = Interval::new("p", start(), dec!(100), false);
        let t = start() + chrono::Duration::seconds(845);
        assert_eq!(iv.elapsed_secs(t), 845);
        assert_eq!(iv.remaining_secs(t), 55);
        assert!(!iv.has_ended(t));
        assert!(iv.has_ended(iv.end));
    }
}
