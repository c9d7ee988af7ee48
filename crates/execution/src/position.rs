//! Position accounting.
//!
//! A [`Position`] is created from a confirmed non-zero buy fill and then only
//! moves through incremental updates:
//!
//! - sell fills add `(price − entry) × size` to realized P&L;
//! - a balance below `open_shares` (fee deduction) is charged at entry price;
//! - resting target reports are cumulative, so only the unseen delta is applied;
//! - at expiry the remaining shares are valued at the payout.
//!
//! `open_shares` never increases and never goes negative. An update that
//! would make it negative faults the position instead.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use updown_core::{Outcome, TrendBias};

use crate::fill::FillRecord;

/// Position lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Open,
    PartiallySold,
    FullyExited,
    ResolvedByExpiry,
    /// Forced-exit budget exhausted; no further sells. Shares are still valued at expiry.
    Abandoned,
    /// An accounting invariant was violated; no further sells.
    Faulted,
}

impl PositionState {
    /// Returns true if the exit policy may still sell.
    #[must_use]
    pub fn can_exit(&self) -> bool {
        matches!(self, Self::Open | Self::PartiallySold)
    }
}

/// Exit trigger that produced a sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitTrigger {
    Dynamic,
    Target,
    Forced,
}

impl std::fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dynamic => write!(f, "dynamic"),
            Self::Target => write!(f, "target"),
            Self::Forced => write!(f, "forced"),
        }
    }
}

/// Accounting invariant violations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PositionError {
    #[error("cannot open a position from an empty fill ({0})")]
    EmptyFill(String),

    #[error("sell of {sold} exceeds open shares {open}")]
    Oversold { sold: Decimal, open: Decimal },

    #[error("negative fill size {0}")]
    NegativeFill(Decimal),
}

/// Per-trigger attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptBudget {
    pub used: u32,
    pub max: u32,
}

impl AttemptBudget {
    #[must_use]
    pub const fn new(max: u32) -> Self {
        Self { used: 0, max }
    }

    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.used >= self.max
    }

    /// Consumes one attempt. Returns false if none were left.
    pub fn consume(&mut self) -> bool {
        if self.exhausted() {
            return false;
        }
        self.used += 1;
        true
    }
}

/// Resting profit-target order and the part of its fill already accounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestingTarget {
    pub order_id: String,
    pub size: Decimal,
    pub price: Decimal,
    /// Cumulative matched shares already applied to the position.
    pub accounted: Decimal,
    /// Cumulative proceeds already applied to the position.
    pub accounted_proceeds: Decimal,
}

impl RestingTarget {
    #[must_use]
    pub fn new(order_id: impl Into<String>, size: Decimal, price: Decimal) -> Self {
        Self {
            order_id: order_id.into(),
            size,
            price,
            accounted: Decimal::ZERO,
            accounted_proceeds: Decimal::ZERO,
        }
    }
}

/// Dynamic-exit tracking: the last crossover bias seen and whether an adverse
/// cross is waiting to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicState {
    pub last_bias: TrendBias,
    pub pending_adverse: bool,
}

/// Budgets for the three exit triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitBudgets {
    pub dynamic: AttemptBudget,
    pub target: AttemptBudget,
    pub forced: AttemptBudget,
}

impl ExitBudgets {
    #[must_use]
    pub const fn new(dynamic: u32, target: u32, forced: u32) -> Self {
        Self {
            dynamic: AttemptBudget::new(dynamic),
            target: AttemptBudget::new(target),
            forced: AttemptBudget::new(forced),
        }
    }

    pub fn get_mut(&mut self, trigger: ExitTrigger) -> &mut AttemptBudget {
        match trigger {
            ExitTrigger::Dynamic => &mut self.dynamic,
            ExitTrigger::Target => &mut self.target,
            ExitTrigger::Forced => &mut self.forced,
        }
    }

    #[must_use]
    pub fn get(&self, trigger: ExitTrigger) -> &AttemptBudget {
        match trigger {
            ExitTrigger::Dynamic => &self.dynamic,
            ExitTrigger::Target => &self.target,
            ExitTrigger::Forced => &self.forced,
        }
    }
}

/// Holdings in one outcome token for one interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub interval_id: String,
    pub outcome: Outcome,
    pub token_id: String,
    pub entry_price: Decimal,
    pub requested_shares: Decimal,
    pub filled_shares: Decimal,
    /// Authoritative remaining shares.
    pub open_shares: Decimal,
    pub shares_sold: Decimal,
    pub realized_proceeds: Decimal,
    pub realized_pnl: Decimal,
    /// Shares lost to venue fee deduction.
    pub fee_shares: Decimal,
    pub opened_at: DateTime<Utc>,
    pub state: PositionState,
    pub budgets: ExitBudgets,
    pub exit_in_progress: bool,
    pub target: Option<RestingTarget>,
    /// Earliest time the next target placement may be tried.
    pub target_retry_at: Option<DateTime<Utc>>,
    pub target_poll_in_flight: bool,
    pub dynamic: DynamicState,
    pub last_exit: Option<ExitTrigger>,
    pub fault: Option<String>,
}

impl Position {
    /// Opens a position from a confirmed buy fill.
    ///
    /// When a balance is known and lies strictly between zero and the filled
    /// size, the difference is treated as fee shrink. A zero balance is
    /// settlement lag and leaves the filled size in place.
    ///
    /// # Errors
    ///
    /// Returns [`PositionError::EmptyFill`] if nothing matched.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        interval_id: impl Into<String>,
        outcome: Outcome,
        token_id: impl Into<String>,
        fill: &FillRecord,
        balance: Option<Decimal>,
        budgets: ExitBudgets,
        bias: TrendBias,
        now: DateTime<Utc>,
    ) -> Result<Self, PositionError> {
        if fill.is_empty() {
            return Err(PositionError::EmptyFill(fill.order_id.clone()));
        }

        let mut position = Self {
            interval_id: interval_id.into(),
            outcome,
            token_id: token_id.into(),
            entry_price: fill.price,
            requested_shares: fill.requested_size,
            filled_shares: fill.matched_size,
            open_shares: fill.matched_size,
            shares_sold: Decimal::ZERO,
            realized_proceeds: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            fee_shares: Decimal::ZERO,
            opened_at: now,
            state: PositionState::Open,
            budgets,
            exit_in_progress: false,
            target: None,
            target_retry_at: None,
            target_poll_in_flight: false,
            dynamic: DynamicState {
                last_bias: bias,
                pending_adverse: false,
            },
            last_exit: None,
            fault: None,
        };
        if let Some(balance) = balance.filter(|b| *b > Decimal::ZERO) {
            position.apply_balance(balance);
        }
        Ok(position)
    }

    /// Dollar cost of the filled shares.
    #[must_use]
    pub fn cost(&self) -> Decimal {
        self.entry_price * self.filled_shares
    }

    /// Lowers `open_shares` to a smaller confirmed balance, charging the
    /// difference at entry price. Returns the shrink applied.
    pub fn apply_balance(&mut self, balance: Decimal) -> Decimal {
        let balance = balance.max(Decimal::ZERO);
        if balance >= self.open_shares {
            return Decimal::ZERO;
        }
        let shrink = self.open_shares - balance;
        self.open_shares = balance;
        self.fee_shares += shrink;
        self.realized_pnl -= shrink * self.entry_price;
        shrink
    }

    /// Applies a sell fill of `size` shares at `price`.
    ///
    /// # Errors
    ///
    /// Returns [`PositionError::Oversold`] and faults the position if `size`
    /// exceeds `open_shares`.
    pub fn apply_sell(
        &mut self,
        size: Decimal,
        price: Decimal,
        trigger: ExitTrigger,
    ) -> Result<(), PositionError> {
        if size < Decimal::ZERO {
            let err = PositionError::NegativeFill(size);
            self.fault(&err);
            return Err(err);
        }
        if size == Decimal::ZERO {
            return Ok(());
        }
        if size > self.open_shares {
            let err = PositionError::Oversold {
                sold: size,
                open: self.open_shares,
            };
            self.fault(&err);
            return Err(err);
        }

        self.open_shares -= size;
        self.shares_sold += size;
        self.realized_proceeds += size * price;
        self.realized_pnl += (price - self.entry_price) * size;
        self.last_exit = Some(trigger);
        if self.state.can_exit() {
            self.state = if self.open_shares.is_zero() {
                PositionState::FullyExited
            } else {
                PositionState::PartiallySold
            };
        }
        Ok(())
    }

    /// Applies a cumulative fill report of the resting target. Returns the
    /// newly matched shares.
    ///
    /// # Errors
    ///
    /// Propagates [`PositionError`] from the sell update.
    pub fn apply_target_fill(
        &mut self,
        cumulative_matched: Decimal,
        avg_price: Decimal,
    ) -> Result<Decimal, PositionError> {
        let Some(target) = self.target.as_ref() else {
            return Ok(Decimal::ZERO);
        };
        let matched = cumulative_matched.min(target.size);
        let delta = matched - target.accounted;
        if delta <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        let proceeds = (matched * avg_price - target.accounted_proceeds).max(Decimal::ZERO);
        let price = proceeds / delta;

        self.apply_sell(delta, price, ExitTrigger::Target)?;
        if let Some(target) = self.target.as_mut() {
            target.accounted = matched;
            target.accounted_proceeds += proceeds;
        }
        Ok(delta)
    }

    /// Settles remaining shares against the winning outcome and returns the
    /// final interval P&L.
    pub fn settle(&mut self, winner: Outcome) -> Decimal {
        let payout = if winner == self.outcome {
            Decimal::ONE
        } else {
            Decimal::ZERO
        };
        self.realized_pnl += self.open_shares * (payout - self.entry_price);
        if self.state.can_exit() {
            self.state = PositionState::ResolvedByExpiry;
        }
        self.realized_pnl
    }

    /// `(mark − entry) / entry`.
    #[must_use]
    pub fn unrealized_gain(&self, mark: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (mark - self.entry_price) / self.entry_price
    }

    /// Volume-weighted sell price, if anything was sold.
    #[must_use]
    pub fn exit_price(&self) -> Option<Decimal> {
        if self.shares_sold.is_zero() {
            None
        } else {
            Some(self.realized_proceeds / self.shares_sold)
        }
    }

    pub fn abandon(&mut self) {
        if self.state.can_exit() {
            self.state = PositionState::Abandoned;
        }
    }

    fn fault(&mut self, err: &PositionError) {
        self.state = PositionState::Faulted;
        self.fault = Some(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fill::{FillStatus, PriceSource};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn fill(matched: Decimal, price: Decimal) -> FillRecord {
        FillRecord {
            order_id: "b1".to_string(),
            requested_size: dec!(10),
            limit_price: dec!(0.71),
            matched_size: matched,
            price,
            price_source: PriceSource::Venue,
            status: FillStatus::Filled,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap()
    }

    fn open(balance: Option<Decimal>) -> Position {
        Position::open(
            "btc-updown-15m-1767225600",
            Outcome::Up,
            "tok-up",
            &fill(dec!(10), dec!(0.70)),
            balance,
            ExitBudgets::new(3, 10, 3),
            TrendBias::Neutral,
            now(),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_fill_cannot_open() {
        let err = Position::open(
            "i",
            Outcome::Up,
            "t",
            &fill(dec!(0), dec!(0.70)),
            None,
            ExitBudgets::new(1, 1, 1),
            TrendBias::Neutral,
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, PositionError::EmptyFill(_)));
    }

    #[test]
    fn test_open_charges_fee_shrink_at_entry() {
        let pos = open(Some(dec!(9.8)));
        assert_eq!(pos.open_shares, dec!(9.8));
        assert_eq!(pos.fee_shares, dec!(0.2));
        assert_eq!(pos.realized_pnl, dec!(-0.14));
    }

    #[test]
    fn test_zero_balance_is_settlement_lag() {
        let pos = open(Some(dec!(0)));
        assert_eq!(pos.open_shares, dec!(10));
        assert_eq!(pos.realized_pnl, dec!(0));
    }

    #[test]
    fn test_partial_sells_match_single_vwap_sell() {
        let mut split = open(None);
        split.apply_sell(dec!(4), dec!(0.80), ExitTrigger::Forced).unwrap();
        split.apply_sell(dec!(6), dec!(0.85), ExitTrigger::Forced).unwrap();

        let mut single = open(None);
        // VWAP = (3.20 + 5.10) / 10
        single.apply_sell(dec!(10), dec!(0.83), ExitTrigger::Forced).unwrap();

        assert_eq!(split.open_shares, single.open_shares);
        assert_eq!(split.realized_proceeds, single.realized_proceeds);
        assert_eq!(split.realized_pnl, single.realized_pnl);
        assert_eq!(split.state, PositionState::FullyExited);
        assert_eq!(split.exit_price(), Some(dec!(0.83)));
    }

    #[test]
    fn test_oversell_faults_position() {
        let mut pos = open(None);
        let err = pos.apply_sell(dec!(11), dec!(0.80), ExitTrigger::Dynamic).unwrap_err();
        assert_eq!(
            err,
            PositionError::Oversold {
                sold: dec!(11),
                open: dec!(10)
            }
        );
        assert_eq!(pos.state, PositionState::Faulted);
        assert_eq!(pos.open_shares, dec!(10));
        assert!(!pos.state.can_exit());
    }

    #[test]
    fn test_balance_never_raises_open_shares() {
        let mut pos = open(None);
        assert_eq!(pos.apply_balance(dec!(12)), dec!(0));
        assert_eq!(pos.open_shares, dec!(10));
        assert_eq!(pos.apply_balance(dec!(9)), dec!(1));
        assert_eq!(pos.open_shares, dec!(9));
    }

    #[test]
    fn test_target_fills_apply_deltas_only() {
        let mut pos = open(None);
        pos.target = Some(RestingTarget::new("t1", dec!(10), dec!(0.95)));

        assert_eq!(pos.apply_target_fill(dec!(4), dec!(0.95)).unwrap(), dec!(4));
        // Same cumulative report again: nothing new.
        assert_eq!(pos.apply_target_fill(dec!(4), dec!(0.95)).unwrap(), dec!(0));
        assert_eq!(pos.apply_target_fill(dec!(10), dec!(0.95)).unwrap(), dec!(6));

        assert_eq!(pos.open_shares, dec!(0));
        assert_eq!(pos.realized_proceeds, dec!(9.50));
        assert_eq!(pos.realized_pnl, dec!(2.50));
        assert_eq!(pos.last_exit, Some(ExitTrigger::Target));
    }

    #[test]
    fn test_settle_values_open_shares_at_payout() {
        let mut win = open(None);
        win.apply_sell(dec!(4), dec!(0.80), ExitTrigger::Dynamic).unwrap();
        // 4 × 0.10 + 6 × 0.30
        assert_eq!(win.settle(Outcome::Up), dec!(2.20));
        assert_eq!(win.state, PositionState::ResolvedByExpiry);

        let mut lose = open(None);
        assert_eq!(lose.settle(Outcome::Down), dec!(-7.00));
    }

    #[test]
    fn test_abandoned_still_valued_at_expiry() {
        let mut pos = open(None);
        pos.abandon();
        assert_eq!(pos.state, PositionState::Abandoned);
        assert_eq!(pos.settle(Outcome::Up), dec!(3.00));
        assert_eq!(pos.state, PositionState::Abandoned);
    }

    #[test]
    fn test_unrealized_gain() {
        let pos = open(None);
        assert_eq!(pos.unrealized_gain(dec!(0.875)), dec!(0.25));
        assert_eq!(pos.unrealized_gain(dec!(0.56)), dec!(-0.2));
    }

    #[test]
    fn test_budgets_are_independent() {
        let mut budgets = ExitBudgets::new(1, 2, 1);
        assert!(budgets.get_mut(ExitTrigger::Dynamic).consume());
        assert!(!budgets.get_mut(ExitTrigger::Dynamic).consume());
        assert!(budgets.get(ExitTrigger::Dynamic).exhausted());
        assert!(!budgets.get(ExitTrigger::Forced).exhausted());
        assert!(budgets.get_mut(ExitTrigger::Forced).consume());
    }
}
