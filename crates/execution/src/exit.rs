//! Exit policy engine.
//!
//! Evaluated on every monitoring tick for a position that can still sell and
//! has no sell in flight. Triggers in priority order:
//!
//! 1. **Dynamic**: a short-horizon crossover against the position after
//!    `dynamic_exit_after_secs`. With unrealized gain above the cushion the
//!    adverse cross is held as pending until the gain fades, or cleared by a
//!    favorable cross.
//! 2. **Target**: a resting sell at `target_price`, placed once the settlement
//!    grace period has passed and retried after failures. Placement stops once
//!    the forced window opens, so the window is checked before it.
//! 3. **Forced**: aggressive sell of everything left when `forced_exit_secs`
//!    or fewer remain.
//!
//! Sizing is separate ([`plan_sell`]) because it runs inside the order task
//! after a fresh balance read.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;
use updown_core::{ExitConfig, TrendBias};

use crate::gateway::{OrderIntent, OrderKind};
use crate::position::{ExitTrigger, Position};

/// What the exit policy wants this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Hold,
    PlaceTarget,
    Sell(ExitTrigger),
}

/// Market view for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct ExitContext {
    pub now: DateTime<Utc>,
    pub elapsed_secs: i64,
    pub remaining_secs: i64,
    /// Best bid of the position's token.
    pub mark: Option<Decimal>,
    /// Crossover bias.
    pub bias: TrendBias,
}

/// Why a sell was not submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SellSkip {
    NothingToSell,
    BelowMinimum { notional: Decimal },
    /// Balance read zero while shares may still be settling.
    SettlementLag,
}

impl std::fmt::Display for SellSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NothingToSell => write!(f, "no shares to sell"),
            Self::BelowMinimum { notional } => write!(f, "notional {notional} below minimum"),
            Self::SettlementLag => write!(f, "balance not yet settled"),
        }
    }
}

/// Exit rules.
#[derive(Debug, Clone)]
pub struct ExitPolicy {
    config: ExitConfig,
}

impl ExitPolicy {
    #[must_use]
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    /// Updates the position's crossover state and picks an action.
    pub fn evaluate(&self, position: &mut Position, ctx: &ExitContext) -> ExitAction {
        self.track_crossover(position, ctx.bias);

        if !position.state.can_exit()
            || position.exit_in_progress
            || position.open_shares <= Decimal::ZERO
        {
            return ExitAction::Hold;
        }

        if self.dynamic_fires(position, ctx) {
            return ExitAction::Sell(ExitTrigger::Dynamic);
        }

        let in_forced_window = ctx.remaining_secs <= self.config.forced_exit_secs as i64;
        if in_forced_window {
            if position.budgets.forced.exhausted() {
                return ExitAction::Hold;
            }
            return ExitAction::Sell(ExitTrigger::Forced);
        }

        if self.target_due(position, ctx.now) {
            return ExitAction::PlaceTarget;
        }

        ExitAction::Hold
    }

    /// Limit price for an aggressive sell: best bid minus offset, floored.
    #[must_use]
    pub fn aggressive_price(&self, best_bid: Decimal, floor: Decimal) -> Decimal {
        (best_bid - self.config.sell_offset).max(floor)
    }

    /// Earliest time a failed target placement may be retried.
    #[must_use]
    pub fn target_retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.config.target_retry_secs as i64)
    }

    fn track_crossover(&self, position: &mut Position, bias: TrendBias) {
        let state = &mut position.dynamic;
        if bias == state.last_bias {
            return;
        }
        if bias.opposes(position.outcome) {
            state.pending_adverse = true;
            debug!(interval = %position.interval_id, bias = %bias, "Adverse crossover");
        } else if bias.agrees(position.outcome) {
            if state.pending_adverse {
                debug!(interval = %position.interval_id, "Favorable crossover cleared pending exit");
            }
            state.pending_adverse = false;
        }
        state.last_bias = bias;
    }

    fn dynamic_fires(&self, position: &Position, ctx: &ExitContext) -> bool {
        if !self.config.dynamic_enabled
            || !position.dynamic.pending_adverse
            || position.budgets.dynamic.exhausted()
            || ctx.elapsed_secs < self.config.dynamic_exit_after_secs as i64
        {
            return false;
        }
        let Some(mark) = ctx.mark else {
            return false;
        };
        let gain = position.unrealized_gain(mark);
        if gain > self.config.cushion_pct {
            debug!(
                interval = %position.interval_id,
                %gain,
                cushion = %self.config.cushion_pct,
                "Adverse crossover held by cushion"
            );
            return false;
        }
        true
    }

    fn target_due(&self, position: &Position, now: DateTime<Utc>) -> bool {
        if !self.config.target_enabled
            || position.target.is_some()
            || position.budgets.target.exhausted()
        {
            return false;
        }
        let grace = Duration::seconds(self.config.settlement_grace_secs as i64);
        if now < position.opened_at + grace {
            return false;
        }
        position.target_retry_at.map_or(true, |at| now >= at)
    }
}

/// Sizes a sell after a fresh balance read.
///
/// `open_shares` is the engine's count, `balance` the venue's. The sell never
/// exceeds either, is truncated to whole cents of a share, and is skipped when
/// the notional falls below `min_order_value`. A zero balance inside the
/// settlement grace period is reported as [`SellSkip::SettlementLag`].
///
/// # Errors
///
/// Returns the reason no order should be submitted.
pub fn plan_sell(
    template: &OrderIntent,
    open_shares: Decimal,
    balance: Option<Decimal>,
    within_grace: bool,
    min_order_value: Decimal,
) -> Result<OrderIntent, SellSkip> {
    let mut available = open_shares;
    if let Some(balance) = balance {
        if balance.is_zero() && within_grace && open_shares > Decimal::ZERO {
            return Err(SellSkip::SettlementLag);
        }
        available = available.min(balance);
    }

    let size = available
        .max(Decimal::ZERO)
        .round_dp_with_strategy(2, RoundingStrategy::ToZero);
    if size.is_zero() {
        return Err(SellSkip::NothingToSell);
    }

    let notional = size * template.limit_price;
    if notional < min_order_value {
        return Err(SellSkip::BelowMinimum { notional });
    }

    let intent = match template.kind {
        OrderKind::Resting => OrderIntent::resting_sell(
            template.token_id.clone(),
            template.outcome,
            size,
            template.limit_price,
        ),
        OrderKind::Aggressive => OrderIntent::sell(
            template.token_id.clone(),
            template.outcome,
            size,
            template.limit_price,
        ),
    };
    Ok(intent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fill::{FillRecord, FillStatus, PriceSource};
    use crate::position::{ExitBudgets, RestingTarget};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use updown_core::Outcome;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn position(opened_elapsed: i64) -> Position {
        let fill = FillRecord {
            order_id: "b1".to_string(),
            requested_size: dec!(10),
            limit_price: dec!(0.71),
            matched_size: dec!(10),
            price: dec!(0.70),
            price_source: PriceSource::Venue,
            status: FillStatus::Filled,
        };
        Position::open(
            "i1",
            Outcome::Up,
            "tok-up",
            &fill,
            None,
            ExitBudgets::new(3, 10, 3),
            TrendBias::Up,
            start() + Duration::seconds(opened_elapsed),
        )
        .unwrap()
    }

    fn ctx(elapsed: i64, mark: Decimal, bias: TrendBias) -> ExitContext {
        ExitContext {
            now: start() + Duration::seconds(elapsed),
            elapsed_secs: elapsed,
            remaining_secs: 900 - elapsed,
            mark: Some(mark),
            bias,
        }
    }

    fn policy() -> ExitPolicy {
        ExitPolicy::new(ExitConfig {
            target_enabled: false,
            ..ExitConfig::default()
        })
    }

    #[test]
    fn test_adverse_cross_fires_after_gate() {
        let p = policy();
        let mut pos = position(200);
        assert_eq!(p.evaluate(&mut pos, &ctx(320, dec!(0.72), TrendBias::Down)), ExitAction::Sell(ExitTrigger::Dynamic));
    }

    #[test]
    fn test_cross_before_gate_is_remembered() {
        let p = policy();
        let mut pos = position(100);
        assert_eq!(p.evaluate(&mut pos, &ctx(200, dec!(0.72), TrendBias::Down)), ExitAction::Hold);
        assert!(pos.dynamic.pending_adverse);
        // Bias unchanged, gate now open.
        assert_eq!(
            p.evaluate(&mut pos, &ctx(305, dec!(0.72), TrendBias::Down)),
            ExitAction::Sell(ExitTrigger::Dynamic)
        );
    }

    #[test]
    fn test_cushion_holds_then_fires_when_gain_fades() {
        let p = policy();
        let mut pos = position(100);
        // gain (0.90 - 0.70) / 0.70 = 0.286 > 0.25
        assert_eq!(p.evaluate(&mut pos, &ctx(400, dec!(0.90), TrendBias::Down)), ExitAction::Hold);
        assert!(pos.dynamic.pending_adverse);
        // gain 0.243 <= 0.25, no favorable cross in between
        assert_eq!(
            p.evaluate(&mut pos, &ctx(405, dec!(0.87), TrendBias::Down)),
            ExitAction::Sell(ExitTrigger::Dynamic)
        );
    }

    #[test]
    fn test_gain_exactly_at_cushion_fires() {
        let p = policy();
        let mut pos = position(100);
        // (0.875 - 0.70) / 0.70 is exactly 0.25
        assert_eq!(
            p.evaluate(&mut pos, &ctx(400, dec!(0.875), TrendBias::Down)),
            ExitAction::Sell(ExitTrigger::Dynamic)
        );
    }

    #[test]
    fn test_favorable_cross_clears_pending() {
        let p = policy();
        let mut pos = position(100);
        p.evaluate(&mut pos, &ctx(400, dec!(0.90), TrendBias::Down));
        assert!(pos.dynamic.pending_adverse);
        p.evaluate(&mut pos, &ctx(405, dec!(0.90), TrendBias::Up));
        assert!(!pos.dynamic.pending_adverse);
        assert_eq!(p.evaluate(&mut pos, &ctx(410, dec!(0.80), TrendBias::Up)), ExitAction::Hold);
    }

    #[test]
    fn test_neutral_does_not_clear_pending() {
        let p = policy();
        let mut pos = position(100);
        p.evaluate(&mut pos, &ctx(400, dec!(0.90), TrendBias::Down));
        p.evaluate(&mut pos, &ctx(405, dec!(0.90), TrendBias::Neutral));
        assert!(pos.dynamic.pending_adverse);
    }

    #[test]
    fn test_initial_adverse_bias_is_not_a_cross() {
        let p = policy();
        let mut pos = position(100);
        pos.dynamic.last_bias = TrendBias::Down;
        assert_eq!(p.evaluate(&mut pos, &ctx(400, dec!(0.60), TrendBias::Down)), ExitAction::Hold);
    }

    #[test]
    fn test_forced_window() {
        let p = policy();
        let mut pos = position(100);
        assert_eq!(p.evaluate(&mut pos, &ctx(839, dec!(0.80), TrendBias::Up)), ExitAction::Hold);
        assert_eq!(
            p.evaluate(&mut pos, &ctx(840, dec!(0.80), TrendBias::Up)),
            ExitAction::Sell(ExitTrigger::Forced)
        );
        pos.budgets.forced.used = 3;
        assert_eq!(p.evaluate(&mut pos, &ctx(845, dec!(0.80), TrendBias::Up)), ExitAction::Hold);
    }

    #[test]
    fn test_dynamic_budget_exhaustion_leaves_forced() {
        let p = policy();
        let mut pos = position(100);
        pos.budgets.dynamic.used = 3;
        assert_eq!(p.evaluate(&mut pos, &ctx(400, dec!(0.60), TrendBias::Down)), ExitAction::Hold);
        assert_eq!(
            p.evaluate(&mut pos, &ctx(850, dec!(0.60), TrendBias::Down)),
            ExitAction::Sell(ExitTrigger::Forced)
        );
    }

    #[test]
    fn test_target_after_grace_and_retry() {
        let p = ExitPolicy::new(ExitConfig::default());
        let mut pos = position(100);
        assert_eq!(p.evaluate(&mut pos, &ctx(105, dec!(0.75), TrendBias::Up)), ExitAction::Hold);
        assert_eq!(p.evaluate(&mut pos, &ctx(110, dec!(0.75), TrendBias::Up)), ExitAction::PlaceTarget);

        pos.target_retry_at = Some(p.target_retry_at(start() + Duration::seconds(110)));
        assert_eq!(p.evaluate(&mut pos, &ctx(120, dec!(0.75), TrendBias::Up)), ExitAction::Hold);
        assert_eq!(p.evaluate(&mut pos, &ctx(125, dec!(0.75), TrendBias::Up)), ExitAction::PlaceTarget);

        pos.target = Some(RestingTarget::new("t1", dec!(10), dec!(0.95)));
        assert_eq!(p.evaluate(&mut pos, &ctx(130, dec!(0.75), TrendBias::Up)), ExitAction::Hold);
        // Forced still applies with a resting target.
        assert_eq!(
            p.evaluate(&mut pos, &ctx(845, dec!(0.80), TrendBias::Up)),
            ExitAction::Sell(ExitTrigger::Forced)
        );
    }

    #[test]
    fn test_forced_window_takes_the_tick_from_a_due_target() {
        let p = ExitPolicy::new(ExitConfig::default());
        let mut pos = position(100);
        // No target resting, retry due: only the forced sell is chosen.
        pos.target_retry_at = Some(start() + Duration::seconds(800));
        assert_eq!(p.evaluate(&mut pos, &ctx(835, dec!(0.80), TrendBias::Up)), ExitAction::PlaceTarget);
        assert_eq!(
            p.evaluate(&mut pos, &ctx(840, dec!(0.80), TrendBias::Up)),
            ExitAction::Sell(ExitTrigger::Forced)
        );
        pos.budgets.forced.used = 3;
        assert_eq!(p.evaluate(&mut pos, &ctx(845, dec!(0.80), TrendBias::Up)), ExitAction::Hold);
    }

    #[test]
    fn test_in_flight_sell_blocks_everything() {
        let p = policy();
        let mut pos = position(100);
        pos.exit_in_progress = true;
        assert_eq!(p.evaluate(&mut pos, &ctx(850, dec!(0.60), TrendBias::Down)), ExitAction::Hold);
        // Crossover state still tracked.
        assert!(pos.dynamic.pending_adverse);
    }

    #[test]
    fn test_aggressive_price_floor() {
        let p = policy();
        assert_eq!(p.aggressive_price(dec!(0.80), dec!(0.01)), dec!(0.78));
        assert_eq!(p.aggressive_price(dec!(0.02), dec!(0.01)), dec!(0.01));
    }

    #[test]
    fn test_plan_sell_never_exceeds_open_shares() {
        let template = OrderIntent::sell("tok", Outcome::Up, Decimal::ZERO, dec!(0.78));
        let intent = plan_sell(&template, dec!(10), Some(dec!(12)), false, dec!(1)).unwrap();
        assert_eq!(intent.size, dec!(10));

        let intent = plan_sell(&template, dec!(10), Some(dec!(9.876)), false, dec!(1)).unwrap();
        assert_eq!(intent.size, dec!(9.87));

        let intent = plan_sell(&template, dec!(10), None, false, dec!(1)).unwrap();
        assert_eq!(intent.size, dec!(10));
    }

    #[test]
    fn test_plan_sell_skips_sub_minimum() {
        let template = OrderIntent::sell("tok", Outcome::Up, Decimal::ZERO, dec!(0.30));
        assert_eq!(
            plan_sell(&template, dec!(3), None, false, dec!(1)),
            Err(SellSkip::BelowMinimum {
                notional: dec!(0.90)
            })
        );
        assert_eq!(
            plan_sell(&template, dec!(0.001), None, false, dec!(1)),
            Err(SellSkip::NothingToSell)
        );
    }

    #[test]
    fn test_plan_sell_settlement_lag() {
        let template = OrderIntent::resting_sell("tok", Outcome::Up, Decimal::ZERO, dec!(0.95));
        assert_eq!(
            plan_sell(&template, dec!(10), Some(dec!(0)), true, dec!(1)),
            Err(SellSkip::SettlementLag)
        );
        assert_eq!(
            plan_sell(&template, dec!(10), Some(dec!(0)), false, dec!(1)),
            Err(SellSkip::NothingToSell)
        );
        let intent = plan_sell(&template, dec!(10), Some(dec!(10)), true, dec!(1)).unwrap();
        assert_eq!(intent.kind, OrderKind::Resting);
    }
}
