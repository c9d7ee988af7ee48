//! Entry decision engine.
//!
//! Pure evaluation: given the interval's move, elapsed time, trend bias, fair
//! value and the signal token's book, decide whether to buy and build the
//! order. Checks run in a fixed order and the first failure is returned as an
//! [`EntryRejection`].

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use updown_core::{
    BookSnapshot, BookSummary, EntryConfig, FairValueOracle, MarketTokens, Outcome, TrendBias,
};

use crate::gateway::OrderIntent;
use crate::risk::RiskError;

/// Decimal places for fair value, cost and edge comparisons.
pub const EDGE_DECIMALS: u32 = 4;

/// Size bump applied when an order falls below the venue minimum.
const MIN_ORDER_BUFFER: Decimal = dec!(1.05);

/// How strong the move from the open is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStrength {
    Strong,
    Moderate,
}

/// Why an entry was not taken.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryRejection {
    Skipped,
    AlreadyTraded,
    InFlight,
    MarketUnknown,
    OutsideWindow { elapsed_secs: f64 },
    WeakMove { move_pct: Decimal },
    TrendOpposed { bias: TrendBias },
    NoBook,
    NoAsk,
    EdgeTooSmall { edge: Decimal },
    PriceTooHigh { cost: Decimal },
    SpreadTooWide { spread: Decimal },
    Risk(RiskError),
}

impl EntryRejection {
    /// Returns true if the rejection can clear later in the same interval.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Skipped | Self::AlreadyTraded)
    }
}

impl std::fmt::Display for EntryRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skipped => write!(f, "interval skipped"),
            Self::AlreadyTraded => write!(f, "already traded"),
            Self::InFlight => write!(f, "buy in flight"),
            Self::MarketUnknown => write!(f, "market tokens unknown"),
            Self::OutsideWindow { elapsed_secs } => {
                write!(f, "outside entry window ({elapsed_secs:.0}s)")
            }
            Self::WeakMove { move_pct } => write!(f, "move {move_pct:.3}% below threshold"),
            Self::TrendOpposed { bias } => write!(f, "trend {bias} opposes signal"),
            Self::NoBook => write!(f, "no book for signal token"),
            Self::NoAsk => write!(f, "no asks for signal token"),
            Self::EdgeTooSmall { edge } => write!(f, "edge {edge} below minimum"),
            Self::PriceTooHigh { cost } => write!(f, "cost {cost} above maximum entry price"),
            Self::SpreadTooWide { spread } => write!(f, "spread {spread} too wide"),
            Self::Risk(e) => write!(f, "{e}"),
        }
    }
}

/// Inputs for one evaluation.
#[derive(Debug, Clone)]
pub struct EntryContext<'a> {
    /// Signed move from the open in percent.
    pub move_pct: Decimal,
    pub elapsed_secs: f64,
    pub bias: TrendBias,
    pub tokens: &'a MarketTokens,
    pub up_book: Option<&'a BookSnapshot>,
    pub down_book: Option<&'a BookSnapshot>,
    pub risk: Result<(), RiskError>,
}

/// An approved entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDecision {
    pub outcome: Outcome,
    pub strength: SignalStrength,
    pub fair_value: Decimal,
    pub cost: Decimal,
    pub edge: Decimal,
    pub book: BookSummary,
    pub intent: OrderIntent,
}

/// Evaluates entry signals.
#[derive(Debug, Clone)]
pub struct EntryEngine {
    config: EntryConfig,
    min_order_value: Decimal,
}

impl EntryEngine {
    #[must_use]
    pub fn new(config: EntryConfig, min_order_value: Decimal) -> Self {
        Self {
            config,
            min_order_value,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EntryConfig {
        &self.config
    }

    /// Classifies the move. Direction is `Up` for a positive move, else `Down`.
    ///
    /// # Errors
    ///
    /// Returns [`EntryRejection::WeakMove`] below the thresholds.
    pub fn classify(
        &self,
        move_pct: Decimal,
        elapsed_secs: f64,
    ) -> Result<(Outcome, SignalStrength), EntryRejection> {
        let abs_move = move_pct.abs();
        let strength = if abs_move >= self.config.strong_move_pct {
            SignalStrength::Strong
        } else if abs_move >= self.config.min_move_pct
            && elapsed_secs > self.config.moderate_after_secs as f64
        {
            SignalStrength::Moderate
        } else {
            return Err(EntryRejection::WeakMove { move_pct });
        };
        let outcome = if move_pct > Decimal::ZERO {
            Outcome::Up
        } else {
            Outcome::Down
        };
        Ok((outcome, strength))
    }

    /// Runs every entry check and builds the buy order.
    ///
    /// Interval-state checks (skipped, traded, in flight) happen before this is called.
    ///
    /// # Errors
    ///
    /// Returns the first failed check.
    pub fn evaluate(
        &self,
        ctx: &EntryContext<'_>,
        oracle: &dyn FairValueOracle,
    ) -> Result<EntryDecision, EntryRejection> {
        let c = &self.config;

        if ctx.elapsed_secs < c.entry_start_secs as f64 || ctx.elapsed_secs > c.entry_end_secs as f64
        {
            return Err(EntryRejection::OutsideWindow {
                elapsed_secs: ctx.elapsed_secs,
            });
        }

        let (outcome, strength) = self.classify(ctx.move_pct, ctx.elapsed_secs)?;

        if c.require_trend_agreement && ctx.bias.opposes(outcome) {
            return Err(EntryRejection::TrendOpposed { bias: ctx.bias });
        }

        let book = match outcome {
            Outcome::Up => ctx.up_book,
            Outcome::Down => ctx.down_book,
        }
        .ok_or(EntryRejection::NoBook)?;
        let best_ask = book.best_ask().ok_or(EntryRejection::NoAsk)?;

        let cost = round_edge((best_ask + c.aggressive_offset).min(c.price_cap));
        let abs_move = ctx.move_pct.abs().to_f64().unwrap_or(0.0);
        let fair_value = round_edge(
            Decimal::from_f64(oracle.lookup(abs_move, ctx.elapsed_secs).clamp(0.0, 1.0))
                .unwrap_or(Decimal::ZERO),
        );
        let edge = round_edge(fair_value - cost);

        if edge < c.min_edge {
            return Err(EntryRejection::EdgeTooSmall { edge });
        }
        if cost > c.max_entry_price {
            return Err(EntryRejection::PriceTooHigh { cost });
        }
        // An empty bid side counts as a zero bid.
        let spread = book.best_bid().map_or(best_ask, |bid| best_ask - bid);
        if spread > c.max_spread {
            return Err(EntryRejection::SpreadTooWide { spread });
        }
        ctx.risk.clone().map_err(EntryRejection::Risk)?;

        let size = size_order(c.bet_size, cost, self.min_order_value);
        let intent = OrderIntent::buy(ctx.tokens.token_for(outcome), outcome, size, cost);

        Ok(EntryDecision {
            outcome,
            strength,
            fair_value,
            cost,
            edge,
            book: book.summary(),
            intent,
        })
    }
}

fn round_edge(value: Decimal) -> Decimal {
    value.round_dp(EDGE_DECIMALS)
}

/// Shares to buy for `bet` dollars at `price`.
///
/// Shares are whole cents of a share, reduced until the cost is whole cents.
/// If the notional lands below `min_value` the size is bumped to 105% of the
/// minimum.
#[must_use]
pub fn size_order(bet: Decimal, price: Decimal, min_value: Decimal) -> Decimal {
    let price_cents = (price * dec!(100)).round();
    if price_cents <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let mut size_cents = (bet * dec!(10000) / price_cents).floor();
    while size_cents > dec!(100) && !((size_cents * price_cents) % dec!(100)).is_zero() {
        size_cents -= Decimal::ONE;
    }
    let size = size_cents / dec!(100);

    if size * price < min_value {
        return (min_value * MIN_ORDER_BUFFER / price)
            .round_dp_with_strategy(2, RoundingStrategy::AwayFromZero);
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use updown_core::PriceLevel;

    struct FixedFairValue(f64);

    impl FairValueOracle for FixedFairValue {
        fn lookup(&self, _move_pct: f64, _elapsed_secs: f64) -> f64 {
            self.0
        }
    }

    fn tokens() -> MarketTokens {
        MarketTokens {
            market_id: "btc-updown-15m-1767225600".to_string(),
            up_token: "tok-up".to_string(),
            down_token: "tok-down".to_string(),
        }
    }

    fn book(token: &str, bid: Decimal, ask: Decimal) -> BookSnapshot {
        BookSnapshot::new(
            token,
            vec![PriceLevel::new(bid, dec!(100))],
            vec![PriceLevel::new(ask, dec!(100))],
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 10, 0).unwrap(),
        )
    }

    fn engine() -> EntryEngine {
        EntryEngine::new(EntryConfig::default(), dec!(1))
    }

    fn ctx<'a>(
        tokens: &'a MarketTokens,
        up: Option<&'a BookSnapshot>,
        down: Option<&'a BookSnapshot>,
        move_pct: Decimal,
        elapsed: f64,
    ) -> EntryContext<'a> {
        EntryContext {
            move_pct,
            elapsed_secs: elapsed,
            bias: TrendBias::Neutral,
            tokens,
            up_book: up,
            down_book: down,
            risk: Ok(()),
        }
    }

    #[test]
    fn test_reference_entry_proceeds() {
        let tokens = tokens();
        let up = book("tok-up", dec!(0.68), dec!(0.70));
        let decision = engine()
            .evaluate(&ctx(&tokens, Some(&up), None, dec!(0.20), 700.0), &FixedFairValue(0.85))
            .unwrap();

        assert_eq!(decision.outcome, Outcome::Up);
        assert_eq!(decision.strength, SignalStrength::Strong);
        assert_eq!(decision.cost, dec!(0.71));
        assert_eq!(decision.edge, dec!(0.14));
        assert_eq!(decision.intent.token_id, "tok-up");
        assert_eq!(decision.intent.limit_price, dec!(0.71));
        assert_eq!(decision.intent.size, dec!(7));
    }

    #[test]
    fn test_down_move_buys_down_token() {
        let tokens = tokens();
        let down = book("tok-down", dec!(0.64), dec!(0.65));
        let decision = engine()
            .evaluate(&ctx(&tokens, None, Some(&down), dec!(-0.18), 300.0), &FixedFairValue(0.75))
            .unwrap();
        assert_eq!(decision.outcome, Outcome::Down);
        assert_eq!(decision.intent.token_id, "tok-down");
    }

    #[test]
    fn test_move_exactly_at_threshold_is_strong() {
        // 100000 -> 100150 is exactly 0.15%.
        let move_pct = (dec!(100150) - dec!(100000)) / dec!(100000) * Decimal::ONE_HUNDRED;
        assert_eq!(
            engine().classify(move_pct, 60.0).unwrap(),
            (Outcome::Up, SignalStrength::Strong)
        );
        assert!(matches!(
            engine().classify(move_pct - dec!(0.0001), 60.0),
            Err(EntryRejection::WeakMove { .. })
        ));
    }

    #[test]
    fn test_moderate_needs_time() {
        let e = engine();
        assert!(matches!(
            e.classify(dec!(0.12), 400.0),
            Err(EntryRejection::WeakMove { .. })
        ));
        assert_eq!(
            e.classify(dec!(0.12), 421.0).unwrap(),
            (Outcome::Up, SignalStrength::Moderate)
        );
        assert_eq!(
            e.classify(dec!(-0.15), 60.0).unwrap(),
            (Outcome::Down, SignalStrength::Strong)
        );
        assert!(e.classify(dec!(0.05), 800.0).is_err());
    }

    #[test]
    fn test_entry_window_bounds() {
        let tokens = tokens();
        let up = book("tok-up", dec!(0.68), dec!(0.70));
        let fv = FixedFairValue(0.85);
        for elapsed in [30.0, 850.0] {
            assert!(matches!(
                engine().evaluate(&ctx(&tokens, Some(&up), None, dec!(0.2), elapsed), &fv),
                Err(EntryRejection::OutsideWindow { .. })
            ));
        }
        assert!(engine()
            .evaluate(&ctx(&tokens, Some(&up), None, dec!(0.2), 840.0), &fv)
            .is_ok());
    }

    #[test]
    fn test_trend_veto_and_neutral() {
        let tokens = tokens();
        let up = book("tok-up", dec!(0.68), dec!(0.70));
        let fv = FixedFairValue(0.85);

        let mut c = ctx(&tokens, Some(&up), None, dec!(0.2), 700.0);
        c.bias = TrendBias::Down;
        assert_eq!(
            engine().evaluate(&c, &fv).unwrap_err(),
            EntryRejection::TrendOpposed {
                bias: TrendBias::Down
            }
        );

        c.bias = TrendBias::Neutral;
        assert!(engine().evaluate(&c, &fv).is_ok());

        let mut lenient = EntryConfig::default();
        lenient.require_trend_agreement = false;
        c.bias = TrendBias::Down;
        assert!(EntryEngine::new(lenient, dec!(1)).evaluate(&c, &fv).is_ok());
    }

    #[test]
    fn test_missing_book_rejects() {
        let tokens = tokens();
        let down = book("tok-down", dec!(0.20), dec!(0.22));
        assert_eq!(
            engine()
                .evaluate(&ctx(&tokens, None, Some(&down), dec!(0.2), 700.0), &FixedFairValue(0.85))
                .unwrap_err(),
            EntryRejection::NoBook
        );
    }

    #[test]
    fn test_threshold_rejections() {
        let tokens = tokens();
        let e = engine();

        let thin = book("tok-up", dec!(0.68), dec!(0.70));
        assert!(matches!(
            e.evaluate(&ctx(&tokens, Some(&thin), None, dec!(0.2), 700.0), &FixedFairValue(0.72)),
            Err(EntryRejection::EdgeTooSmall { .. })
        ));

        let pricey = book("tok-up", dec!(0.78), dec!(0.79));
        assert_eq!(
            e.evaluate(&ctx(&tokens, Some(&pricey), None, dec!(0.2), 700.0), &FixedFairValue(0.95))
                .unwrap_err(),
            EntryRejection::PriceTooHigh { cost: dec!(0.80) }
        );

        let wide = book("tok-up", dec!(0.55), dec!(0.65));
        assert_eq!(
            e.evaluate(&ctx(&tokens, Some(&wide), None, dec!(0.2), 700.0), &FixedFairValue(0.85))
                .unwrap_err(),
            EntryRejection::SpreadTooWide { spread: dec!(0.10) }
        );
    }

    #[test]
    fn test_empty_bid_side_counts_as_zero_bid() {
        let tokens = tokens();
        let up = BookSnapshot::new(
            "tok-up",
            vec![],
            vec![PriceLevel::new(dec!(0.70), dec!(100))],
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 10, 0).unwrap(),
        );
        assert_eq!(
            engine()
                .evaluate(&ctx(&tokens, Some(&up), None, dec!(0.2), 700.0), &FixedFairValue(0.85))
                .unwrap_err(),
            EntryRejection::SpreadTooWide { spread: dec!(0.70) }
        );
    }

    #[test]
    fn test_breaker_blocks_entry() {
        let tokens = tokens();
        let up = book("tok-up", dec!(0.68), dec!(0.70));
        let mut c = ctx(&tokens, Some(&up), None, dec!(0.2), 700.0);
        c.risk = Err(RiskError::ManuallyTripped);
        assert_eq!(
            engine().evaluate(&c, &FixedFairValue(0.85)).unwrap_err(),
            EntryRejection::Risk(RiskError::ManuallyTripped)
        );
    }

    #[test]
    fn test_cost_clamped_to_cap() {
        let tokens = tokens();
        let up = book("tok-up", dec!(0.985), dec!(0.99));
        let mut config = EntryConfig::default();
        config.max_entry_price = dec!(0.99);
        config.min_edge = dec!(-1);
        let decision = EntryEngine::new(config, dec!(1))
            .evaluate(&ctx(&tokens, Some(&up), None, dec!(0.2), 700.0), &FixedFairValue(0.99))
            .unwrap();
        assert_eq!(decision.cost, dec!(0.99));
    }

    #[test]
    fn test_size_order_whole_cent_cost() {
        // 704 cents of shares × 71 is not whole cents; 700 is.
        assert_eq!(size_order(dec!(5), dec!(0.71), dec!(1)), dec!(7));
        assert_eq!(size_order(dec!(5), dec!(0.50), dec!(1)), dec!(10));
        let size = size_order(dec!(5), dec!(0.63), dec!(1));
        assert!((size * dec!(0.63) * dec!(100)).fract().is_zero());
        assert!(size * dec!(0.63) <= dec!(5));
    }

    #[test]
    fn test_size_order_bumps_to_minimum() {
        let size = size_order(dec!(0.5), dec!(0.70), dec!(1));
        assert_eq!(size, dec!(1.50));
        assert!(size * dec!(0.70) >= dec!(1));
    }
}
