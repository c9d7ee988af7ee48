use anyhow::{ensure, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Top-level configuration. Every section has defaults so a partial file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub entry: EntryConfig,
    pub execution: ExecutionConfig,
    pub exit: ExitConfig,
    pub risk: RiskConfig,
    pub signals: SignalsConfig,
    pub paper: PaperConfig,
    pub discovery: DiscoveryConfig,
    pub records: RecordsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Reference asset, used for log context.
    pub asset: String,
    /// Market slug prefix; the window start timestamp is appended.
    pub slug_prefix: String,
    /// Exit monitoring cadence.
    pub monitor_interval_secs: u64,
    /// Skip the window that is already running at startup (its open is unreliable).
    pub skip_first_interval: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            asset: "btc".to_string(),
            slug_prefix: "btc-updown-15m".to_string(),
            monitor_interval_secs: 5,
            skip_first_interval: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryConfig {
    /// Dollar amount per entry.
    pub bet_size: Decimal,
    /// Minimum |move| in percent for a moderate signal.
    pub min_move_pct: Decimal,
    /// Minimum |move| in percent for a strong signal.
    pub strong_move_pct: Decimal,
    /// Moderate signals only count after this many seconds.
    pub moderate_after_secs: u64,
    pub entry_start_secs: u64,
    pub entry_end_secs: u64,
    pub min_edge: Decimal,
    pub max_entry_price: Decimal,
    pub max_spread: Decimal,
    /// Added to the best ask so the buy crosses.
    pub aggressive_offset: Decimal,
    pub price_cap: Decimal,
    pub require_trend_agreement: bool,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            bet_size: dec!(5),
            min_move_pct: dec!(0.10),
            strong_move_pct: dec!(0.15),
            moderate_after_secs: 420,
            entry_start_secs: 45,
            entry_end_secs: 840,
            min_edge: dec!(0.02),
            max_entry_price: dec!(0.75),
            max_spread: dec!(0.06),
            aggressive_offset: dec!(0.01),
            price_cap: dec!(0.99),
            require_trend_agreement: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub poll_interval_ms: u64,
    pub order_timeout_secs: u64,
    /// Consecutive polls a zero-size "matched" report must survive before it is trusted.
    pub phantom_confirm_polls: u32,
    /// Venue minimum order notional in dollars.
    pub min_order_value: Decimal,
    pub price_floor: Decimal,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            order_timeout_secs: 20,
            phantom_confirm_polls: 5,
            min_order_value: dec!(1),
            price_floor: dec!(0.01),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    pub dynamic_enabled: bool,
    /// Dynamic exits fire only after this many seconds into the window.
    pub dynamic_exit_after_secs: u64,
    /// Unrealized gain (fraction of entry) above which an adverse cross is held.
    pub cushion_pct: Decimal,
    pub target_enabled: bool,
    pub target_price: Decimal,
    /// Wait after the buy fill before placing the target (share settlement lag).
    pub settlement_grace_secs: u64,
    pub target_retry_secs: u64,
    /// Forced exit when this many seconds or fewer remain.
    pub forced_exit_secs: u64,
    /// Subtracted from the best bid so the sell crosses.
    pub sell_offset: Decimal,
    pub max_dynamic_attempts: u32,
    pub max_target_attempts: u32,
    pub max_forced_attempts: u32,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            dynamic_enabled: true,
            dynamic_exit_after_secs: 300,
            cushion_pct: dec!(0.25),
            target_enabled: true,
            target_price: dec!(0.95),
            settlement_grace_secs: 10,
            target_retry_secs: 15,
            forced_exit_secs: 60,
            sell_offset: dec!(0.02),
            max_dynamic_attempts: 3,
            max_target_attempts: 10,
            max_forced_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_session_loss: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_session_loss: dec!(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    /// Calibrated win-rate table (JSON). Static heuristic when absent.
    pub fair_value_table: Option<String>,
    pub min_samples: u32,
    pub strong_fair_value: f64,
    pub strong_late_fair_value: f64,
    pub late_after_secs: u64,
    pub moderate_fair_value: f64,
    pub trend_candle_secs: u64,
    pub trend_fast: usize,
    pub trend_slow: usize,
    pub cross_candle_secs: u64,
    pub cross_fast: usize,
    pub cross_slow: usize,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            fair_value_table: None,
            min_samples: 30,
            strong_fair_value: 0.75,
            strong_late_fair_value: 0.85,
            late_after_secs: 600,
            moderate_fair_value: 0.70,
            trend_candle_secs: 300,
            trend_fast: 10,
            trend_slow: 80,
            cross_candle_secs: 60,
            cross_fast: 3,
            cross_slow: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub initial_balance: Decimal,
    /// Fraction of bought shares withheld as a fee.
    pub fee_shrink_pct: Decimal,
    /// Probability (0.0 - 1.0) that a fill is partial.
    pub partial_fill_rate: f64,
    pub min_partial_fill_pct: f64,
    pub max_partial_fill_pct: f64,
    pub random_seed: Option<u64>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(1000),
            fee_shrink_pct: Decimal::ZERO,
            partial_fill_rate: 0.0,
            min_partial_fill_pct: 0.3,
            max_partial_fill_pct: 0.9,
            random_seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub gamma_url: String,
    pub timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            gamma_url: "https://gamma-api.polymarket.com".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordsConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "data/intervals.jsonl".to_string(),
        }
    }
}

impl AppConfig {
    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let e = &self.entry;
        ensure!(e.bet_size > Decimal::ZERO, "entry.bet_size must be positive");
        ensure!(
            e.min_move_pct > Decimal::ZERO && e.min_move_pct <= e.strong_move_pct,
            "entry.min_move_pct must be positive and <= entry.strong_move_pct"
        );
        ensure!(
            e.entry_start_secs < e.entry_end_secs,
            "entry.entry_start_secs must be < entry.entry_end_secs"
        );
        ensure!(
            e.price_cap > Decimal::ZERO && e.price_cap < Decimal::ONE,
            "entry.price_cap must lie in (0, 1)"
        );
        ensure!(
            e.max_entry_price <= e.price_cap,
            "entry.max_entry_price must be <= entry.price_cap"
        );

        let x = &self.execution;
        ensure!(x.poll_interval_ms > 0, "execution.poll_interval_ms must be positive");
        ensure!(x.order_timeout_secs > 0, "execution.order_timeout_secs must be positive");
        ensure!(
            x.price_floor > Decimal::ZERO && x.price_floor < Decimal::ONE,
            "execution.price_floor must lie in (0, 1)"
        );

        let t = &self.exit;
        ensure!(
            t.target_price > Decimal::ZERO && t.target_price < Decimal::ONE,
            "exit.target_price must lie in (0, 1)"
        );
        ensure!(!t.cushion_pct.is_sign_negative(), "exit.cushion_pct must be non-negative");
        ensure!(
            t.forced_exit_secs < 900,
            "exit.forced_exit_secs must be shorter than a window"
        );

        ensure!(
            self.engine.monitor_interval_secs > 0,
            "engine.monitor_interval_secs must be positive"
        );
        ensure!(
            self.risk.max_session_loss > Decimal::ZERO,
            "risk.max_session_loss must be positive"
        );

        let s = &self.signals;
        ensure!(
            s.trend_fast > 0 && s.trend_fast < s.trend_slow,
            "signals.trend_fast must be positive and < signals.trend_slow"
        );
        ensure!(
            s.cross_fast > 0 && s.cross_fast < s.cross_slow,
            "signals.cross_fast must be positive and < signals.cross_slow"
        );

        let p = &self.paper;
        ensure!(
            (0.0..=1.0).contains(&p.partial_fill_rate),
            "paper.partial_fill_rate must lie in [0, 1]"
        );
        ensure!(
            p.fee_shrink_pct >= Decimal::ZERO && p.fee_shrink_pct < Decimal::ONE,
            "paper.fee_shrink_pct must lie in [0, 1)"
        );
        Ok(())
    }
}
