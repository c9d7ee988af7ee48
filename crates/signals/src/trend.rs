//! Trend filters built from reference price ticks.
//!
//! Ticks are bucketed into fixed-length candles; only closed candles feed the
//! averages, so a half-formed candle never flips the bias.
//!
//! - [`TemaTrend`]: TEMA(fast) vs TEMA(slow) over 5-minute candles. Used to
//!   veto entries against the prevailing trend.
//! - [`CrossoverTracker`]: EMA(fast) vs EMA(slow) over 1-minute candles. Used
//!   by the dynamic exit to detect a short-horizon reversal.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;
use updown_core::{TrendBias, TrendFilter};

// =============================================================================
// Candle aggregation
// =============================================================================

/// Aggregates ticks into candle closes.
#[derive(Debug, Clone)]
struct CandleBuilder {
    candle_secs: i64,
    current_start: Option<i64>,
    current_close: f64,
}

impl CandleBuilder {
    fn new(candle_secs: u64) -> Self {
        Self {
            candle_secs: i64::try_from(candle_secs.max(1)).unwrap_or(i64::MAX),
            current_start: None,
            current_close: 0.0,
        }
    }

    /// Feeds a tick. Returns the close of the candle this tick completed, if any.
    fn push(&mut self, timestamp: DateTime<Utc>, price: f64) -> Option<f64> {
        let secs = timestamp.timestamp();
        let start = secs - secs.rem_euclid(self.candle_secs);
        match self.current_start {
            None => {
                self.current_start = Some(start);
                self.current_close = price;
                None
            }
            Some(current) if start > current => {
                let closed = self.current_close;
                self.current_start = Some(start);
                self.current_close = price;
                Some(closed)
            }
            // Same candle, or a late tick for an already-closed one.
            Some(current) => {
                if start == current {
                    self.current_close = price;
                }
                None
            }
        }
    }
}

fn to_f64(price: Decimal) -> Option<f64> {
    price.to_f64().filter(|p| p.is_finite())
}

fn bias_from(fast: f64, slow: f64) -> TrendBias {
    if fast > slow {
        TrendBias::Up
    } else if fast < slow {
        TrendBias::Down
    } else {
        TrendBias::Neutral
    }
}

// =============================================================================
// EMA / TEMA math
// =============================================================================

/// EMA series seeded with the SMA of the first `period` values.
///
/// The returned series starts at index `period - 1` of the input. Empty when
/// there are fewer than `period` values.
#[must_use]
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(seed);
    for v in &values[period..] {
        let prev = out[out.len() - 1];
        out.push(v * k + prev * (1.0 - k));
    }
    out
}

/// Latest TEMA value: `3·EMA1 − 3·EMA2 + EMA3`. `None` with fewer than `3 × period` closes.
#[must_use]
pub fn tema(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period * 3 {
        return None;
    }
    let ema1 = ema_series(closes, period);
    let ema2 = ema_series(&ema1, period);
    let ema3 = ema_series(&ema2, period);
    Some(3.0 * ema1.last()? - 3.0 * ema2.last()? + ema3.last()?)
}

// =============================================================================
// TEMA trend
// =============================================================================

/// TEMA(fast) vs TEMA(slow) trend filter. `Neutral` until enough candles exist.
#[derive(Debug, Clone)]
pub struct TemaTrend {
    candles: CandleBuilder,
    closes: VecDeque<f64>,
    max_closes: usize,
    fast_period: usize,
    slow_period: usize,
    tema_fast: Option<f64>,
    tema_slow: Option<f64>,
}

impl TemaTrend {
    #[must_use]
    pub fn new(candle_secs: u64, fast_period: usize, slow_period: usize) -> Self {
        let max_closes = slow_period * 3 + 60;
        Self {
            candles: CandleBuilder::new(candle_secs),
            closes: VecDeque::with_capacity(max_closes),
            max_closes,
            fast_period,
            slow_period,
            tema_fast: None,
            tema_slow: None,
        }
    }

    /// Seeds the filter with historical candle closes, oldest first.
    pub fn seed<I: IntoIterator<Item = f64>>(&mut self, closes: I) {
        for close in closes {
            self.push_close(close);
        }
        self.recalc();
    }

    /// True once both averages are available.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.tema_fast.is_some() && self.tema_slow.is_some()
    }

    /// Current (fast, slow) TEMA values.
    #[must_use]
    pub fn values(&self) -> (Option<f64>, Option<f64>) {
        (self.tema_fast, self.tema_slow)
    }

    fn push_close(&mut self, close: f64) {
        if self.closes.len() == self.max_closes {
            self.closes.pop_front();
        }
        self.closes.push_back(close);
    }

    fn recalc(&mut self) {
        let closes: Vec<f64> = self.closes.iter().copied().collect();
        self.tema_fast = tema(&closes, self.fast_period);
        self.tema_slow = tema(&closes, self.slow_period);
    }
}

impl TrendFilter for TemaTrend {
    fn on_price(&mut self, timestamp: DateTime<Utc>, price: Decimal) {
        let Some(price) = to_f64(price) else { return };
        if let Some(close) = self.candles.push(timestamp, price) {
            self.push_close(close);
            self.recalc();
            debug!(
                candles = self.closes.len(),
                tema_fast = ?self.tema_fast,
                tema_slow = ?self.tema_slow,
                "TEMA candle closed"
            );
        }
    }

    fn bias(&self, _now: DateTime<Utc>) -> TrendBias {
        match (self.tema_fast, self.tema_slow) {
            (Some(fast), Some(slow)) => bias_from(fast, slow),
            _ => TrendBias::Neutral,
        }
    }
}

// =============================================================================
// Short-horizon crossover
// =============================================================================

/// Incremental EMA seeded with the SMA of its first `period` inputs.
#[derive(Debug, Clone)]
struct Ema {
    period: usize,
    k: f64,
    warmup: Vec<f64>,
    value: Option<f64>,
}

impl Ema {
    fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            k: 2.0 / (period as f64 + 1.0),
            warmup: Vec::with_capacity(period),
            value: None,
        }
    }

    fn update(&mut self, x: f64) {
        match self.value {
            Some(prev) => self.value = Some(x * self.k + prev * (1.0 - self.k)),
            None => {
                self.warmup.push(x);
                if self.warmup.len() == self.period {
                    self.value = Some(self.warmup.iter().sum::<f64>() / self.period as f64);
                    self.warmup.clear();
                }
            }
        }
    }
}

/// EMA(fast) vs EMA(slow) over short candles.
///
/// Its bias flips when the averages cross; the exit policy watches those flips.
#[derive(Debug, Clone)]
pub struct CrossoverTracker {
    candles: CandleBuilder,
    fast: Ema,
    slow: Ema,
}

impl CrossoverTracker {
    #[must_use]
    pub fn new(candle_secs: u64, fast_period: usize, slow_period: usize) -> Self {
        Self {
            candles: CandleBuilder::new(candle_secs),
            fast: Ema::new(fast_period),
            slow: Ema::new(slow_period),
        }
    }

    /// Feeds one closed candle directly.
    pub fn push_close(&mut self, close: f64) {
        self.fast.update(close);
        self.slow.update(close);
    }

    #[must_use]
    pub fn values(&self) -> (Option<f64>, Option<f64>) {
        (self.fast.value, self.slow.value)
    }
}

impl TrendFilter for CrossoverTracker {
    fn on_price(&mut self, timestamp: DateTime<Utc>, price: Decimal) {
        let Some(price) = to_f64(price) else { return };
        if let Some(close) = self.candles.push(timestamp, price) {
            self.push_close(close);
        }
    }

    fn bias(&self, _now: DateTime<Utc>) -> TrendBias {
        match (self.fast.value, self.slow.value) {
            (Some(fast), Some(slow)) => bias_from(fast, slow),
            _ => TrendBias::Neutral,
        }
    }
}
