//! Shared fixtures for engine tests: a scripted venue, fixed signals and a
//! harness that feeds events in event time.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use updown_core::{
    market_slug, AppConfig, BookSnapshot, FairValueOracle, MarketEvent, PriceLevel, TrendBias,
    TrendFilter,
};
use updown_execution::{
    EngineDeps, GatewayError, Interval, MemorySink, OrderGateway, OrderIntent, OrderKind,
    OrderReport, OrderStatus, Position, RiskGovernor, SlugTokenDiscovery, TradingEngine,
};

pub const OPEN: Decimal = dec!(100000);
pub const UP_MOVE: Decimal = dec!(100200);

// =============================================================================
// Time and events
// =============================================================================

/// Start of the window under test.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    start() + Duration::seconds(secs)
}

pub fn slug() -> String {
    market_slug("btc-updown-15m", start())
}

pub fn up_token() -> String {
    format!("{}:up", slug())
}

pub fn price(secs: i64, price: Decimal) -> MarketEvent {
    MarketEvent::Price {
        timestamp: at(secs),
        price,
    }
}

pub fn book(token: &str, secs: i64, bid: Option<Decimal>, ask: Option<Decimal>) -> MarketEvent {
    let level = |p: Decimal| PriceLevel::new(p, dec!(200));
    MarketEvent::Book(BookSnapshot::new(
        token,
        bid.map(level).into_iter().collect(),
        ask.map(level).into_iter().collect(),
        at(secs),
    ))
}

// =============================================================================
// Scripted venue
// =============================================================================

/// One status read of a scripted order.
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub status: OrderStatus,
    pub matched: Decimal,
    pub avg: Option<Decimal>,
}

impl Step {
    pub fn live(matched: Decimal, avg: Option<Decimal>) -> Self {
        Self {
            status: OrderStatus::Live,
            matched,
            avg,
        }
    }

    pub fn matched(size: Decimal, price: Decimal) -> Self {
        Self {
            status: OrderStatus::Matched,
            matched: size,
            avg: Some(price),
        }
    }
}

struct ScriptedOrder {
    steps: VecDeque<Step>,
    last: Step,
    cancelled: bool,
}

#[derive(Default)]
struct Script {
    next_id: u32,
    place_errors: VecDeque<GatewayError>,
    scripts: VecDeque<Vec<Step>>,
    orders: HashMap<String, ScriptedOrder>,
    placed: Vec<OrderIntent>,
    cancels: Vec<String>,
    balances: HashMap<String, Decimal>,
    hang_status: bool,
}

/// Venue whose orders follow queued status scripts, one per placed order.
///
/// Unscripted aggressive orders fill in full at their limit; unscripted
/// resting orders stay live. The last step of a script repeats. A canceled
/// live order reports `Cancelled` with its last matched size.
#[derive(Default)]
pub struct ScriptedGateway {
    inner: Mutex<Script>,
}

impl ScriptedGateway {
    pub fn script_next_order(&self, steps: Vec<Step>) {
        self.inner.lock().scripts.push_back(steps);
    }

    pub fn fail_next_place(&self, error: GatewayError) {
        self.inner.lock().place_errors.push_back(error);
    }

    /// Status reads never answer from now on.
    pub fn hang_status(&self) {
        self.inner.lock().hang_status = true;
    }

    pub fn set_balance(&self, token: &str, balance: Decimal) {
        self.inner.lock().balances.insert(token.to_string(), balance);
    }

    /// Every place call, accepted or not.
    pub fn placed(&self) -> Vec<OrderIntent> {
        self.inner.lock().placed.clone()
    }

    pub fn sells(&self) -> Vec<OrderIntent> {
        self.placed()
            .into_iter()
            .filter(|i| i.side == updown_execution::OrderSide::Sell)
            .collect()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.inner.lock().cancels.clone()
    }
}

fn default_script(intent: &OrderIntent) -> Vec<Step> {
    match intent.kind {
        OrderKind::Aggressive => vec![Step::matched(intent.size, intent.limit_price)],
        OrderKind::Resting => vec![Step::live(Decimal::ZERO, None)],
    }
}

#[async_trait]
impl OrderGateway for ScriptedGateway {
    async fn place(&self, intent: &OrderIntent) -> Result<String, GatewayError> {
        let mut guard = self.inner.lock();
        let script = &mut *guard;
        script.placed.push(intent.clone());
        if let Some(error) = script.place_errors.pop_front() {
            return Err(error);
        }

        script.next_id += 1;
        let order_id = format!("o{}", script.next_id);
        let steps: VecDeque<Step> = script
            .scripts
            .pop_front()
            .unwrap_or_else(|| default_script(intent))
            .into();
        let last = steps
            .front()
            .copied()
            .unwrap_or_else(|| Step::live(Decimal::ZERO, None));
        script.orders.insert(
            order_id.clone(),
            ScriptedOrder {
                steps,
                last,
                cancelled: false,
            },
        );
        Ok(order_id)
    }

    async fn status(&self, order_id: &str) -> Result<OrderReport, GatewayError> {
        let hung = self.inner.lock().hang_status;
        if hung {
            return std::future::pending().await;
        }
        let mut guard = self.inner.lock();
        let order = guard
            .orders
            .get_mut(order_id)
            .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))?;
        if !order.cancelled {
            if let Some(step) = order.steps.pop_front() {
                order.last = step;
            }
        }
        let mut step = order.last;
        if order.cancelled && step.status == OrderStatus::Live {
            step.status = OrderStatus::Cancelled;
        }
        Ok(OrderReport::new(order_id, step.status, step.matched, step.avg))
    }

    async fn cancel(&self, order_id: &str) -> Result<(), GatewayError> {
        let mut guard = self.inner.lock();
        let script = &mut *guard;
        script.cancels.push(order_id.to_string());
        let order = script
            .orders
            .get_mut(order_id)
            .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))?;
        order.cancelled = true;
        Ok(())
    }

    async fn balance(&self, token_id: &str) -> Result<Decimal, GatewayError> {
        self.inner
            .lock()
            .balances
            .get(token_id)
            .copied()
            .ok_or_else(|| GatewayError::Network("balance unavailable".to_string()))
    }
}

// =============================================================================
// Signals
// =============================================================================

pub struct FixedFairValue(pub f64);

impl FairValueOracle for FixedFairValue {
    fn lookup(&self, _move_pct: f64, _elapsed_secs: f64) -> f64 {
        self.0
    }
}

/// Trend filter whose bias is set by the test.
#[derive(Clone)]
pub struct SharedBias(Arc<Mutex<TrendBias>>);

impl SharedBias {
    pub fn new(bias: TrendBias) -> Self {
        Self(Arc::new(Mutex::new(bias)))
    }

    pub fn set(&self, bias: TrendBias) {
        *self.0.lock() = bias;
    }
}

impl TrendFilter for SharedBias {
    fn on_price(&mut self, _timestamp: DateTime<Utc>, _price: Decimal) {}

    fn bias(&self, _now: DateTime<Utc>) -> TrendBias {
        *self.0.lock()
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Fast polling, target exit off. Tests opt in to what they exercise.
pub fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.execution.poll_interval_ms = 100;
    config.execution.order_timeout_secs = 2;
    config.execution.phantom_confirm_polls = 3;
    config.exit.target_enabled = false;
    config
}

pub struct Harness {
    pub engine: TradingEngine,
    pub gateway: Arc<ScriptedGateway>,
    pub records: Arc<MemorySink>,
    pub trend: SharedBias,
    pub crossover: SharedBias,
    pub risk: Arc<RiskGovernor>,
}

impl Harness {
    pub fn new(config: AppConfig) -> Self {
        Self::with_crossover(config, TrendBias::Neutral)
    }

    pub fn with_crossover(config: AppConfig, crossover: TrendBias) -> Self {
        let gateway = Arc::new(ScriptedGateway::default());
        let records = Arc::new(MemorySink::new());
        let risk = Arc::new(RiskGovernor::new(config.risk.clone()));
        let trend = SharedBias::new(TrendBias::Neutral);
        let crossover = SharedBias::new(crossover);
        let engine = TradingEngine::new(
            config,
            EngineDeps {
                gateway: gateway.clone(),
                discovery: Arc::new(SlugTokenDiscovery),
                oracle: Box::new(FixedFairValue(0.85)),
                trend: Box::new(trend.clone()),
                crossover: Box::new(crossover.clone()),
                risk: risk.clone(),
                records: records.clone(),
            },
        );
        Self {
            engine,
            gateway,
            records,
            trend,
            crossover,
            risk,
        }
    }

    pub async fn step(&mut self, event: MarketEvent) {
        self.engine.step(event).await;
    }

    /// Skips the startup window and arms the window under test.
    pub async fn arm(&mut self) {
        self.step(price(-10, OPEN)).await;
        self.step(price(0, OPEN)).await;
    }

    /// Up book at 0.69/0.70, then a +0.2% tick at 60s: a strong Up signal
    /// with cost 0.71 and fair value 0.85.
    pub async fn enter_up(&mut self) {
        self.step(book(&up_token(), 50, Some(dec!(0.69)), Some(dec!(0.70))))
            .await;
        self.step(price(60, UP_MOVE)).await;
    }

    /// Empties the up book's bid side, leaving the 0.70 ask.
    pub async fn pull_bids(&mut self, secs: i64) {
        self.step(book(&up_token(), secs, None, Some(dec!(0.70))))
            .await;
    }

    /// Handles the completions that arrive within `ms` of tokio time; slower
    /// order tasks stay in flight.
    pub async fn settle(&mut self, ms: u64) {
        let _ = tokio::time::timeout(
            std::time::Duration::from_millis(ms),
            self.engine.drain(),
        )
        .await;
    }

    /// Price ticks every `every` seconds over `from..=to`.
    pub async fn ticks(&mut self, from: i64, to: i64, every: i64, px: Decimal) {
        let mut secs = from;
        while secs <= to {
            self.step(price(secs, px)).await;
            secs += every;
        }
    }

    pub fn interval(&self) -> &Interval {
        self.engine.interval(start()).expect("window under test is live")
    }

    pub fn position(&self) -> &Position {
        self.interval()
            .position
            .as_ref()
            .expect("window under test has a position")
    }
}
