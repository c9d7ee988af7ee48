//! Trading engine.
//!
//! [`TradingEngine`] owns every interval and position. Feed events and monitor
//! ticks are handled synchronously and never wait on the venue: gateway
//! round-trips run in spawned order tasks that report back through a channel
//! with exactly one completion [`ExecutionEvent`] each.
//!
//! Every task has a guard that is set before the spawn and cleared when its
//! completion is handled:
//!
//! | task | guard |
//! |---|---|
//! | market discovery | `Interval::discovery_in_flight` |
//! | buy | `Interval::evaluating` |
//! | sell, target placement, target cancel at expiry | `Position::exit_in_progress` |
//! | target status poll | `Position::target_poll_in_flight` |
//!
//! Two clock modes are supported. In [`ClockMode::Live`] the monitor timer
//! runs on wall time. In [`ClockMode::EventTime`] monitor ticks are
//! synthesized from event timestamps and every event is fully processed,
//! order tasks included, before the next one is read.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};
use updown_core::{
    window_start, AppConfig, BookSnapshot, DiscoveryError, FairValueOracle, MarketDiscovery,
    MarketEvent, MarketTokens, TrendFilter,
};

use crate::entry::{EntryContext, EntryDecision, EntryEngine};
use crate::exit::{plan_sell, ExitAction, ExitContext, ExitPolicy, SellSkip};
use crate::fill::{ExecutionError, FillRecord, OrderExecutor};
use crate::gateway::{GatewayError, OrderGateway, OrderIntent, OrderKind, OrderReport, OrderStatus};
use crate::interval::{EntrySnapshot, Interval};
use crate::position::{ExitBudgets, ExitTrigger, Position, RestingTarget};
use crate::record::{IntervalRecord, RecordSink};
use crate::risk::{RiskGovernor, SessionStats};

// =============================================================================
// Execution events
// =============================================================================

/// A confirmed buy result.
#[derive(Debug, Clone)]
pub struct BuyFill {
    pub intent: OrderIntent,
    pub fill: FillRecord,
    /// Token balance read after a non-empty fill.
    pub balance: Option<Decimal>,
}

/// What happened to a sell attempt.
#[derive(Debug, Clone)]
pub enum SellResult {
    Filled(FillRecord),
    /// A resting target order was accepted.
    Resting {
        order_id: String,
        size: Decimal,
        price: Decimal,
    },
    Skipped(SellSkip),
    Failed(ExecutionError),
}

/// Completion of a sell task.
#[derive(Debug, Clone)]
pub struct SellCompletion {
    pub start: DateTime<Utc>,
    pub trigger: ExitTrigger,
    /// Final read of a resting target canceled before the sell.
    pub target_fill: Option<FillRecord>,
    /// Balance read before sizing. `None` when unknown or still settling.
    pub balance: Option<Decimal>,
    pub result: SellResult,
}

/// Messages from order tasks back to the engine.
#[derive(Debug)]
pub enum ExecutionEvent {
    Discovered {
        start: DateTime<Utc>,
        result: Result<MarketTokens, DiscoveryError>,
    },
    /// The venue accepted a buy. Not a completion.
    BuyAccepted {
        start: DateTime<Utc>,
        order_id: String,
    },
    BuyCompleted {
        start: DateTime<Utc>,
        result: Result<BuyFill, ExecutionError>,
    },
    SellCompleted(SellCompletion),
    TargetPolled {
        start: DateTime<Utc>,
        order_id: String,
        result: Result<OrderReport, GatewayError>,
    },
    TargetCanceled {
        start: DateTime<Utc>,
        fill: FillRecord,
    },
}

impl ExecutionEvent {
    fn is_completion(&self) -> bool {
        !matches!(self, Self::BuyAccepted { .. })
    }
}

fn send(tx: &mpsc::UnboundedSender<ExecutionEvent>, event: ExecutionEvent) {
    if tx.send(event).is_err() {
        debug!("Engine stopped, dropping execution event");
    }
}

// =============================================================================
// Sell task
// =============================================================================

struct SellJob {
    start: DateTime<Utc>,
    trigger: ExitTrigger,
    /// Side, token, kind and limit of the sell. Size is decided in the task.
    template: OrderIntent,
    open_shares: Decimal,
    /// Resting target to cancel and reconcile first.
    target: Option<RestingTarget>,
    within_grace: bool,
    min_order_value: Decimal,
}

impl SellJob {
    async fn run(self, executor: &OrderExecutor) -> SellCompletion {
        let mut available = self.open_shares;
        let mut target_fill = None;

        if let Some(target) = &self.target {
            let intent = OrderIntent::resting_sell(
                self.template.token_id.clone(),
                self.template.outcome,
                target.size,
                target.price,
            );
            let fill = executor
                .cancel_and_reconcile(&target.order_id, &intent, target.accounted)
                .await;
            available -= (fill.matched_size - target.accounted).max(Decimal::ZERO);
            target_fill = Some(fill);
        }

        let balance = match executor.balance(&self.template.token_id).await {
            Ok(b) => Some(b),
            Err(e) => {
                warn!(token = %self.template.token_id, error = %e, "Balance query failed, sizing from open shares");
                None
            }
        };

        let result = match plan_sell(
            &self.template,
            available,
            balance,
            self.within_grace,
            self.min_order_value,
        ) {
            Err(skip) => SellResult::Skipped(skip),
            Ok(intent) => match executor.place(&intent).await {
                Err(e) => SellResult::Failed(e),
                Ok(order_id) if intent.kind == OrderKind::Resting => SellResult::Resting {
                    order_id,
                    size: intent.size,
                    price: intent.limit_price,
                },
                Ok(order_id) => SellResult::Filled(executor.reconcile(&order_id, &intent).await),
            },
        };

        let settling = self.within_grace && balance.is_some_and(|b| b.is_zero());
        SellCompletion {
            start: self.start,
            trigger: self.trigger,
            target_fill,
            balance: if settling { None } else { balance },
            result,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// How monitor ticks are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockMode {
    Live,
    EventTime,
}

/// Collaborators injected into the engine.
pub struct EngineDeps {
    pub gateway: Arc<dyn OrderGateway>,
    pub discovery: Arc<dyn MarketDiscovery>,
    pub oracle: Box<dyn FairValueOracle>,
    /// Entry trend filter.
    pub trend: Box<dyn TrendFilter>,
    /// Short-horizon crossover for the dynamic exit.
    pub crossover: Box<dyn TrendFilter>,
    pub risk: Arc<RiskGovernor>,
    pub records: Arc<dyn RecordSink>,
}

/// Engine activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub intervals_seen: u32,
    pub intervals_skipped: u32,
    pub buys_submitted: u32,
    pub buys_rejected: u32,
    pub buys_unfilled: u32,
    pub positions_opened: u32,
    pub sells_filled: u32,
    pub targets_placed: u32,
    pub records_emitted: u32,
}

/// Summary returned when the engine stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub counters: SessionCounters,
    pub stats: SessionStats,
}

enum Wake {
    Execution(ExecutionEvent),
    Tick,
    Feed(Option<MarketEvent>),
}

/// Interval lifecycle driver.
pub struct TradingEngine {
    config: AppConfig,
    executor: Arc<OrderExecutor>,
    discovery: Arc<dyn MarketDiscovery>,
    oracle: Box<dyn FairValueOracle>,
    trend: Box<dyn TrendFilter>,
    crossover: Box<dyn TrendFilter>,
    risk: Arc<RiskGovernor>,
    records: Arc<dyn RecordSink>,
    entry: EntryEngine,
    exit: ExitPolicy,
    intervals: BTreeMap<DateTime<Utc>, Interval>,
    books: HashMap<String, BookSnapshot>,
    latest_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    next_tick: Option<DateTime<Utc>>,
    tx: mpsc::UnboundedSender<ExecutionEvent>,
    rx: mpsc::UnboundedReceiver<ExecutionEvent>,
    in_flight: usize,
    counters: SessionCounters,
}

impl std::fmt::Debug for TradingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingEngine")
            .field("now", &self.now)
            .field("intervals", &self.intervals.len())
            .field("in_flight", &self.in_flight)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl TradingEngine {
    #[must_use]
    pub fn new(config: AppConfig, deps: EngineDeps) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            executor: Arc::new(OrderExecutor::new(deps.gateway, config.execution.clone())),
            discovery: deps.discovery,
            oracle: deps.oracle,
            trend: deps.trend,
            crossover: deps.crossover,
            risk: deps.risk,
            records: deps.records,
            entry: EntryEngine::new(config.entry.clone(), config.execution.min_order_value),
            exit: ExitPolicy::new(config.exit.clone()),
            intervals: BTreeMap::new(),
            books: HashMap::new(),
            latest_start: None,
            now: DateTime::<Utc>::MIN_UTC,
            next_tick: None,
            tx,
            rx,
            in_flight: 0,
            counters: SessionCounters::default(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub fn risk(&self) -> &Arc<RiskGovernor> {
        &self.risk
    }

    /// Latest time seen by the engine.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Order and discovery tasks not yet completed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Live intervals, oldest first.
    pub fn intervals(&self) -> impl Iterator<Item = &Interval> {
        self.intervals.values()
    }

    #[must_use]
    pub fn interval(&self, start: DateTime<Utc>) -> Option<&Interval> {
        self.intervals.get(&start)
    }

    #[must_use]
    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    #[must_use]
    pub fn report(&self) -> SessionReport {
        SessionReport {
            counters: self.counters,
            stats: self.risk.stats(),
        }
    }

    fn advance_clock(&mut self, ts: DateTime<Utc>) {
        if ts > self.now {
            self.now = ts;
        }
    }

    fn monitor_period(&self) -> Duration {
        Duration::seconds(self.config.engine.monitor_interval_secs.max(1) as i64)
    }

    fn budgets(&self) -> ExitBudgets {
        let c = self.exit.config();
        ExitBudgets::new(
            c.max_dynamic_attempts,
            c.max_target_attempts,
            c.max_forced_attempts,
        )
    }

    // -------------------------------------------------------------------------
    // Feed events
    // -------------------------------------------------------------------------

    /// Handles one feed event. Never waits on the venue.
    pub fn handle_event(&mut self, event: MarketEvent) {
        self.advance_clock(event.timestamp());
        match event {
            MarketEvent::Price { timestamp, price } => self.on_price(timestamp, price),
            MarketEvent::Book(book) => {
                trace!(token = %book.token_id, bid = ?book.best_bid(), ask = ?book.best_ask(), "Book update");
                self.books.insert(book.token_id.clone(), book);
            }
        }
    }

    fn on_price(&mut self, timestamp: DateTime<Utc>, price: Decimal) {
        self.trend.on_price(timestamp, price);
        self.crossover.on_price(timestamp, price);

        let start = window_start(timestamp);
        if let Some(interval) = self.intervals.get_mut(&start) {
            interval.on_price(price);
        } else if self.latest_start.map_or(true, |latest| start > latest) {
            self.open_interval(start, price);
        } else {
            trace!(%timestamp, "Tick for a closed window ignored");
            return;
        }

        self.resolve_ended();
        self.try_entry(start);
    }

    fn open_interval(&mut self, start: DateTime<Utc>, price: Decimal) {
        let skipped = self.latest_start.is_none() && self.config.engine.skip_first_interval;
        self.latest_start = Some(start);

        let interval = Interval::new(&self.config.engine.slug_prefix, start, price, skipped);
        self.counters.intervals_seen += 1;
        if skipped {
            self.counters.intervals_skipped += 1;
            info!(interval = %interval.id, open = %price, "First interval after startup, skipping");
        } else {
            info!(interval = %interval.id, open = %price, "Interval armed");
        }
        self.intervals.insert(start, interval);
        self.spawn_discovery(start);
    }

    fn spawn_discovery(&mut self, start: DateTime<Utc>) {
        let now = self.now;
        let Some(interval) = self.intervals.get_mut(&start) else {
            return;
        };
        if interval.skipped
            || interval.resolved
            || interval.tokens.is_some()
            || interval.discovery_in_flight
            || interval.has_ended(now)
        {
            return;
        }
        interval.discovery_in_flight = true;

        let market_id = interval.id.clone();
        let discovery = Arc::clone(&self.discovery);
        let tx = self.tx.clone();
        self.in_flight += 1;
        tokio::spawn(async move {
            let result = discovery.resolve(&market_id).await;
            send(&tx, ExecutionEvent::Discovered { start, result });
        });
    }

    fn try_entry(&mut self, start: DateTime<Utc>) {
        let now = self.now;
        let Some(interval) = self.intervals.get(&start) else {
            return;
        };
        if interval.has_ended(now) {
            return;
        }
        let Ok(tokens) = interval.entry_gate() else {
            return;
        };

        let ctx = EntryContext {
            move_pct: interval.move_pct(),
            elapsed_secs: interval.elapsed_secs(now) as f64,
            bias: self.trend.bias(now),
            tokens,
            up_book: self.books.get(&tokens.up_token),
            down_book: self.books.get(&tokens.down_token),
            risk: self.risk.can_trade(),
        };
        match self.entry.evaluate(&ctx, self.oracle.as_ref()) {
            Ok(decision) => self.submit_buy(start, decision),
            Err(rejection) if rejection.is_transient() => {
                trace!(%start, reason = %rejection, "Entry rejected");
            }
            Err(rejection) => debug!(%start, reason = %rejection, "Entry rejected"),
        }
    }

    fn submit_buy(&mut self, start: DateTime<Utc>, decision: EntryDecision) {
        let now = self.now;
        let Some(interval) = self.intervals.get_mut(&start) else {
            return;
        };
        let elapsed_secs = interval.elapsed_secs(now);
        interval.evaluating = true;
        interval.entry = Some(EntrySnapshot {
            book: decision.book,
            edge: decision.edge,
            fair_value: decision.fair_value,
            elapsed_secs,
        });
        info!(
            interval = %interval.id,
            side = %decision.outcome,
            strength = ?decision.strength,
            fair_value = %decision.fair_value,
            cost = %decision.cost,
            edge = %decision.edge,
            size = %decision.intent.size,
            "Entry signal, submitting buy"
        );

        self.counters.buys_submitted += 1;
        self.in_flight += 1;
        let executor = Arc::clone(&self.executor);
        let tx = self.tx.clone();
        let intent = decision.intent;
        tokio::spawn(async move {
            let result = match executor.place(&intent).await {
                Ok(order_id) => {
                    send(
                        &tx,
                        ExecutionEvent::BuyAccepted {
                            start,
                            order_id: order_id.clone(),
                        },
                    );
                    let fill = executor.reconcile(&order_id, &intent).await;
                    let balance = if fill.is_empty() {
                        None
                    } else {
                        executor.balance(&intent.token_id).await.ok()
                    };
                    Ok(BuyFill {
                        intent,
                        fill,
                        balance,
                    })
                }
                Err(e) => Err(e),
            };
            send(&tx, ExecutionEvent::BuyCompleted { start, result });
        });
    }

    // -------------------------------------------------------------------------
    // Monitor ticks
    // -------------------------------------------------------------------------

    /// Runs resolution, exit evaluation, target polls and discovery retries.
    pub fn on_monitor_tick(&mut self, now: DateTime<Utc>) {
        self.advance_clock(now);
        self.resolve_ended();

        let starts: Vec<DateTime<Utc>> = self.intervals.keys().copied().collect();
        for start in starts {
            self.spawn_discovery(start);
            self.evaluate_exit(start);
            self.poll_target(start);
        }
    }

    fn evaluate_exit(&mut self, start: DateTime<Utc>) {
        let now = self.now;
        let bias = self.crossover.bias(now);
        let Some(interval) = self.intervals.get_mut(&start) else {
            return;
        };
        if interval.resolved || interval.has_ended(now) {
            return;
        }
        let elapsed_secs = interval.elapsed_secs(now);
        let remaining_secs = interval.remaining_secs(now);
        let Some(position) = interval.position.as_mut() else {
            return;
        };

        let mark = self
            .books
            .get(&position.token_id)
            .and_then(BookSnapshot::best_bid);
        let ctx = ExitContext {
            now,
            elapsed_secs,
            remaining_secs,
            mark,
            bias,
        };
        let action = self.exit.evaluate(position, &ctx);
        if action == ExitAction::Hold || position.target_poll_in_flight {
            return;
        }

        match action {
            ExitAction::Hold => {}
            ExitAction::PlaceTarget => self.spawn_sell(start, ExitTrigger::Target, None),
            ExitAction::Sell(trigger) => match mark {
                Some(bid) => self.spawn_sell(start, trigger, Some(bid)),
                None => debug!(%start, %trigger, "No bid to exit into, holding"),
            },
        }
    }

    fn spawn_sell(&mut self, start: DateTime<Utc>, trigger: ExitTrigger, bid: Option<Decimal>) {
        let now = self.now;
        let grace = Duration::seconds(self.exit.config().settlement_grace_secs as i64);
        let min_order_value = self.config.execution.min_order_value;
        let price = match (trigger, bid) {
            (ExitTrigger::Target, _) => self.exit.config().target_price,
            (_, Some(bid)) => self
                .exit
                .aggressive_price(bid, self.config.execution.price_floor),
            (_, None) => return,
        };

        let Some(interval) = self.intervals.get_mut(&start) else {
            return;
        };
        let Some(position) = interval.position.as_mut() else {
            return;
        };
        if position.exit_in_progress || !position.budgets.get_mut(trigger).consume() {
            return;
        }
        position.exit_in_progress = true;

        let template = match trigger {
            ExitTrigger::Target => OrderIntent::resting_sell(
                position.token_id.clone(),
                position.outcome,
                Decimal::ZERO,
                price,
            ),
            ExitTrigger::Dynamic | ExitTrigger::Forced => OrderIntent::sell(
                position.token_id.clone(),
                position.outcome,
                Decimal::ZERO,
                price,
            ),
        };
        let job = SellJob {
            start,
            trigger,
            template,
            open_shares: position.open_shares,
            target: match trigger {
                ExitTrigger::Target => None,
                _ => position.target.clone(),
            },
            within_grace: now < position.opened_at + grace,
            min_order_value,
        };
        info!(
            interval = %interval.id,
            %trigger,
            open_shares = %position.open_shares,
            price = %price,
            attempt = position.budgets.get(trigger).used,
            "Exit triggered"
        );

        self.in_flight += 1;
        let executor = Arc::clone(&self.executor);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let completion = job.run(&executor).await;
            send(&tx, ExecutionEvent::SellCompleted(completion));
        });
    }

    fn poll_target(&mut self, start: DateTime<Utc>) {
        let Some(interval) = self.intervals.get_mut(&start) else {
            return;
        };
        if interval.resolved {
            return;
        }
        let Some(position) = interval.position.as_mut() else {
            return;
        };
        if position.exit_in_progress || position.target_poll_in_flight {
            return;
        }
        let Some(order_id) = position.target.as_ref().map(|t| t.order_id.clone()) else {
            return;
        };
        position.target_poll_in_flight = true;

        self.in_flight += 1;
        let executor = Arc::clone(&self.executor);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = executor.status(&order_id).await;
            send(
                &tx,
                ExecutionEvent::TargetPolled {
                    start,
                    order_id,
                    result,
                },
            );
        });
    }

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------

    fn resolve_ended(&mut self) {
        let now = self.now;
        let ended: Vec<DateTime<Utc>> = self
            .intervals
            .values()
            .filter(|iv| !iv.resolved && iv.has_ended(now))
            .map(|iv| iv.start)
            .collect();
        for start in ended {
            self.resolve(start);
        }
        self.intervals.retain(|_, iv| !iv.resolved);
    }

    fn resolve(&mut self, start: DateTime<Utc>) {
        let Some(interval) = self.intervals.get_mut(&start) else {
            return;
        };
        if interval.evaluating {
            return;
        }

        if let Some(position) = interval.position.as_mut() {
            if position.exit_in_progress || position.target_poll_in_flight {
                return;
            }
            if let Some(target) = position.target.clone() {
                position.exit_in_progress = true;
                info!(interval = %interval.id, order_id = %target.order_id, "Window ended, canceling target order");

                let intent = OrderIntent::resting_sell(
                    position.token_id.clone(),
                    position.outcome,
                    target.size,
                    target.price,
                );
                self.in_flight += 1;
                let executor = Arc::clone(&self.executor);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let fill = executor
                        .cancel_and_reconcile(&target.order_id, &intent, target.accounted)
                        .await;
                    send(&tx, ExecutionEvent::TargetCanceled { start, fill });
                });
                return;
            }
        }

        interval.resolved = true;
        let winner = interval.winner();
        let pnl = match interval.position.as_mut() {
            Some(position) => {
                let pnl = position.settle(winner);
                self.risk.record_interval(pnl);
                pnl
            }
            None if interval.traded => Decimal::ZERO,
            None => {
                debug!(interval = %interval.id, "Window ended without a trade");
                return;
            }
        };

        let record = IntervalRecord::from_interval(interval, pnl);
        info!(
            interval = %record.interval_id,
            winner = %record.winner,
            exit = ?record.exit_kind,
            pnl = %pnl,
            session_pnl = %self.risk.session_pnl(),
            "Interval resolved"
        );
        match self.records.emit(&record) {
            Ok(()) => self.counters.records_emitted += 1,
            Err(e) => error!(interval = %record.interval_id, error = %e, "Failed to write interval record"),
        }
    }

    // -------------------------------------------------------------------------
    // Completions
    // -------------------------------------------------------------------------

    /// Applies one order-task message.
    pub fn handle_execution_event(&mut self, event: ExecutionEvent) {
        if event.is_completion() {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        match event {
            ExecutionEvent::Discovered { start, result } => self.on_discovered(start, result),
            ExecutionEvent::BuyAccepted { start, order_id } => {
                if let Some(interval) = self.intervals.get_mut(&start) {
                    interval.traded = true;
                    info!(interval = %interval.id, order_id = %order_id, "Buy accepted");
                }
            }
            ExecutionEvent::BuyCompleted { start, result } => self.on_buy_completed(start, result),
            ExecutionEvent::SellCompleted(completion) => self.on_sell_completed(completion),
            ExecutionEvent::TargetPolled {
                start,
                order_id,
                result,
            } => self.on_target_polled(start, &order_id, result),
            ExecutionEvent::TargetCanceled { start, fill } => self.on_target_canceled(start, &fill),
        }
        self.resolve_ended();
    }

    fn on_discovered(&mut self, start: DateTime<Utc>, result: Result<MarketTokens, DiscoveryError>) {
        let Some(interval) = self.intervals.get_mut(&start) else {
            return;
        };
        interval.discovery_in_flight = false;
        match result {
            Ok(tokens) => {
                info!(
                    interval = %interval.id,
                    up = %tokens.up_token,
                    down = %tokens.down_token,
                    "Market resolved"
                );
                interval.tokens = Some(tokens);
            }
            Err(e) => warn!(interval = %interval.id, error = %e, "Market discovery failed, retrying on next tick"),
        }
    }

    fn on_buy_completed(&mut self, start: DateTime<Utc>, result: Result<BuyFill, ExecutionError>) {
        let now = self.now;
        let bias = self.crossover.bias(now);
        let budgets = self.budgets();
        let Some(interval) = self.intervals.get_mut(&start) else {
            warn!(%start, "Buy completed for an unknown interval");
            return;
        };
        interval.evaluating = false;

        let BuyFill {
            intent,
            fill,
            balance,
        } = match result {
            Ok(buy) => buy,
            Err(e @ ExecutionError::Unconfirmed(_)) => {
                // The venue may hold the order: never submit a second buy.
                interval.traded = true;
                self.counters.buys_unfilled += 1;
                error!(interval = %interval.id, error = %e, "Buy placement unconfirmed, interval closed for entry");
                return;
            }
            Err(e) => {
                interval.entry = None;
                self.counters.buys_rejected += 1;
                warn!(interval = %interval.id, error = %e, "Buy not accepted, will retry");
                return;
            }
        };

        interval.traded = true;
        if fill.is_empty() {
            self.counters.buys_unfilled += 1;
            info!(interval = %interval.id, order_id = %fill.order_id, status = ?fill.status, "Buy unfilled");
            return;
        }

        match Position::open(
            interval.id.clone(),
            intent.outcome,
            intent.token_id.clone(),
            &fill,
            balance,
            budgets,
            bias,
            now,
        ) {
            Ok(position) => {
                info!(
                    interval = %interval.id,
                    side = %position.outcome,
                    shares = %position.open_shares,
                    requested = %position.requested_shares,
                    price = %position.entry_price,
                    source = ?fill.price_source,
                    fee_shares = %position.fee_shares,
                    "Position opened"
                );
                interval.position = Some(position);
                self.counters.positions_opened += 1;
            }
            Err(e) => error!(interval = %interval.id, error = %e, "Could not open position"),
        }
    }

    fn on_sell_completed(&mut self, completion: SellCompletion) {
        let now = self.now;
        let SellCompletion {
            start,
            trigger,
            target_fill,
            balance,
            result,
        } = completion;
        let Some(interval) = self.intervals.get_mut(&start) else {
            return;
        };
        let Some(position) = interval.position.as_mut() else {
            return;
        };
        position.exit_in_progress = false;

        if let Some(fill) = target_fill {
            match position.apply_target_fill(fill.matched_size, fill.price) {
                Ok(delta) if delta > Decimal::ZERO => {
                    info!(interval = %position.interval_id, shares = %delta, "Target fill accounted before exit");
                }
                Ok(_) => {}
                Err(e) => error!(interval = %position.interval_id, error = %e, "Target fill rejected, position faulted"),
            }
            position.target = None;
        }

        if let Some(balance) = balance {
            let shrink = position.apply_balance(balance);
            if shrink > Decimal::ZERO {
                info!(
                    interval = %position.interval_id,
                    shrink = %shrink,
                    open_shares = %position.open_shares,
                    "Balance below open shares, charged at entry price"
                );
            }
        }

        let failed = match result {
            SellResult::Filled(fill) if !fill.is_empty() => {
                match position.apply_sell(fill.matched_size, fill.price, trigger) {
                    Ok(()) => {
                        self.counters.sells_filled += 1;
                        info!(
                            interval = %position.interval_id,
                            %trigger,
                            size = %fill.matched_size,
                            price = %fill.price,
                            open_shares = %position.open_shares,
                            realized_pnl = %position.realized_pnl,
                            "Sell filled"
                        );
                    }
                    Err(e) => error!(interval = %position.interval_id, error = %e, "Sell fill rejected, position faulted"),
                }
                false
            }
            SellResult::Filled(fill) => {
                info!(interval = %position.interval_id, %trigger, order_id = %fill.order_id, "Sell unfilled");
                true
            }
            SellResult::Resting {
                order_id,
                size,
                price,
            } => {
                info!(interval = %position.interval_id, order_id = %order_id, size = %size, price = %price, "Target order resting");
                position.target = Some(RestingTarget::new(order_id, size, price));
                self.counters.targets_placed += 1;
                false
            }
            SellResult::Skipped(skip) => {
                info!(interval = %position.interval_id, %trigger, reason = %skip, "Sell skipped");
                true
            }
            SellResult::Failed(e) => {
                warn!(interval = %position.interval_id, %trigger, error = %e, "Sell failed");
                true
            }
        };

        if failed && trigger == ExitTrigger::Target {
            position.target_retry_at = Some(self.exit.target_retry_at(now));
        }
        if failed || trigger == ExitTrigger::Forced {
            note_exhaustion(position, trigger);
        }
    }

    fn on_target_polled(
        &mut self,
        start: DateTime<Utc>,
        order_id: &str,
        result: Result<OrderReport, GatewayError>,
    ) {
        let now = self.now;
        let Some(position) = self
            .intervals
            .get_mut(&start)
            .and_then(|iv| iv.position.as_mut())
        else {
            return;
        };
        position.target_poll_in_flight = false;

        let Some(target_price) = position
            .target
            .as_ref()
            .filter(|t| t.order_id == order_id)
            .map(|t| t.price)
        else {
            return;
        };

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                debug!(interval = %position.interval_id, order_id, error = %e, "Target poll failed");
                return;
            }
        };

        if report.has_fills() {
            match position
                .apply_target_fill(report.matched_size, report.avg_price.unwrap_or(target_price))
            {
                Ok(delta) if delta > Decimal::ZERO => info!(
                    interval = %position.interval_id,
                    shares = %delta,
                    open_shares = %position.open_shares,
                    "Target filled"
                ),
                Ok(_) => {}
                Err(e) => error!(interval = %position.interval_id, error = %e, "Target fill rejected, position faulted"),
            }
        }

        match report.status {
            OrderStatus::Matched if report.has_fills() => position.target = None,
            OrderStatus::Live | OrderStatus::Matched => {}
            status => {
                info!(interval = %position.interval_id, order_id, %status, "Target order ended");
                position.target = None;
                position.target_retry_at = Some(now);
            }
        }
    }

    fn on_target_canceled(&mut self, start: DateTime<Utc>, fill: &FillRecord) {
        let Some(position) = self
            .intervals
            .get_mut(&start)
            .and_then(|iv| iv.position.as_mut())
        else {
            return;
        };
        position.exit_in_progress = false;
        if let Err(e) = position.apply_target_fill(fill.matched_size, fill.price) {
            error!(interval = %position.interval_id, error = %e, "Target fill rejected, position faulted");
        }
        position.target = None;
    }

    // -------------------------------------------------------------------------
    // Driving
    // -------------------------------------------------------------------------

    /// Handles completions until no task is outstanding.
    pub async fn drain(&mut self) {
        while self.in_flight > 0 {
            match self.rx.recv().await {
                Some(event) => self.handle_execution_event(event),
                None => break,
            }
        }
    }

    /// Runs the monitor ticks due up to `until`, draining after each.
    async fn advance_to(&mut self, until: DateTime<Utc>) {
        let period = self.monitor_period();
        let Some(mut next) = self.next_tick else {
            self.next_tick = Some(until + period);
            return;
        };
        while next <= until {
            self.on_monitor_tick(next);
            self.drain().await;
            next += period;
        }
        self.next_tick = Some(next);
    }

    /// Processes one event in event time: due monitor ticks first, then the
    /// event, then every task it started.
    pub async fn step(&mut self, event: MarketEvent) {
        self.advance_to(event.timestamp()).await;
        self.handle_event(event);
        self.drain().await;
    }

    /// Runs the clock to the end of every live interval and resolves them.
    pub async fn finish(&mut self) -> SessionReport {
        self.drain().await;
        if let Some(end) = self.intervals.values().map(|iv| iv.end).max() {
            self.advance_to(end).await;
            self.on_monitor_tick(end);
            self.drain().await;
        }
        for interval in self.intervals.values() {
            warn!(
                interval = %interval.id,
                phase = ?interval.phase(),
                busy = interval.is_busy(),
                "Interval unresolved at shutdown"
            );
        }
        let report = self.report();
        info!(
            session_pnl = %report.stats.session_pnl,
            intervals = report.stats.intervals,
            wins = report.stats.wins,
            losses = report.stats.losses,
            "Session finished"
        );
        report
    }

    /// Consumes a feed until it closes.
    pub async fn run(
        &mut self,
        mut feed: mpsc::Receiver<MarketEvent>,
        mode: ClockMode,
    ) -> SessionReport {
        info!(?mode, slug_prefix = %self.config.engine.slug_prefix, "Engine started");
        match mode {
            ClockMode::EventTime => {
                while let Some(event) = feed.recv().await {
                    self.step(event).await;
                }
                self.finish().await
            }
            ClockMode::Live => {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                    self.config.engine.monitor_interval_secs.max(1),
                ));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    let wake = tokio::select! {
                        biased;
                        Some(event) = self.rx.recv() => Wake::Execution(event),
                        _ = ticker.tick() => Wake::Tick,
                        event = feed.recv() => Wake::Feed(event),
                    };
                    match wake {
                        Wake::Execution(event) => self.handle_execution_event(event),
                        Wake::Tick => self.on_monitor_tick(Utc::now()),
                        Wake::Feed(Some(event)) => self.handle_event(event),
                        Wake::Feed(None) => break,
                    }
                }

                info!(in_flight = self.in_flight, "Feed closed, waiting for open orders");
                self.drain().await;
                self.report()
            }
        }
    }
}

/// Disables an exhausted trigger. An exhausted forced exit abandons the position.
fn note_exhaustion(position: &mut Position, trigger: ExitTrigger) {
    if !position.budgets.get(trigger).exhausted()
        || !position.state.can_exit()
        || position.open_shares <= Decimal::ZERO
    {
        return;
    }
    match trigger {
        ExitTrigger::Forced => {
            position.abandon();
            warn!(
                interval = %position.interval_id,
                open_shares = %position.open_shares,
                "Forced exit attempts exhausted, position abandoned"
            );
        }
        ExitTrigger::Dynamic | ExitTrigger::Target => {
            warn!(interval = %position.interval_id, %trigger, "Exit attempts exhausted, trigger disabled");
        }
    }
}
