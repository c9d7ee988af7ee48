//! Interval lifecycle, order execution and position management.
//!
//! [`TradingEngine`] drives one market window at a time. It gates and sizes
//! entries through [`EntryEngine`], places orders through an [`OrderGateway`]
//! wrapped by [`OrderExecutor`], and exits through [`ExitPolicy`]. Every
//! window that traded produces an [`IntervalRecord`].

pub mod discovery;
pub mod engine;
pub mod entry;
pub mod exit;
pub mod fill;
pub mod gateway;
pub mod interval;
pub mod paper;
pub mod position;
pub mod record;
pub mod risk;

pub use discovery::{GammaDiscovery, SlugTokenDiscovery};
pub use engine::{
    BuyFill, ClockMode, EngineDeps, ExecutionEvent, SellCompletion, SellResult, SessionCounters,
    SessionReport, TradingEngine,
};
pub use entry::{size_order, EntryContext, EntryDecision, EntryEngine, EntryRejection, SignalStrength};
pub use exit::{plan_sell, ExitAction, ExitContext, ExitPolicy, SellSkip};
pub use fill::{ExecutionError, FillRecord, FillStatus, OrderExecutor, PriceSource};
pub use gateway::{
    GatewayError, OrderGateway, OrderIntent, OrderKind, OrderReport, OrderSide, OrderStatus,
};
pub use interval::{EntrySnapshot, Interval, IntervalPhase};
pub use paper::PaperGateway;
pub use position::{
    AttemptBudget, ExitBudgets, ExitTrigger, Position, PositionError, PositionState, RestingTarget,
};
pub use record::{ExitKind, IntervalRecord, JsonlSink, MemorySink, NullSink, RecordError, RecordSink};
pub use risk::{RiskError, RiskGovernor, SessionStats};
