//! replay CLI command: runs the engine over recorded market events.
//!
//! Events are read from a JSON-lines file (one `MarketEvent` per line) and fed
//! in event time. Orders go to the paper venue, which sees every book snapshot
//! before the engine does.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use rust_decimal::Decimal;
use serde::Serialize;
use updown_core::{AppConfig, MarketDiscovery, MarketEvent};
use updown_execution::{
    EngineDeps, GammaDiscovery, JsonlSink, NullSink, PaperGateway, RecordSink, RiskGovernor, SessionReport,
    SlugTokenDiscovery, TradingEngine,
};
use updown_signals::{oracle_from_config, CrossoverTracker, TemaTrend};

/// Arguments for the replay command.
#[derive(Args, Debug, Clone)]
pub struct ReplayArgs {
    /// Recorded market events (JSON lines)
    #[arg(short, long)]
    pub events: String,

    /// Base config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,

    /// Profile overlay (`Config.{profile}.toml` next to the base file)
    #[arg(long)]
    pub profile: Option<String>,

    /// Interval records output, overrides `records.path`
    #[arg(long)]
    pub records: Option<String>,

    /// Seed for the paper venue's partial-fill simulation
    #[arg(long)]
    pub seed: Option<u64>,

    /// Resolve outcome tokens through the Gamma API instead of slug-derived ids
    #[arg(long)]
    pub gamma: bool,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// Result of one replay run.
#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub events: usize,
    pub report: SessionReport,
    pub paper_cash: Decimal,
}

impl ReplaySummary {
    #[must_use]
    pub fn format_summary(&self) -> String {
        let c = &self.report.counters;
        let s = &self.report.stats;
        format!(
            "Replay Session Summary:\n\
             - Events: {}\n\
             - Intervals seen: {} | skipped: {}\n\
             - Buys submitted: {} | rejected: {} | unfilled: {}\n\
             - Positions opened: {} | sells filled: {} | targets placed: {}\n\
             - Records emitted: {}\n\
             - Wins: {} | Losses: {}\n\
             - Session P&L: ${:.2}{}\n\
             - Paper cash: ${:.2}",
            self.events,
            c.intervals_seen,
            c.intervals_skipped,
            c.buys_submitted,
            c.buys_rejected,
            c.buys_unfilled,
            c.positions_opened,
            c.sells_filled,
            c.targets_placed,
            c.records_emitted,
            s.wins,
            s.losses,
            s.session_pnl,
            if s.tripped { " (risk tripped)" } else { "" },
            self.paper_cash,
        )
    }
}

/// Runs the replay command.
///
/// # Errors
/// Returns an error if the config, the event file or the records file cannot be used.
pub async fn run_replay(args: ReplayArgs) -> Result<()> {
    let mut config = super::load_config(&args.config, args.profile.as_deref())?;
    if let Some(seed) = args.seed {
        config.paper.random_seed = Some(seed);
    }

    let events = read_events(&args.events)?;
    let records = record_sink(&config, args.records.as_deref())?;
    let discovery: Arc<dyn MarketDiscovery> = if args.gamma {
        Arc::new(GammaDiscovery::new(&config.discovery).context("failed to build Gamma client")?)
    } else {
        Arc::new(SlugTokenDiscovery)
    };
    tracing::info!(
        events = events.len(),
        file = %args.events,
        slug_prefix = %config.engine.slug_prefix,
        gamma = args.gamma,
        "Starting replay"
    );

    let summary = replay(config, events, discovery, records).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary.format_summary());
    }
    Ok(())
}

/// Feeds `events` through a paper-backed engine and resolves every window.
///
/// # Errors
/// Returns an error if the fair-value oracle cannot be built.
pub async fn replay(
    mut config: AppConfig,
    events: Vec<MarketEvent>,
    discovery: Arc<dyn MarketDiscovery>,
    records: Arc<dyn RecordSink>,
) -> Result<ReplaySummary> {
    // The paper venue answers on the first read.
    config.execution.poll_interval_ms = 0;
    config.execution.order_timeout_secs = 0;

    let signals = &config.signals;
    let oracle = oracle_from_config(config.entry.strong_move_pct, signals)
        .context("failed to build fair value oracle")?;
    let trend = TemaTrend::new(signals.trend_candle_secs, signals.trend_fast, signals.trend_slow);
    let crossover =
        CrossoverTracker::new(signals.cross_candle_secs, signals.cross_fast, signals.cross_slow);

    let paper = Arc::new(PaperGateway::new(config.paper.clone()));
    let risk = Arc::new(RiskGovernor::new(config.risk.clone()));
    let mut engine = TradingEngine::new(
        config,
        EngineDeps {
            gateway: paper.clone(),
            discovery,
            oracle,
            trend: Box::new(trend),
            crossover: Box::new(crossover),
            risk,
            records,
        },
    );

    let count = events.len();
    for event in events {
        if let MarketEvent::Book(book) = &event {
            paper.update_book(book.clone());
        }
        engine.step(event).await;
    }
    let report = engine.finish().await;

    Ok(ReplaySummary {
        events: count,
        report,
        paper_cash: paper.cash(),
    })
}

/// Parses a JSON-lines event file. Blank lines are skipped.
///
/// # Errors
/// Returns an error naming the first line that is not a valid event.
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<MarketEvent>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read events from {}", path.display()))?;

    let mut events = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: MarketEvent = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid market event", path.display(), idx + 1))?;
        events.push(event);
    }
    Ok(events)
}

fn record_sink(config: &AppConfig, path: Option<&str>) -> Result<Arc<dyn RecordSink>> {
    let path = match path {
        Some(path) => path,
        None if config.records.enabled => config.records.path.as_str(),
        None => return Ok(Arc::new(NullSink)),
    };
    let sink = JsonlSink::new(path)
        .with_context(|| format!("failed to open records file {path}"))?;
    tracing::info!(path = %sink.path().display(), "Writing interval records");
    Ok(Arc::new(sink))
}
