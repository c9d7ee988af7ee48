//! Session risk governor.
//!
//! Tracks cumulative realized P&L for the process lifetime and halts new
//! entries once the session loss reaches the configured limit. Exits are never
//! gated: open positions keep being monitored and closed.
//!
//! # Example
//!
//! ```
//! use updown_core::RiskConfig;
//! use updown_execution::risk::RiskGovernor;
//! use rust_decimal_macros::dec;
//!
//! let governor = RiskGovernor::new(RiskConfig { max_session_loss: dec!(15) });
//! assert!(governor.can_trade().is_ok());
//!
//! governor.record_interval(dec!(-15));
//! assert!(governor.can_trade().is_err());
//! ```

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use updown_core::RiskConfig;

/// Reasons new entries are blocked.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RiskError {
    #[error("session loss limit reached: pnl {session_pnl} <= -{max_loss}")]
    SessionLossExceeded {
        session_pnl: Decimal,
        max_loss: Decimal,
    },

    #[error("risk governor manually tripped")]
    ManuallyTripped,
}

#[derive(Debug, Default)]
struct RiskState {
    session_pnl: Decimal,
    intervals: u32,
    wins: u32,
    losses: u32,
    manually_tripped: bool,
    trip_logged: bool,
}

/// Snapshot of session statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_pnl: Decimal,
    pub intervals: u32,
    pub wins: u32,
    pub losses: u32,
    pub tripped: bool,
}

/// Session-level loss limit. Shared as `Arc<RiskGovernor>`.
pub struct RiskGovernor {
    config: RiskConfig,
    state: RwLock<RiskState>,
}

impl std::fmt::Debug for RiskGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("RiskGovernor")
            .field("config", &self.config)
            .field("session_pnl", &state.session_pnl)
            .field("intervals", &state.intervals)
            .finish()
    }
}

impl RiskGovernor {
    #[must_use]
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            state: RwLock::new(RiskState::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Checks whether a new entry may be placed.
    ///
    /// # Errors
    ///
    /// - `RiskError::ManuallyTripped` - an operator halted trading
    /// - `RiskError::SessionLossExceeded` - cumulative P&L at or below `-max_session_loss`
    pub fn can_trade(&self) -> Result<(), RiskError> {
        let state = self.state.read();
        if state.manually_tripped {
            return Err(RiskError::ManuallyTripped);
        }
        if state.session_pnl <= -self.config.max_session_loss {
            return Err(RiskError::SessionLossExceeded {
                session_pnl: state.session_pnl,
                max_loss: self.config.max_session_loss,
            });
        }
        Ok(())
    }

    /// Records the final P&L of a resolved interval.
    pub fn record_interval(&self, pnl: Decimal) {
        let mut state = self.state.write();
        state.session_pnl += pnl;
        state.intervals += 1;
        if pnl > Decimal::ZERO {
            state.wins += 1;
        } else if pnl < Decimal::ZERO {
            state.losses += 1;
        }
        info!(pnl = %pnl, session_pnl = %state.session_pnl, "Interval P&L recorded");

        if state.session_pnl <= -self.config.max_session_loss && !state.trip_logged {
            state.trip_logged = true;
            warn!(
                session_pnl = %state.session_pnl,
                max_loss = %self.config.max_session_loss,
                "Session loss limit reached, new entries halted"
            );
        }
    }

    /// Halts new entries until the process restarts.
    pub fn trip(&self) {
        self.state.write().manually_tripped = true;
    }

    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.can_trade().is_err()
    }

    #[must_use]
    pub fn session_pnl(&self) -> Decimal {
        self.state.read().session_pnl
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let state = self.state.read();
        SessionStats {
            session_pnl: state.session_pnl,
            intervals: state.intervals,
            wins: state.wins,
            losses: state.losses,
            tripped: state.manually_tripped
                || state.session_pnl <= -self.config.max_session_loss,
        }
    }
}
