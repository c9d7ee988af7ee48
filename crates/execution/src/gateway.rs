//! Order gateway abstraction.
//!
//! The gateway is the venue boundary: it places, inspects and cancels orders
//! and reports token balances. Only [`crate::fill::OrderExecutor`] calls it
//! for order actions.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use updown_core::Outcome;

// =============================================================================
// Order Intent
// =============================================================================

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// How the order is expected to interact with the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    /// Priced through the touch so it crosses immediately.
    Aggressive,
    /// Rests on the book until matched or canceled.
    Resting,
}

/// An order the engine wants placed. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub side: OrderSide,
    pub kind: OrderKind,
    pub token_id: String,
    pub outcome: Outcome,
    /// Shares.
    pub size: Decimal,
    /// Limit price; ceiling for buys, floor for sells.
    pub limit_price: Decimal,
}

impl OrderIntent {
    /// Aggressive buy.
    #[must_use]
    pub fn buy(
        token_id: impl Into<String>,
        outcome: Outcome,
        size: Decimal,
        limit_price: Decimal,
    ) -> Self {
        Self {
            side: OrderSide::Buy,
            kind: OrderKind::Aggressive,
            token_id: token_id.into(),
            outcome,
            size,
            limit_price,
        }
    }

    /// Aggressive sell.
    #[must_use]
    pub fn sell(
        token_id: impl Into<String>,
        outcome: Outcome,
        size: Decimal,
        limit_price: Decimal,
    ) -> Self {
        Self {
            side: OrderSide::Sell,
            kind: OrderKind::Aggressive,
            token_id: token_id.into(),
            outcome,
            size,
            limit_price,
        }
    }

    /// Resting sell, e.g. a profit target.
    #[must_use]
    pub fn resting_sell(
        token_id: impl Into<String>,
        outcome: Outcome,
        size: Decimal,
        limit_price: Decimal,
    ) -> Self {
        Self {
            kind: OrderKind::Resting,
            ..Self::sell(token_id, outcome, size, limit_price)
        }
    }

    /// Size × limit price.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.size * self.limit_price
    }
}

// =============================================================================
// Order Status
// =============================================================================

/// Venue order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// On the book, possibly partially matched.
    Live,
    /// Fully matched.
    Matched,
    Cancelled,
    Expired,
    Rejected,
}

impl OrderStatus {
    /// Returns true if no further matching can happen.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Live)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Live => "LIVE",
            Self::Matched => "MATCHED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
            Self::Rejected => "REJECTED",
        };
        write!(f, "{s}")
    }
}

/// One status read of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReport {
    pub order_id: String,
    pub status: OrderStatus,
    /// Cumulative matched shares.
    pub matched_size: Decimal,
    /// Venue average match price. `None` means not reported, distinct from zero.
    pub avg_price: Option<Decimal>,
}

impl OrderReport {
    #[must_use]
    pub fn new(
        order_id: impl Into<String>,
        status: OrderStatus,
        matched_size: Decimal,
        avg_price: Option<Decimal>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            status,
            matched_size,
            avg_price,
        }
    }

    /// Returns true if any shares matched.
    #[must_use]
    pub fn has_fills(&self) -> bool {
        self.matched_size > Decimal::ZERO
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by an order gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    #[error("order not found: {0}")]
    NotFound(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited")]
    RateLimited,

    #[error("network error: {0}")]
    Network(String),

    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },
}

impl GatewayError {
    /// Returns true if the same request may succeed later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::RateLimited | Self::Network(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Rejected(_) | Self::InsufficientBalance { .. } | Self::NotFound(_) => false,
        }
    }
}

// =============================================================================
// Gateway trait
// =============================================================================

/// Venue order interface.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Places an order and returns its id. An error means the venue did not accept it.
    async fn place(&self, intent: &OrderIntent) -> Result<String, GatewayError>;

    /// Reads an order's current status.
    async fn status(&self, order_id: &str) -> Result<OrderReport, GatewayError>;

    /// Cancels an order. Canceling a terminal order is not an error.
    async fn cancel(&self, order_id: &str) -> Result<(), GatewayError>;

    /// Shares of `token_id` currently held.
    async fn balance(&self, token_id: &str) -> Result<Decimal, GatewayError>;
}
