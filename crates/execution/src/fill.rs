//! Order execution and fill reconciliation.
//!
//! Venue status reports are noisy: a "matched" order can briefly report zero
//! matched shares, the average price can lag the match, and a live order can
//! be partially filled when it times out. [`OrderExecutor`] turns that stream
//! of reports into one authoritative [`FillRecord`]:
//!
//! - non-zero matched size on a terminal report is trusted immediately;
//! - partial matches on a live order become the confirmed floor;
//! - "matched" with zero size counts as a full fill only after
//!   `phantom_confirm_polls` consecutive confirmations;
//! - a fill without an average price gets one extra poll, then falls back to
//!   the limit price;
//! - on timeout the order is canceled, read once more, and the best confirmed
//!   partial is final.
//!
//! Every gateway request is bounded: status reads by the time left before the
//! order deadline, everything else by `order_timeout_secs`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use updown_core::ExecutionConfig;

use crate::gateway::{GatewayError, OrderGateway, OrderIntent, OrderReport, OrderStatus};

/// Status reads attempted after a cancel before giving up.
const FINAL_READ_ATTEMPTS: u32 = 3;

// =============================================================================
// Fill Record
// =============================================================================

/// Where the recorded fill price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSource {
    /// Venue-reported average match price.
    Venue,
    /// Requested limit price, used when the venue reported none.
    Limit,
}

/// Terminal outcome of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillStatus {
    Filled,
    Partial,
    Cancelled,
    Expired,
}

/// Authoritative result of one order. All accounting derives from this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillRecord {
    pub order_id: String,
    pub requested_size: Decimal,
    pub limit_price: Decimal,
    pub matched_size: Decimal,
    pub price: Decimal,
    pub price_source: PriceSource,
    pub status: FillStatus,
}

impl FillRecord {
    fn build(
        order_id: &str,
        intent: &OrderIntent,
        matched: Decimal,
        avg_price: Option<Decimal>,
        terminal: FillStatus,
    ) -> Self {
        let matched = matched.min(intent.size).max(Decimal::ZERO);
        let (price, price_source) = match avg_price {
            Some(p) => (p, PriceSource::Venue),
            None => (intent.limit_price, PriceSource::Limit),
        };
        let status = if matched >= intent.size {
            FillStatus::Filled
        } else if matched > Decimal::ZERO {
            FillStatus::Partial
        } else {
            terminal
        };
        Self {
            order_id: order_id.to_string(),
            requested_size: intent.size,
            limit_price: intent.limit_price,
            matched_size: matched,
            price,
            price_source,
            status,
        }
    }

    /// Returns true if nothing matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.matched_size <= Decimal::ZERO
    }

    /// Matched size × price.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.matched_size * self.price
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors submitting an order.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("invalid order: {0}")]
    InvalidIntent(String),

    /// The placement request timed out; the venue may hold the order.
    #[error("placement unconfirmed: {0}")]
    Unconfirmed(GatewayError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

// =============================================================================
// Executor
// =============================================================================

/// Single path through which buy and sell orders reach the gateway.
pub struct OrderExecutor {
    gateway: Arc<dyn OrderGateway>,
    config: ExecutionConfig,
}

impl std::fmt::Debug for OrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OrderExecutor {
    #[must_use]
    pub fn new(gateway: Arc<dyn OrderGateway>, config: ExecutionConfig) -> Self {
        Self { gateway, config }
    }

    #[must_use]
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.order_timeout_secs)
    }

    fn validate(&self, intent: &OrderIntent) -> Result<(), ExecutionError> {
        if intent.size <= Decimal::ZERO {
            return Err(ExecutionError::InvalidIntent(format!(
                "size must be positive, got {}",
                intent.size
            )));
        }
        if intent.limit_price <= Decimal::ZERO || intent.limit_price >= Decimal::ONE {
            return Err(ExecutionError::InvalidIntent(format!(
                "limit price must lie in (0, 1), got {}",
                intent.limit_price
            )));
        }
        Ok(())
    }

    /// Submits an order. An error means the venue did not accept it.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid intent or a gateway rejection.
    pub async fn place(&self, intent: &OrderIntent) -> Result<String, ExecutionError> {
        self.validate(intent)?;
        let order_id = match bounded(self.request_timeout(), self.gateway.place(intent)).await {
            Ok(order_id) => order_id,
            Err(GatewayError::Timeout) => {
                warn!(token = %intent.token_id, side = %intent.side, "Order placement timed out");
                return Err(ExecutionError::Unconfirmed(GatewayError::Timeout));
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            order_id = %order_id,
            side = %intent.side,
            token = %intent.token_id,
            size = %intent.size,
            price = %intent.limit_price,
            "Order accepted"
        );
        Ok(order_id)
    }

    /// Polls an accepted order to a final fill record. Never fails: errors are
    /// retried until the timeout, after which the order is canceled.
    pub async fn reconcile(&self, order_id: &str, intent: &OrderIntent) -> FillRecord {
        let deadline = Instant::now() + Duration::from_secs(self.config.order_timeout_secs);
        let mut confirmed = Decimal::ZERO;
        let mut confirmed_price: Option<Decimal> = None;
        let mut phantom_polls = 0u32;

        loop {
            sleep(self.poll_interval()).await;

            let remaining = deadline.saturating_duration_since(Instant::now());
            match bounded(remaining, self.gateway.status(order_id)).await {
                Ok(report) => {
                    if report.matched_size > confirmed {
                        confirmed = report.matched_size.min(intent.size);
                        confirmed_price = report.avg_price.or(confirmed_price);
                    }

                    match report.status {
                        OrderStatus::Matched if report.has_fills() => {
                            let avg = match report.avg_price {
                                Some(p) => Some(p),
                                None => self.poll_avg_price(order_id).await,
                            };
                            let record = FillRecord::build(
                                order_id,
                                intent,
                                report.matched_size,
                                avg,
                                FillStatus::Cancelled,
                            );
                            debug!(order_id, matched = %record.matched_size, price = %record.price, "Order matched");
                            return record;
                        }
                        OrderStatus::Matched => {
                            phantom_polls += 1;
                            if phantom_polls >= self.config.phantom_confirm_polls {
                                warn!(
                                    order_id,
                                    polls = phantom_polls,
                                    "Matched with zero size confirmed, assuming full fill"
                                );
                                return FillRecord::build(
                                    order_id,
                                    intent,
                                    intent.size,
                                    report.avg_price,
                                    FillStatus::Cancelled,
                                );
                            }
                            debug!(order_id, polls = phantom_polls, "Matched with zero size, confirming");
                        }
                        OrderStatus::Cancelled | OrderStatus::Rejected => {
                            return FillRecord::build(
                                order_id,
                                intent,
                                confirmed,
                                confirmed_price,
                                FillStatus::Cancelled,
                            );
                        }
                        OrderStatus::Expired => {
                            return FillRecord::build(
                                order_id,
                                intent,
                                confirmed,
                                confirmed_price,
                                FillStatus::Expired,
                            );
                        }
                        OrderStatus::Live => {
                            phantom_polls = 0;
                        }
                    }
                }
                Err(e) => {
                    debug!(order_id, error = %e, "Status poll failed, retrying");
                }
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        warn!(order_id, confirmed = %confirmed, "Order timed out, canceling");
        let record = self
            .cancel_and_read(order_id, intent, confirmed, confirmed_price)
            .await;
        info!(
            order_id,
            matched = %record.matched_size,
            status = ?record.status,
            "Timed-out order finalized"
        );
        record
    }

    /// Cancels an order and returns its cumulative fill. `floor` is the matched
    /// size already known; the result never reports less.
    pub async fn cancel_and_reconcile(
        &self,
        order_id: &str,
        intent: &OrderIntent,
        floor: Decimal,
    ) -> FillRecord {
        self.cancel_and_read(order_id, intent, floor, None).await
    }

    /// Reads the current status of an order.
    ///
    /// # Errors
    ///
    /// Returns the gateway error.
    pub async fn status(&self, order_id: &str) -> Result<OrderReport, GatewayError> {
        bounded(self.request_timeout(), self.gateway.status(order_id)).await
    }

    /// Shares of a token currently held.
    ///
    /// # Errors
    ///
    /// Returns the gateway error.
    pub async fn balance(&self, token_id: &str) -> Result<Decimal, GatewayError> {
        bounded(self.request_timeout(), self.gateway.balance(token_id)).await
    }

    async fn poll_avg_price(&self, order_id: &str) -> Option<Decimal> {
        sleep(self.poll_interval()).await;
        match self.status(order_id).await {
            Ok(report) if report.avg_price.is_some() => report.avg_price,
            Ok(_) => {
                debug!(order_id, "No average price reported, using limit price");
                None
            }
            Err(e) => {
                debug!(order_id, error = %e, "Average price poll failed, using limit price");
                None
            }
        }
    }

    async fn cancel_and_read(
        &self,
        order_id: &str,
        intent: &OrderIntent,
        floor: Decimal,
        floor_price: Option<Decimal>,
    ) -> FillRecord {
        if let Err(e) = bounded(self.request_timeout(), self.gateway.cancel(order_id)).await {
            warn!(order_id, error = %e, "Cancel failed");
        }

        let mut matched = floor;
        let mut price = floor_price;
        let mut terminal = FillStatus::Cancelled;
        for attempt in 1..=FINAL_READ_ATTEMPTS {
            match self.status(order_id).await {
                Ok(report) => {
                    if report.matched_size >= matched {
                        matched = report.matched_size;
                        price = report.avg_price.or(price);
                    }
                    if report.status == OrderStatus::Expired {
                        terminal = FillStatus::Expired;
                    }
                    break;
                }
                Err(e) => {
                    warn!(order_id, attempt, error = %e, "Final status read failed");
                    if attempt < FINAL_READ_ATTEMPTS {
                        sleep(self.poll_interval()).await;
                    }
                }
            }
        }

        FillRecord::build(order_id, intent, matched, price, terminal)
    }
}

/// Runs one gateway request, failing with [`GatewayError::Timeout`] after `limit`.
async fn bounded<T>(
    limit: Duration,
    request: impl Future<Output = Result<T, GatewayError>>,
) -> Result<T, GatewayError> {
    timeout(limit, request)
        .await
        .unwrap_or(Err(GatewayError::Timeout))
}
