//! Paper trading gateway.
//!
//! Simulates the venue against the latest books pushed in with
//! [`PaperGateway::update_book`]:
//!
//! - buys cross at the best ask if the limit allows it, otherwise they expire;
//! - sells cross at the best bid if the limit allows it, otherwise they rest
//!   and fill at their limit once a later book bids at or above it;
//! - `partial_fill_rate` turns a crossing fill into a partial one whose
//!   remainder is canceled;
//! - bought shares are credited net of `fee_shrink_pct`.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tracing::debug;
use updown_core::{BookSnapshot, PaperConfig};
use uuid::Uuid;

use crate::gateway::{GatewayError, OrderGateway, OrderIntent, OrderReport, OrderSide, OrderStatus};

#[derive(Debug, Clone)]
struct PaperOrder {
    intent: OrderIntent,
    status: OrderStatus,
    matched: Decimal,
    avg_price: Option<Decimal>,
}

impl PaperOrder {
    fn remaining(&self) -> Decimal {
        self.intent.size - self.matched
    }

    fn report(&self, order_id: &str) -> OrderReport {
        OrderReport::new(order_id, self.status, self.matched, self.avg_price)
    }
}

#[derive(Debug)]
struct PaperState {
    cash: Decimal,
    holdings: HashMap<String, Decimal>,
    orders: HashMap<String, PaperOrder>,
    books: HashMap<String, BookSnapshot>,
}

impl PaperState {
    fn held(&self, token_id: &str) -> Decimal {
        self.holdings.get(token_id).copied().unwrap_or(Decimal::ZERO)
    }

    /// Shares committed to live sell orders on `token_id`.
    fn reserved(&self, token_id: &str) -> Decimal {
        self.orders
            .values()
            .filter(|o| {
                o.status == OrderStatus::Live
                    && o.intent.side == OrderSide::Sell
                    && o.intent.token_id == token_id
            })
            .map(PaperOrder::remaining)
            .sum()
    }

    fn settle_sell(&mut self, token_id: &str, size: Decimal, price: Decimal) {
        self.cash += size * price;
        let held = self.holdings.entry(token_id.to_string()).or_default();
        *held = (*held - size).max(Decimal::ZERO);
    }
}

/// In-process venue simulation.
pub struct PaperGateway {
    config: PaperConfig,
    state: RwLock<PaperState>,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for PaperGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("PaperGateway")
            .field("cash", &state.cash)
            .field("orders", &state.orders.len())
            .finish_non_exhaustive()
    }
}

impl PaperGateway {
    #[must_use]
    pub fn new(config: PaperConfig) -> Self {
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            state: RwLock::new(PaperState {
                cash: config.initial_balance,
                holdings: HashMap::new(),
                orders: HashMap::new(),
                books: HashMap::new(),
            }),
            rng: Mutex::new(rng),
            config,
        }
    }

    /// Stores a book and fills resting sells it crosses.
    pub fn update_book(&self, book: BookSnapshot) {
        let mut state = self.state.write();
        if let Some(bid) = book.best_bid() {
            let crossed: Vec<String> = state
                .orders
                .iter()
                .filter(|(_, o)| {
                    o.status == OrderStatus::Live
                        && o.intent.side == OrderSide::Sell
                        && o.intent.token_id == book.token_id
                        && bid >= o.intent.limit_price
                })
                .map(|(id, _)| id.clone())
                .collect();

            for order_id in crossed {
                let Some(order) = state.orders.get_mut(&order_id) else {
                    continue;
                };
                let remaining = order.remaining();
                let price = order.intent.limit_price;
                let prior = order.matched * order.avg_price.unwrap_or(price);
                order.matched = order.intent.size;
                order.avg_price = Some((prior + remaining * price) / order.intent.size);
                order.status = OrderStatus::Matched;
                let token_id = order.intent.token_id.clone();
                state.settle_sell(&token_id, remaining, price);
                debug!(order_id = %order_id, size = %remaining, price = %price, "Resting paper sell filled");
            }
        }
        state.books.insert(book.token_id.clone(), book);
    }

    #[must_use]
    pub fn cash(&self) -> Decimal {
        self.state.read().cash
    }

    #[must_use]
    pub fn holdings(&self, token_id: &str) -> Decimal {
        self.state.read().held(token_id)
    }

    /// Shares filled for a crossing order: all of them, or a random partial.
    fn fill_size(&self, size: Decimal) -> Decimal {
        let mut rng = self.rng.lock();
        if self.config.partial_fill_rate <= 0.0 || rng.gen::<f64>() >= self.config.partial_fill_rate {
            return size;
        }
        let (lo, hi) = (
            self.config.min_partial_fill_pct,
            self.config.max_partial_fill_pct,
        );
        let pct = if lo < hi { rng.gen_range(lo..=hi) } else { lo };
        let pct = Decimal::from_f64_retain(pct).unwrap_or(Decimal::ONE);
        (size * pct).round_dp(2).min(size)
    }

    fn place_buy(&self, state: &mut PaperState, intent: &OrderIntent) -> Result<PaperOrder, GatewayError> {
        let ask = state
            .books
            .get(&intent.token_id)
            .and_then(BookSnapshot::best_ask);
        let Some(ask) = ask.filter(|a| *a <= intent.limit_price) else {
            return Ok(PaperOrder {
                intent: intent.clone(),
                status: OrderStatus::Expired,
                matched: Decimal::ZERO,
                avg_price: None,
            });
        };

        let size = self.fill_size(intent.size);
        let cost = size * ask;
        if cost > state.cash {
            return Err(GatewayError::InsufficientBalance {
                required: cost,
                available: state.cash,
            });
        }
        state.cash -= cost;
        let credited = size * (Decimal::ONE - self.config.fee_shrink_pct);
        *state.holdings.entry(intent.token_id.clone()).or_default() += credited;

        Ok(PaperOrder {
            intent: intent.clone(),
            status: if size >= intent.size {
                OrderStatus::Matched
            } else {
                OrderStatus::Cancelled
            },
            matched: size,
            avg_price: Some(ask),
        })
    }

    fn place_sell(&self, state: &mut PaperState, intent: &OrderIntent) -> Result<PaperOrder, GatewayError> {
        let available = state.held(&intent.token_id) - state.reserved(&intent.token_id);
        if intent.size > available {
            return Err(GatewayError::InsufficientBalance {
                required: intent.size,
                available: available.max(Decimal::ZERO),
            });
        }

        let bid = state
            .books
            .get(&intent.token_id)
            .and_then(BookSnapshot::best_bid);
        let Some(bid) = bid.filter(|b| *b >= intent.limit_price) else {
            return Ok(PaperOrder {
                intent: intent.clone(),
                status: OrderStatus::Live,
                matched: Decimal::ZERO,
                avg_price: None,
            });
        };

        let size = self.fill_size(intent.size);
        state.settle_sell(&intent.token_id, size, bid);
        Ok(PaperOrder {
            intent: intent.clone(),
            status: if size >= intent.size {
                OrderStatus::Matched
            } else {
                OrderStatus::Cancelled
            },
            matched: size,
            avg_price: Some(bid),
        })
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn place(&self, intent: &OrderIntent) -> Result<String, GatewayError> {
        let order_id = format!("paper-{}", Uuid::new_v4());
        let mut state = self.state.write();
        let order = match intent.side {
            OrderSide::Buy => self.place_buy(&mut state, intent)?,
            OrderSide::Sell => self.place_sell(&mut state, intent)?,
        };
        debug!(
            order_id = %order_id,
            side = %intent.side,
            status = %order.status,
            matched = %order.matched,
            "Paper order placed"
        );
        state.orders.insert(order_id.clone(), order);
        Ok(order_id)
    }

    async fn status(&self, order_id: &str) -> Result<OrderReport, GatewayError> {
        self.state
            .read()
            .orders
            .get(order_id)
            .map(|o| o.report(order_id))
            .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))
    }

    async fn cancel(&self, order_id: &str) -> Result<(), GatewayError> {
        let mut state = self.state.write();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))?;
        if order.status == OrderStatus::Live {
            order.status = OrderStatus::Cancelled;
        }
        Ok(())
    }

    async fn balance(&self, token_id: &str) -> Result<Decimal, GatewayError> {
        Ok(self.state.read().held(token_id))
    }
}
