use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{Exchange, ExchangeError};
use crate::config::ExchangeSettings;
use crate::models::{
    AckState, AssetBalance, ClientRequestId, ExchangeOrder, ExchangeOrderStatus, OrderAck,
    OrderIntent, OrderKind, Position, PriceBar, Side,
};

/// Failure injected into the next matching call
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    /// Fail without touching the book
    Fail(ExchangeError),
    /// Apply the request, then report a timeout to the caller
    ExecuteThenTimeout,
}

/// Number of calls per endpoint
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallCounts {
    pub server_time: usize,
    pub place_order: usize,
    pub cancel_order: usize,
    pub get_order: usize,
    pub open_orders: usize,
    pub positions: usize,
    pub klines: usize,
    pub ticker_price: usize,
}

#[derive(Default)]
struct PaperBook {
    orders: Vec<ExchangeOrder>,
    by_client_id: HashMap<ClientRequestId, usize>,
    positions: HashMap<String, Position>,
    marks: HashMap<String, f64>,
    bars: HashMap<String, Vec<PriceBar>>,
    balances: Vec<AssetBalance>,
    place_failures: VecDeque<ScriptedFailure>,
    cancel_failures: VecDeque<ScriptedFailure>,
    server_time_failures: VecDeque<ExchangeError>,
    next_order_id: u64,
    calls: CallCounts,
}

impl PaperBook {
    fn ack_for(order: &ExchangeOrder) -> OrderAck {
        OrderAck {
            exchange_order_id: Some(order.exchange_order_id.clone()),
            ack: AckState::Accepted,
            status: Some(order.status),
            filled_quantity: order.filled_quantity,
            avg_fill_price: order.avg_fill_price,
        }
    }

    fn apply_fill(&mut self, symbol: &str, side: Side, quantity: f64, price: f64) {
        let mark = self.marks.get(symbol).copied().unwrap_or(price);
        let position = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position {
                symbol: symbol.to_string(),
                net_quantity: 0.0,
                entry_price: 0.0,
                mark_price: mark,
                unrealized_pnl: 0.0,
                margin_used: 0.0,
                updated_at: Utc::now(),
            });

        let signed = side.sign() * quantity;
        let before = position.net_quantity;
        let after = before + signed;

        if before == 0.0 || before.signum() != after.signum() && after != 0.0 {
            // Opened or flipped
            position.entry_price = price;
        } else if before.signum() == signed.signum() {
            // Added to the position: weighted entry
            position.entry_price =
                (position.entry_price * before.abs() + price * quantity) / after.abs();
        }

        position.net_quantity = if after.abs() < 1e-12 { 0.0 } else { after };
        if position.net_quantity == 0.0 {
            position.entry_price = 0.0;
        }
        position.mark_price = mark;
        position.unrealized_pnl = position.pnl_at(mark);
        position.margin_used = (position.net_quantity * mark).abs();
        position.updated_at = Utc::now();
    }

    fn place(&mut self, intent: &OrderIntent) -> Result<OrderAck, ExchangeError> {
        let mark = self.marks.get(&intent.symbol).copied();
        let mut quantity = intent.quantity;

        if intent.reduce_only {
            let net = self
                .positions
                .get(&intent.symbol)
                .map(|p| p.net_quantity)
                .unwrap_or(0.0);
            if net == 0.0 || net.signum() == intent.side.sign() {
                return Err(ExchangeError::Rejected {
                    code: -2022,
                    message: "ReduceOnly Order is rejected.".to_string(),
                });
            }
            quantity = quantity.min(net.abs());
        }

        self.next_order_id += 1;
        let mut order = ExchangeOrder {
            symbol: intent.symbol.clone(),
            exchange_order_id: self.next_order_id.to_string(),
            client_request_id: Some(intent.client_request_id.clone()),
            side: intent.side,
            kind: intent.kind,
            quantity,
            price: intent.limit_price.unwrap_or(0.0),
            filled_quantity: 0.0,
            avg_fill_price: 0.0,
            status: ExchangeOrderStatus::New,
        };

        if intent.kind == OrderKind::Market {
            let price = mark.ok_or_else(|| ExchangeError::Rejected {
                code: -1121,
                message: format!("No mark price for {}", intent.symbol),
            })?;
            order.filled_quantity = quantity;
            order.avg_fill_price = price;
            order.status = ExchangeOrderStatus::Filled;
            self.apply_fill(&intent.symbol, intent.side, quantity, price);
        }

        let ack = Self::ack_for(&order);
        self.by_client_id
            .insert(intent.client_request_id.clone(), self.orders.len());
        self.orders.push(order);
        Ok(ack)
    }

    fn cancel(&mut self, exchange_order_id: &str) -> Result<OrderAck, ExchangeError> {
        let order = self
            .orders
            .iter_mut()
            .find(|o| o.exchange_order_id == exchange_order_id && o.status.is_live())
            .ok_or_else(|| ExchangeError::Rejected {
                code: -2011,
                message: "Unknown order sent.".to_string(),
            })?;
        order.status = ExchangeOrderStatus::Canceled;
        Ok(Self::ack_for(order))
    }
}

/// In-memory exchange for dry runs and tests
///
/// Market orders fill immediately at the mark price; limit orders rest until
/// [`PaperExchange::fill_order`] is called.
pub struct PaperExchange {
    book: Mutex<PaperBook>,
    honors_idempotency_keys: bool,
    server_skew_ms: i64,
    server_latency: Duration,
    order_latency: Duration,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            book: Mutex::new(PaperBook::default()),
            honors_idempotency_keys: true,
            server_skew_ms: 0,
            server_latency: Duration::ZERO,
            order_latency: Duration::ZERO,
        }
    }

    /// Paper stand-in for the configured venue, with its retry semantics
    pub fn from_settings(settings: &ExchangeSettings) -> Self {
        Self::new().with_idempotency_keys(settings.honors_idempotency_keys)
    }

    pub fn with_idempotency_keys(mut self, honored: bool) -> Self {
        self.honors_idempotency_keys = honored;
        self
    }

    /// Exchange clock runs this far ahead of the local clock
    pub fn with_server_skew_ms(mut self, skew_ms: i64) -> Self {
        self.server_skew_ms = skew_ms;
        self
    }

    /// Delay before answering server time queries
    pub fn with_server_latency(mut self, latency: Duration) -> Self {
        self.server_latency = latency;
        self
    }

    /// Delay between booking an order and answering the request
    pub fn with_order_latency(mut self, latency: Duration) -> Self {
        self.order_latency = latency;
        self
    }

    pub async fn set_mark(&self, symbol: &str, price: f64) {
        let mut book = self.book.lock().await;
        book.marks.insert(symbol.to_string(), price);
        if let Some(position) = book.positions.get_mut(symbol) {
            position.mark_price = price;
            position.unrealized_pnl = position.pnl_at(price);
        }
    }

    pub async fn set_position(&self, symbol: &str, net_quantity: f64, entry_price: f64) {
        let mut book = self.book.lock().await;
        let mark = book.marks.get(symbol).copied().unwrap_or(entry_price);
        let position = Position {
            symbol: symbol.to_string(),
            net_quantity,
            entry_price,
            mark_price: mark,
            unrealized_pnl: (mark - entry_price) * net_quantity,
            margin_used: (net_quantity * mark).abs(),
            updated_at: Utc::now(),
        };
        book.positions.insert(symbol.to_string(), position);
    }

    pub async fn set_balance(&self, asset: &str, balance: f64) {
        let mut book = self.book.lock().await;
        book.balances.retain(|b| b.asset != asset);
        book.balances.push(AssetBalance {
            asset: asset.to_string(),
            balance,
            available_balance: balance,
            unrealized_pnl: 0.0,
        });
    }

    pub async fn push_bars(&self, symbol: &str, bars: Vec<PriceBar>) {
        let mut book = self.book.lock().await;
        book.bars.entry(symbol.to_string()).or_default().extend(bars);
    }

    pub async fn fail_next_place(&self, failure: ScriptedFailure) {
        self.book.lock().await.place_failures.push_back(failure);
    }

    pub async fn fail_next_cancel(&self, failure: ScriptedFailure) {
        self.book.lock().await.cancel_failures.push_back(failure);
    }

    pub async fn fail_next_server_time(&self, error: ExchangeError) {
        self.book.lock().await.server_time_failures.push_back(error);
    }

    /// Fill (part of) a resting order
    pub async fn fill_order(
        &self,
        exchange_order_id: &str,
        quantity: f64,
        price: f64,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let mut book = self.book.lock().await;
        let idx = book
            .orders
            .iter()
            .position(|o| o.exchange_order_id == exchange_order_id && o.status.is_live())
            .ok_or_else(|| ExchangeError::Rejected {
                code: -2011,
                message: "Unknown order sent.".to_string(),
            })?;

        let (symbol, side, fill) = {
            let order = &mut book.orders[idx];
            let fill = quantity.min(order.quantity - order.filled_quantity);
            let filled_before = order.filled_quantity;
            order.filled_quantity += fill;
            order.avg_fill_price =
                (order.avg_fill_price * filled_before + price * fill) / order.filled_quantity;
            order.status = if order.filled_quantity + f64::EPSILON >= order.quantity {
                ExchangeOrderStatus::Filled
            } else {
                ExchangeOrderStatus::PartiallyFilled
            };
            (order.symbol.clone(), order.side, fill)
        };

        book.apply_fill(&symbol, side, fill, price);
        Ok(book.orders[idx].clone())
    }

    pub async fn calls(&self) -> CallCounts {
        self.book.lock().await.calls.clone()
    }

    pub async fn orders(&self) -> Vec<ExchangeOrder> {
        self.book.lock().await.orders.clone()
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    fn honors_idempotency_keys(&self) -> bool {
        self.honors_idempotency_keys
    }

    async fn server_time(&self) -> Result<i64, ExchangeError> {
        {
            let mut book = self.book.lock().await;
            book.calls.server_time += 1;
            if let Some(error) = book.server_time_failures.pop_front() {
                return Err(error);
            }
        }
        if !self.server_latency.is_zero() {
            tokio::time::sleep(self.server_latency).await;
        }
        Ok(Utc::now().timestamp_millis() + self.server_skew_ms)
    }

    async fn place_order(
        &self,
        intent: &OrderIntent,
        _timestamp_ms: i64,
    ) -> Result<OrderAck, ExchangeError> {
        let (ack, failure) = {
            let mut book = self.book.lock().await;
            book.calls.place_order += 1;

            let failure = book.place_failures.pop_front();
            if let Some(ScriptedFailure::Fail(error)) = failure {
                return Err(error);
            }

            let duplicate = if self.honors_idempotency_keys {
                book.by_client_id.get(&intent.client_request_id).copied()
            } else {
                None
            };
            match duplicate {
                Some(idx) => {
                    tracing::debug!(
                        client_request_id = %intent.client_request_id,
                        "Paper exchange recognized duplicate client id"
                    );
                    (PaperBook::ack_for(&book.orders[idx]), None)
                }
                None => (book.place(intent)?, failure),
            }
        };

        // The order is on the book; only the answer is slow
        if !self.order_latency.is_zero() {
            tokio::time::sleep(self.order_latency).await;
        }

        if matches!(failure, Some(ScriptedFailure::ExecuteThenTimeout)) {
            return Err(ExchangeError::transient("request timed out after delivery"));
        }
        Ok(ack)
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        exchange_order_id: &str,
        _idempotency_key: &ClientRequestId,
        _timestamp_ms: i64,
    ) -> Result<OrderAck, ExchangeError> {
        let mut book = self.book.lock().await;
        book.calls.cancel_order += 1;

        let failure = book.cancel_failures.pop_front();
        if let Some(ScriptedFailure::Fail(error)) = failure {
            return Err(error);
        }

        let ack = book.cancel(exchange_order_id)?;
        if matches!(failure, Some(ScriptedFailure::ExecuteThenTimeout)) {
            return Err(ExchangeError::transient("request timed out after delivery"));
        }
        Ok(ack)
    }

    async fn get_order(
        &self,
        _symbol: &str,
        client_request_id: &ClientRequestId,
        _timestamp_ms: i64,
    ) -> Result<Option<ExchangeOrder>, ExchangeError> {
        let mut book = self.book.lock().await;
        book.calls.get_order += 1;
        Ok(book
            .by_client_id
            .get(client_request_id)
            .map(|&idx| book.orders[idx].clone()))
    }

    async fn open_orders(
        &self,
        symbol: Option<&str>,
        _timestamp_ms: i64,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let mut book = self.book.lock().await;
        book.calls.open_orders += 1;
        Ok(book
            .orders
            .iter()
            .filter(|o| o.status.is_live())
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn positions(&self, _timestamp_ms: i64) -> Result<Vec<Position>, ExchangeError> {
        let mut book = self.book.lock().await;
        book.calls.positions += 1;
        Ok(book.positions.values().cloned().collect())
    }

    async fn balances(&self, _timestamp_ms: i64) -> Result<Vec<AssetBalance>, ExchangeError> {
        Ok(self.book.lock().await.balances.clone())
    }

    async fn klines(
        &self,
        symbol: &str,
        _interval: &str,
        limit: u16,
    ) -> Result<Vec<PriceBar>, ExchangeError> {
        let mut book = self.book.lock().await;
        book.calls.klines += 1;
        let bars = book.bars.get(symbol).cloned().unwrap_or_default();
        let skip = bars.len().saturating_sub(limit as usize);
        Ok(bars.into_iter().skip(skip).collect())
    }

    async fn ticker_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let mut book = self.book.lock().await;
        book.calls.ticker_price += 1;
        book.marks
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Rejected {
                code: -1121,
                message: "Invalid symbol.".to_string(),
            })
    }
}
