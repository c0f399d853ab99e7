use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderKind {
    Market,
    Limit,
}

impl OrderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderKind::Market => "MARKET",
            OrderKind::Limit => "LIMIT",
        }
    }
}

/// Idempotency key attached to every order this process sends
///
/// Sent to the exchange as the client order id, so it must stay within
/// 36 characters of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientRequestId(String);

impl ClientRequestId {
    /// Generate a fresh, globally unique id
    pub fn generate() -> Self {
        Self(format!("fb{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientRequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ClientRequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ClientRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A caller-issued request to trade. Immutable once issued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderIntent {
    pub client_request_id: ClientRequestId,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    /// Exit orders only ever shrink a position
    pub reduce_only: bool,
}

impl OrderIntent {
    pub fn market(symbol: &str, side: Side, quantity: f64) -> Self {
        Self {
            client_request_id: ClientRequestId::generate(),
            symbol: symbol.to_uppercase(),
            side,
            kind: OrderKind::Market,
            quantity,
            limit_price: None,
            reduce_only: false,
        }
    }

    pub fn limit(symbol: &str, side: Side, quantity: f64, price: f64) -> Self {
        Self {
            client_request_id: ClientRequestId::generate(),
            symbol: symbol.to_uppercase(),
            side,
            kind: OrderKind::Limit,
            quantity,
            limit_price: Some(price),
            reduce_only: false,
        }
    }

    /// Replace the generated id (resubmissions, tests)
    pub fn with_client_request_id(mut self, id: impl Into<ClientRequestId>) -> Self {
        self.client_request_id = id.into();
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Why an order ended up rejected
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RejectReason {
    /// The exchange refused the request
    Exchange { code: i64, message: String },
    /// Retries exhausted (or an unsafe retry refused) before an acknowledgment.
    /// The outcome is unknown until reconciliation runs.
    SubmissionFailed,
    /// Reconciliation found no trace of the order on the exchange
    ReconciliationMismatch,
    /// The clock went stale between acceptance and sending
    ClockUnsynced,
    /// Cancelled by the caller while the submission was still in flight
    CancelledBeforeAck,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Exchange { code, message } => write!(f, "exchange ({}): {}", code, message),
            RejectReason::SubmissionFailed => f.write_str("submission failed"),
            RejectReason::ReconciliationMismatch => f.write_str("reconciliation mismatch"),
            RejectReason::ClockUnsynced => f.write_str("clock unsynced"),
            RejectReason::CancelledBeforeAck => f.write_str("cancelled before acknowledgment"),
        }
    }
}

/// Order lifecycle
///
/// `Pending -> Acknowledged -> PartiallyFilled* -> Filled`,
/// `Pending -> Rejected`, `Acknowledged | PartiallyFilled -> Cancelled`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum OrderState {
    Pending,
    Acknowledged,
    PartiallyFilled,
    Filled,
    Rejected(RejectReason),
    Cancelled,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Rejected(_) | OrderState::Cancelled
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    ///
    /// Staying in `PartiallyFilled` is allowed so fill quantities can grow.
    pub fn can_transition_to(&self, next: &OrderState) -> bool {
        use OrderState::*;
        match (self, next) {
            (Pending, Acknowledged | PartiallyFilled | Filled | Rejected(_)) => true,
            (Acknowledged, PartiallyFilled | Filled | Cancelled) => true,
            (PartiallyFilled, PartiallyFilled | Filled | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderState::Pending => f.write_str("PENDING"),
            OrderState::Acknowledged => f.write_str("ACKNOWLEDGED"),
            OrderState::PartiallyFilled => f.write_str("PARTIALLY_FILLED"),
            OrderState::Filled => f.write_str("FILLED"),
            OrderState::Rejected(reason) => write!(f, "REJECTED ({})", reason),
            OrderState::Cancelled => f.write_str("CANCELLED"),
        }
    }
}

/// Local view of one order, keyed by client request id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRecord {
    pub client_request_id: ClientRequestId,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub reduce_only: bool,
    pub exchange_order_id: Option<String>,
    pub state: OrderState,
    pub filled_quantity: f64,
    pub avg_fill_price: f64,
    pub last_updated: DateTime<Utc>,
}

impl OrderRecord {
    pub fn pending(intent: &OrderIntent) -> Self {
        Self {
            client_request_id: intent.client_request_id.clone(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            kind: intent.kind,
            quantity: intent.quantity,
            limit_price: intent.limit_price,
            reduce_only: intent.reduce_only,
            exchange_order_id: None,
            state: OrderState::Pending,
            filled_quantity: 0.0,
            avg_fill_price: 0.0,
            last_updated: Utc::now(),
        }
    }

    /// Quantity still able to fill
    pub fn remaining_quantity(&self) -> f64 {
        (self.quantity - self.filled_quantity).max(0.0)
    }

    /// State implied by the fill progress of a live order
    pub fn state_for_fill(&self, filled_quantity: f64) -> OrderState {
        if filled_quantity <= 0.0 {
            OrderState::Acknowledged
        } else if filled_quantity + f64::EPSILON >= self.quantity {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        }
    }
}

/// Order status as reported by the exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExchangeOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl ExchangeOrderStatus {
    pub fn is_live(self) -> bool {
        matches!(self, ExchangeOrderStatus::New | ExchangeOrderStatus::PartiallyFilled)
    }
}

/// An order as the exchange reports it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeOrder {
    pub symbol: String,
    pub exchange_order_id: String,
    pub client_request_id: Option<ClientRequestId>,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: f64,
    pub price: f64,
    pub filled_quantity: f64,
    pub avg_fill_price: f64,
    pub status: ExchangeOrderStatus,
}

/// Outcome of a mutating request, parsed at the gateway boundary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AckState {
    /// Received but not yet confirmed
    Pending,
    Accepted,
    Rejected(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderAck {
    pub exchange_order_id: Option<String>,
    pub ack: AckState,
    pub status: Option<ExchangeOrderStatus>,
    pub filled_quantity: f64,
    pub avg_fill_price: f64,
}

/// Exchange-reconciled position for a symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    /// Signed: positive long, negative short
    pub net_quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub margin_used: f64,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.net_quantity.abs() < f64::EPSILON
    }

    /// Side of the open exposure, `None` when flat
    pub fn side(&self) -> Option<Side> {
        if self.is_flat() {
            None
        } else if self.net_quantity > 0.0 {
            Some(Side::Buy)
        } else {
            Some(Side::Sell)
        }
    }

    pub fn pnl_at(&self, mark_price: f64) -> f64 {
        (mark_price - self.entry_price) * self.net_quantity
    }
}

/// OHLCV bar. `timestamp` is the bar open time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceBar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Indicator values after the last accepted bar. `None` = insufficient history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IndicatorSnapshot {
    pub sma20: Option<f64>,
    pub sma50: Option<f64>,
    pub rsi14: Option<f64>,
    pub as_of_bar_timestamp: Option<DateTime<Utc>>,
}

/// Caller-supplied risk limits for one symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskRule {
    pub symbol: String,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub max_position_size: f64,
}

impl RiskRule {
    pub fn new(symbol: &str, max_position_size: f64) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            stop_loss_price: None,
            take_profit_price: None,
            max_position_size,
        }
    }

    pub fn with_stop_loss(mut self, price: f64) -> Self {
        self.stop_loss_price = Some(price);
        self
    }

    pub fn with_take_profit(mut self, price: f64) -> Self {
        self.take_profit_price = Some(price);
        self
    }
}

/// Wallet balance for one margin asset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetBalance {
    pub asset: String,
    pub balance: f64,
    pub available_balance: f64,
    pub unrealized_pnl: f64,
}
