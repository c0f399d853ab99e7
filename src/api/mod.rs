// Exchange boundary: the capability set the engine consumes
pub mod binance;
pub mod paper;

pub use binance::BinanceFuturesClient;
pub use paper::{PaperExchange, ScriptedFailure};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    AssetBalance, ClientRequestId, ExchangeOrder, OrderAck, OrderIntent, Position, PriceBar,
};

/// Adapter-level failure, classified so callers never have to guess
/// whether a retry is safe.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    /// Network error, timeout or server-side hiccup. `maybe_delivered` is
    /// false only when the request provably never left this process.
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        maybe_delivered: bool,
    },

    /// The exchange refused the request (bad parameters, margin, rate limit)
    #[error("exchange rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },

    /// Timestamp outside the exchange receive window; nothing was executed
    #[error("request timestamp outside the exchange receive window")]
    TimestampOutOfSync,

    #[error("malformed exchange response: {0}")]
    Malformed(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient { .. })
    }

    pub fn transient(message: impl Into<String>) -> Self {
        ExchangeError::Transient {
            message: message.into(),
            maybe_delivered: true,
        }
    }

    pub fn undelivered(message: impl Into<String>) -> Self {
        ExchangeError::Transient {
            message: message.into(),
            maybe_delivered: false,
        }
    }
}

/// Remote exchange API
///
/// Signed calls receive the request timestamp (exchange time, ms) from the
/// gateway; adapters never consult a clock themselves.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a resent request with the same client id is guaranteed to be
    /// recognized as a duplicate
    fn honors_idempotency_keys(&self) -> bool;

    /// Exchange time in epoch milliseconds
    async fn server_time(&self) -> Result<i64, ExchangeError>;

    async fn place_order(
        &self,
        intent: &OrderIntent,
        timestamp_ms: i64,
    ) -> Result<OrderAck, ExchangeError>;

    async fn cancel_order(
        &self,
        symbol: &str,
        exchange_order_id: &str,
        idempotency_key: &ClientRequestId,
        timestamp_ms: i64,
    ) -> Result<OrderAck, ExchangeError>;

    /// Look up an order by client id; `None` if the exchange never saw it
    async fn get_order(
        &self,
        symbol: &str,
        client_request_id: &ClientRequestId,
        timestamp_ms: i64,
    ) -> Result<Option<ExchangeOrder>, ExchangeError>;

    async fn open_orders(
        &self,
        symbol: Option<&str>,
        timestamp_ms: i64,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    async fn positions(&self, timestamp_ms: i64) -> Result<Vec<Position>, ExchangeError>;

    async fn balances(&self, timestamp_ms: i64) -> Result<Vec<AssetBalance>, ExchangeError>;

    /// Closed bars only, oldest first
    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u16,
    ) -> Result<Vec<PriceBar>, ExchangeError>;

    async fn ticker_price(&self, symbol: &str) -> Result<f64, ExchangeError>;
}
