use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::RetryPolicy;
use crate::api::{Exchange, ExchangeError};
use crate::clock::{ClockError, ClockOffset, ClockSync};
use crate::models::{
    AssetBalance, ClientRequestId, ExchangeOrder, OrderAck, OrderIntent, Position, PriceBar,
};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// Retries exhausted on network/timeout failures
    #[error("{operation} failed after {attempts} attempt(s): {message}")]
    NetworkTransient {
        operation: &'static str,
        attempts: u32,
        message: String,
    },

    /// Refused by the exchange; never retried
    #[error("{operation} rejected by exchange ({code}): {message}")]
    ExchangeRejected {
        operation: &'static str,
        code: i64,
        message: String,
    },

    #[error("clock unsynced, refusing {operation}")]
    ClockUnsynced { operation: &'static str },

    /// A mutating request failed in a way that may have executed it, and the
    /// exchange cannot be trusted to dedupe a resend
    #[error("{operation} outcome unknown: {message}")]
    AmbiguousMutation {
        operation: &'static str,
        message: String,
    },

    #[error("malformed response to {operation}: {message}")]
    Malformed {
        operation: &'static str,
        message: String,
    },
}

impl GatewayError {
    /// Whether a failed mutation may nonetheless have reached the exchange
    pub fn outcome_unknown(&self) -> bool {
        matches!(
            self,
            GatewayError::NetworkTransient { .. } | GatewayError::AmbiguousMutation { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Read,
    /// Time-sensitive and state-changing
    Mutation,
}

/// Every exchange call goes through here: stamped with the synchronized
/// clock, bounded by a timeout, retried on transient failures only.
pub struct ExchangeGateway {
    exchange: Arc<dyn Exchange>,
    clock: Arc<ClockSync>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl ExchangeGateway {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        clock: Arc<ClockSync>,
        policy: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            exchange,
            clock,
            policy,
            call_timeout,
        }
    }

    pub fn clock(&self) -> &Arc<ClockSync> {
        &self.clock
    }

    pub fn exchange_name(&self) -> &str {
        self.exchange.name()
    }

    pub async fn resync_clock(&self) -> Result<ClockOffset, ClockError> {
        self.clock.resync(self.exchange.as_ref(), self.call_timeout).await
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        kind: CallKind,
        request: F,
    ) -> Result<T, GatewayError>
    where
        F: Fn(i64) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if kind == CallKind::Mutation && self.clock.is_stale().await {
                tracing::warn!(operation, "Clock is stale, refusing time-sensitive request");
                return Err(GatewayError::ClockUnsynced { operation });
            }

            let timestamp_ms = self.clock.request_timestamp_ms().await;
            let outcome = match tokio::time::timeout(self.call_timeout, request(timestamp_ms)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ExchangeError::transient(format!(
                    "no response within {:?}",
                    self.call_timeout
                ))),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(operation, attempt, "Request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(ExchangeError::Rejected { code, message }) => {
                    return Err(GatewayError::ExchangeRejected {
                        operation,
                        code,
                        message,
                    });
                }
                Err(ExchangeError::Malformed(message)) => {
                    // The request went through; only its answer is unreadable
                    return Err(if kind == CallKind::Mutation {
                        GatewayError::AmbiguousMutation { operation, message }
                    } else {
                        GatewayError::Malformed { operation, message }
                    });
                }
                Err(ExchangeError::TimestampOutOfSync) => {
                    tracing::warn!(operation, attempt, "Timestamp rejected, resyncing clock");
                    last_error = "timestamp outside receive window".to_string();
                    if let Err(e) = self.resync_clock().await {
                        tracing::warn!(operation, error = %e, "Resync after timestamp error failed");
                    }
                }
                Err(ExchangeError::Transient {
                    message,
                    maybe_delivered,
                }) => {
                    if kind == CallKind::Mutation
                        && maybe_delivered
                        && !self.exchange.honors_idempotency_keys()
                    {
                        tracing::warn!(
                            operation,
                            error = %message,
                            "Mutation may have executed and the exchange cannot dedupe; not retrying"
                        );
                        return Err(GatewayError::AmbiguousMutation { operation, message });
                    }
                    last_error = message;
                }
            }

            if attempt < max_attempts {
                let delay = self.policy.delay_for(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Transient exchange failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }

        tracing::error!(operation, attempts = max_attempts, error = %last_error, "Retries exhausted");
        Err(GatewayError::NetworkTransient {
            operation,
            attempts: max_attempts,
            message: last_error,
        })
    }

    pub async fn place_order(&self, intent: &OrderIntent) -> Result<OrderAck, GatewayError> {
        let exchange = self.exchange.as_ref();
        self.call("place_order", CallKind::Mutation, |ts| {
            exchange.place_order(intent, ts)
        })
        .await
    }

    pub async fn cancel_order(
        &self,
        symbol: &str,
        exchange_order_id: &str,
        idempotency_key: &ClientRequestId,
    ) -> Result<OrderAck, GatewayError> {
        let exchange = self.exchange.as_ref();
        self.call("cancel_order", CallKind::Mutation, |ts| {
            exchange.cancel_order(symbol, exchange_order_id, idempotency_key, ts)
        })
        .await
    }

    pub async fn get_order(
        &self,
        symbol: &str,
        client_request_id: &ClientRequestId,
    ) -> Result<Option<ExchangeOrder>, GatewayError> {
        let exchange = self.exchange.as_ref();
        self.call("get_order", CallKind::Read, |ts| {
            exchange.get_order(symbol, client_request_id, ts)
        })
        .await
    }

    pub async fn open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrder>, GatewayError> {
        let exchange = self.exchange.as_ref();
        self.call("open_orders", CallKind::Read, |ts| exchange.open_orders(symbol, ts))
            .await
    }

    pub async fn positions(&self) -> Result<Vec<Position>, GatewayError> {
        let exchange = self.exchange.as_ref();
        self.call("positions", CallKind::Read, |ts| exchange.positions(ts))
            .await
    }

    pub async fn balances(&self) -> Result<Vec<AssetBalance>, GatewayError> {
        let exchange = self.exchange.as_ref();
        self.call("balances", CallKind::Read, |ts| exchange.balances(ts))
            .await
    }

    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u16,
    ) -> Result<Vec<PriceBar>, GatewayError> {
        let exchange = self.exchange.as_ref();
        self.call("klines", CallKind::Read, |_| exchange.klines(symbol, interval, limit))
            .await
    }

    pub async fn ticker_price(&self, symbol: &str) -> Result<f64, GatewayError> {
        let exchange = self.exchange.as_ref();
        self.call("ticker_price", CallKind::Read, |_| exchange.ticker_price(symbol))
            .await
    }
}
