use std::sync::Arc;
use tokio::sync::Notify;

use super::order_store::{OrderSlot, OrderStore, Registration};
use super::position_tracker::{PositionTracker, ReconcileReport};
use super::symbol_locks::SymbolLocks;
use crate::error::EngineError;
use crate::gateway::{ExchangeGateway, GatewayError};
use crate::models::{
    AckState, ClientRequestId, ExchangeOrderStatus, OrderAck, OrderIntent, OrderKind, OrderRecord,
    OrderState, RejectReason,
};
use crate::risk::{RiskDecision, RiskManager};
use crate::Result;

/// Turns intents into exchange orders and tracks them to a terminal state
///
/// Submissions and risk decisions for one symbol are serialized through
/// [`SymbolLocks`]; different symbols run in parallel.
pub struct OrderExecutor {
    gateway: Arc<ExchangeGateway>,
    store: Arc<OrderStore>,
    risk: Arc<RiskManager>,
    tracker: Arc<PositionTracker>,
    locks: SymbolLocks,
    reconcile_signal: Arc<Notify>,
}

impl OrderExecutor {
    pub fn new(
        gateway: Arc<ExchangeGateway>,
        store: Arc<OrderStore>,
        risk: Arc<RiskManager>,
        tracker: Arc<PositionTracker>,
    ) -> Self {
        Self {
            gateway,
            store,
            risk,
            tracker,
            locks: SymbolLocks::new(),
            reconcile_signal: Arc::new(Notify::new()),
        }
    }

    /// Fires whenever a fill is observed so reconciliation can run early
    pub fn reconcile_signal(&self) -> Arc<Notify> {
        self.reconcile_signal.clone()
    }

    pub async fn order(&self, id: &ClientRequestId) -> Option<OrderRecord> {
        self.store.get(id).await
    }

    pub async fn orders(&self) -> Vec<OrderRecord> {
        self.store.records().await
    }

    /// Submit an intent; idempotent on its client request id
    ///
    /// A resubmission before the record is terminal returns the existing
    /// record without touching the exchange; after it is terminal the
    /// resubmission fails with `DuplicateIntent`.
    pub async fn submit(&self, intent: OrderIntent) -> Result<OrderRecord> {
        validate(&intent)?;
        let _symbol_guard = self.locks.lock(&intent.symbol).await;
        self.submit_locked(intent).await
    }

    async fn submit_locked(&self, intent: OrderIntent) -> Result<OrderRecord> {
        let symbol = intent.symbol.clone();
        let id = intent.client_request_id.clone();

        if let Some(existing) = self.store.get(&id).await {
            return existing_or_duplicate(existing);
        }

        if self.store.needs_reconciliation(&symbol).await {
            tracing::warn!(
                symbol = %symbol,
                client_request_id = %id,
                "Refusing submission until the symbol is reconciled"
            );
            return Err(EngineError::ReconciliationRequired {
                symbol,
                client_request_id: id,
            });
        }

        if self.gateway.clock().is_stale().await {
            tracing::warn!(symbol = %symbol, client_request_id = %id, "Clock stale, refusing submission");
            return Err(EngineError::Order {
                symbol,
                client_request_id: id,
                source: GatewayError::ClockUnsynced {
                    operation: "place_order",
                },
            });
        }

        if let RiskDecision::Reject(reason) = self.risk.check_pre_trade(&intent).await {
            return Err(EngineError::RiskRejected {
                symbol,
                client_request_id: id,
                reason,
            });
        }

        let slot = match self.store.register(&intent).await {
            Registration::Created(slot) => slot,
            Registration::Existing(existing) => return existing_or_duplicate(existing),
        };
        let abort = slot.lock().await.abort.clone();

        tracing::info!(
            symbol = %symbol,
            client_request_id = %id,
            side = %intent.side,
            kind = intent.kind.as_str(),
            quantity = intent.quantity,
            price = ?intent.limit_price,
            "Submitting order"
        );

        let outcome = tokio::select! {
            result = self.gateway.place_order(&intent) => Some(result),
            _ = abort.notified() => None,
        };

        let mut slot = slot.lock().await;
        slot.in_flight = false;

        let Some(result) = outcome else {
            tracing::info!(symbol = %symbol, client_request_id = %id, "Submission abandoned after cancel");
            return Ok(slot.record.clone());
        };

        if slot.record.state == OrderState::Rejected(RejectReason::CancelledBeforeAck) {
            // The response arrived after the cancel; reconciliation sorts out the rest
            if let Ok(OrderAck {
                exchange_order_id: Some(exchange_order_id),
                ..
            }) = &result
            {
                slot.set_exchange_order_id(exchange_order_id);
            }
            return Ok(slot.record.clone());
        }

        match result {
            Ok(ack) => {
                let filled = apply_ack(&mut slot, &ack);
                let record = slot.record.clone();
                drop(slot);
                if filled {
                    self.reconcile_signal.notify_one();
                }
                Ok(record)
            }
            Err(GatewayError::ExchangeRejected {
                operation,
                code,
                message,
            }) => {
                slot.advance_to(OrderState::Rejected(RejectReason::Exchange {
                    code,
                    message: message.clone(),
                }));
                Err(EngineError::Order {
                    symbol,
                    client_request_id: id,
                    source: GatewayError::ExchangeRejected {
                        operation,
                        code,
                        message,
                    },
                })
            }
            Err(source @ GatewayError::ClockUnsynced { .. }) => {
                slot.advance_to(OrderState::Rejected(RejectReason::ClockUnsynced));
                Err(EngineError::Order {
                    symbol,
                    client_request_id: id,
                    source,
                })
            }
            Err(source) => {
                slot.advance_to(OrderState::Rejected(RejectReason::SubmissionFailed));
                slot.unverified = true;
                tracing::warn!(
                    symbol = %symbol,
                    client_request_id = %id,
                    error = %source,
                    "Submission outcome unknown, symbol blocked until reconciled"
                );
                Err(EngineError::SubmissionFailed {
                    symbol,
                    client_request_id: id,
                    source,
                })
            }
        }
    }

    /// Cancel by client request id; a no-op on terminal records
    ///
    /// Before the exchange has acknowledged the order this only abandons the
    /// local wait. Afterwards it sends a cancel request.
    pub async fn cancel(&self, id: &ClientRequestId) -> Result<OrderRecord> {
        let Some(slot_ref) = self.store.slot(id).await else {
            // Archived records are terminal
            return self.store.get(id).await.ok_or_else(|| EngineError::UnknownOrder {
                client_request_id: id.clone(),
            });
        };

        let mut slot = slot_ref.lock().await;
        if slot.record.state.is_terminal() {
            return Ok(slot.record.clone());
        }

        if slot.record.state == OrderState::Pending && slot.record.exchange_order_id.is_none() {
            if slot.in_flight {
                slot.abort.notify_one();
            }
            slot.advance_to(OrderState::Rejected(RejectReason::CancelledBeforeAck));
            slot.unverified = true;
            tracing::info!(
                symbol = %slot.record.symbol,
                client_request_id = %id,
                "Cancelled before acknowledgment, symbol needs reconciliation"
            );
            return Ok(slot.record.clone());
        }

        if slot.in_flight {
            // A cancel is already on the wire
            return Ok(slot.record.clone());
        }

        let symbol = slot.record.symbol.clone();
        let Some(exchange_order_id) = slot.record.exchange_order_id.clone() else {
            return Err(EngineError::ReconciliationRequired {
                symbol,
                client_request_id: id.clone(),
            });
        };
        slot.in_flight = true;
        drop(slot);

        tracing::info!(
            symbol = %symbol,
            client_request_id = %id,
            exchange_order_id = %exchange_order_id,
            "Cancelling order"
        );
        let result = self
            .gateway
            .cancel_order(&symbol, &exchange_order_id, id)
            .await;

        let mut slot = slot_ref.lock().await;
        slot.in_flight = false;

        match result {
            Ok(ack) => {
                let filled = apply_ack(&mut slot, &ack);
                let record = slot.record.clone();
                drop(slot);
                if filled {
                    self.reconcile_signal.notify_one();
                }
                Ok(record)
            }
            Err(source) => {
                drop(slot);
                tracing::warn!(
                    symbol = %symbol,
                    client_request_id = %id,
                    error = %source,
                    "Cancel failed, requesting reconciliation"
                );
                self.reconcile_signal.notify_one();
                Err(EngineError::Order {
                    symbol,
                    client_request_id: id.clone(),
                    source,
                })
            }
        }
    }

    /// Feed a price tick: update the mark and act on any exit it triggers
    pub async fn on_price_tick(&self, symbol: &str, price: f64) -> Result<Option<OrderRecord>> {
        self.tracker.mark_price(symbol, price).await;

        let _symbol_guard = self.locks.lock(symbol).await;
        let Some(exit) = self.risk.evaluate(symbol, price).await else {
            return Ok(None);
        };

        let intent = exit.to_order_intent();
        tracing::info!(
            symbol,
            client_request_id = %intent.client_request_id,
            reason = %exit.reason,
            quantity = exit.quantity,
            "Submitting exit order"
        );

        match self.submit_locked(intent).await {
            Ok(record) => {
                if matches!(record.state, OrderState::Rejected(_)) {
                    self.risk.release_exit(symbol).await;
                }
                Ok(Some(record))
            }
            Err(e) => {
                self.risk.release_exit(symbol).await;
                Err(e)
            }
        }
    }

    /// Run one reconciliation pass and cancel orders abandoned before their ack
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let report = self.tracker.reconcile().await?;

        for pending in &report.to_cancel {
            tracing::info!(
                symbol = %pending.symbol,
                client_request_id = %pending.client_request_id,
                exchange_order_id = %pending.exchange_order_id,
                "Cancelling order that went live after a pre-ack cancel"
            );
            let result = self
                .gateway
                .cancel_order(
                    &pending.symbol,
                    &pending.exchange_order_id,
                    &pending.client_request_id,
                )
                .await;

            match result {
                Ok(ack) => {
                    if let Some(slot) = self.store.slot(&pending.client_request_id).await {
                        apply_ack(&mut *slot.lock().await, &ack);
                    }
                }
                Err(e) => tracing::warn!(
                    symbol = %pending.symbol,
                    client_request_id = %pending.client_request_id,
                    error = %e,
                    "Cancel of abandoned order failed, retrying next pass"
                ),
            }
        }

        Ok(report)
    }
}

fn validate(intent: &OrderIntent) -> Result<()> {
    let reason = if intent.symbol.trim().is_empty() {
        Some("symbol is empty")
    } else if !intent.quantity.is_finite() || intent.quantity <= 0.0 {
        Some("quantity must be positive")
    } else if intent.kind == OrderKind::Limit
        && !intent.limit_price.is_some_and(|p| p.is_finite() && p > 0.0)
    {
        Some("limit orders need a positive price")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(EngineError::InvalidIntent {
            symbol: intent.symbol.clone(),
            client_request_id: intent.client_request_id.clone(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

fn existing_or_duplicate(existing: OrderRecord) -> Result<OrderRecord> {
    if existing.state.is_terminal() {
        tracing::warn!(
            symbol = %existing.symbol,
            client_request_id = %existing.client_request_id,
            state = %existing.state,
            "Resubmission of a settled intent"
        );
        return Err(EngineError::DuplicateIntent {
            symbol: existing.symbol,
            client_request_id: existing.client_request_id,
        });
    }
    tracing::debug!(
        client_request_id = %existing.client_request_id,
        "Resubmission of a live intent, returning existing record"
    );
    Ok(existing)
}

/// Fold a typed acknowledgment into the record. Returns true on new fills.
fn apply_ack(slot: &mut OrderSlot, ack: &OrderAck) -> bool {
    if let Some(exchange_order_id) = &ack.exchange_order_id {
        slot.set_exchange_order_id(exchange_order_id);
    }

    match &ack.ack {
        AckState::Rejected(message) => {
            slot.advance_to(OrderState::Rejected(RejectReason::Exchange {
                code: 0,
                message: message.clone(),
            }));
            false
        }
        // Received but unconfirmed; reconciliation moves it on
        AckState::Pending => false,
        AckState::Accepted => {
            let filled = slot.record_fill(ack.filled_quantity, ack.avg_fill_price);
            let next = match ack.status {
                Some(ExchangeOrderStatus::Filled) => OrderState::Filled,
                Some(ExchangeOrderStatus::Canceled | ExchangeOrderStatus::Expired) => {
                    OrderState::Cancelled
                }
                Some(ExchangeOrderStatus::Rejected) => {
                    OrderState::Rejected(RejectReason::Exchange {
                        code: 0,
                        message: "rejected by exchange".to_string(),
                    })
                }
                Some(ExchangeOrderStatus::New | ExchangeOrderStatus::PartiallyFilled) | None => {
                    slot.record.state_for_fill(slot.record.filled_quantity)
                }
            };
            slot.follow_exchange(next);
            filled
        }
    }
}
