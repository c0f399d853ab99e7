use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::order_store::{OrderSlot, OrderStore};
use crate::gateway::{ExchangeGateway, GatewayError};
use crate::models::{
    ClientRequestId, ExchangeOrder, ExchangeOrderStatus, OrderState, Position, RejectReason,
};

/// Exchange-reconciled positions, keyed by symbol
///
/// Only [`PositionTracker`] writes entries; mark price updates touch the
/// mark and PnL, never the quantity or entry.
#[derive(Default)]
pub struct PositionTable {
    positions: RwLock<HashMap<String, Position>>,
}

impl PositionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, symbol: &str) -> Option<Position> {
        self.positions.read().await.get(symbol).cloned()
    }

    /// Signed net quantity, zero when no position is known
    pub async fn net_quantity(&self, symbol: &str) -> f64 {
        self.get(symbol).await.map_or(0.0, |p| p.net_quantity)
    }

    pub async fn all(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.positions.read().await.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    /// Recompute unrealized PnL from the authoritative entry at a new mark
    pub async fn update_mark(&self, symbol: &str, mark_price: f64) {
        if let Some(position) = self.positions.write().await.get_mut(symbol) {
            position.mark_price = mark_price;
            position.unrealized_pnl = position.pnl_at(mark_price);
            position.updated_at = Utc::now();
        }
    }

    /// Swap in the exchange's view. Returns symbols that went flat.
    pub(crate) async fn replace_all(&self, reported: Vec<Position>) -> Vec<String> {
        let mut positions = self.positions.write().await;

        let mut next = HashMap::new();
        for mut position in reported.into_iter().filter(|p| !p.is_flat()) {
            position.unrealized_pnl = position.pnl_at(position.mark_price);
            next.insert(position.symbol.clone(), position);
        }

        let mut went_flat: Vec<String> = positions
            .keys()
            .filter(|symbol| !next.contains_key(*symbol))
            .cloned()
            .collect();
        went_flat.sort();

        *positions = next;
        went_flat
    }
}

/// One record's state moving because of what the exchange reported
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StateChange {
    pub client_request_id: ClientRequestId,
    pub symbol: String,
    pub from: OrderState,
    pub to: OrderState,
}

/// A live exchange order whose local record was cancelled before the ack
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PendingCancel {
    pub symbol: String,
    pub exchange_order_id: String,
    pub client_request_id: ClientRequestId,
}

/// What a reconciliation pass found and fixed
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Normal progress discovered by polling (fills, cancels)
    pub advanced: Vec<StateChange>,
    /// Local state that disagreed with the exchange and was overwritten
    pub mismatches: Vec<StateChange>,
    pub fills_observed: usize,
    pub flat_symbols: Vec<String>,
    /// Open on the exchange with no local record
    pub orphaned: Vec<ExchangeOrder>,
    pub to_cancel: Vec<PendingCancel>,
    pub skipped_in_flight: usize,
    /// Records that could not be checked this pass
    pub lookup_failures: usize,
}

/// Reconciles local OrderRecords and the position table against the exchange
pub struct PositionTracker {
    gateway: Arc<ExchangeGateway>,
    store: Arc<OrderStore>,
    positions: Arc<PositionTable>,
}

impl PositionTracker {
    pub fn new(
        gateway: Arc<ExchangeGateway>,
        store: Arc<OrderStore>,
        positions: Arc<PositionTable>,
    ) -> Self {
        Self {
            gateway,
            store,
            positions,
        }
    }

    pub fn positions(&self) -> &Arc<PositionTable> {
        &self.positions
    }

    pub async fn mark_price(&self, symbol: &str, price: f64) {
        self.positions.update_mark(symbol, price).await;
    }

    /// Pull open orders and positions, then bring every unsettled record in line
    pub async fn reconcile(&self) -> Result<ReconcileReport, GatewayError> {
        let open_orders = self.gateway.open_orders(None).await?;
        let mut report = ReconcileReport::default();

        let mut matched: HashSet<String> = HashSet::new();

        for slot in self.store.live_slots().await {
            let mut slot = slot.lock().await;
            if slot.in_flight {
                report.skipped_in_flight += 1;
                continue;
            }
            if slot.record.state.is_terminal() && !slot.unverified {
                continue;
            }

            let open = open_orders.iter().find(|o| {
                o.client_request_id.as_ref() == Some(&slot.record.client_request_id)
                    || slot.record.exchange_order_id.as_deref() == Some(o.exchange_order_id.as_str())
            });

            let exchange_view = match open {
                Some(order) => Some(order.clone()),
                None => {
                    match self
                        .gateway
                        .get_order(&slot.record.symbol, &slot.record.client_request_id)
                        .await
                    {
                        Ok(order) => order,
                        Err(e) => {
                            tracing::warn!(
                                symbol = %slot.record.symbol,
                                client_request_id = %slot.record.client_request_id,
                                error = %e,
                                "Order lookup failed, leaving record for the next pass"
                            );
                            report.lookup_failures += 1;
                            continue;
                        }
                    }
                }
            };

            match exchange_view {
                Some(order) => {
                    matched.insert(order.exchange_order_id.clone());
                    apply_exchange_view(&mut slot, &order, &mut report);
                }
                None => apply_missing(&mut slot, &mut report),
            }
        }

        for order in &open_orders {
            if matched.contains(&order.exchange_order_id) {
                continue;
            }
            let known = match &order.client_request_id {
                Some(id) => self.store.get(id).await.is_some(),
                None => false,
            };
            if !known {
                tracing::warn!(
                    symbol = %order.symbol,
                    exchange_order_id = %order.exchange_order_id,
                    "Open exchange order has no local record"
                );
                report.orphaned.push(order.clone());
            }
        }

        // Every fill noted so far executed before this snapshot was requested
        let synced_at = Instant::now();
        let reported = self.gateway.positions().await?;
        report.flat_symbols = self.positions.replace_all(reported).await;
        self.store.settle_fills(synced_at).await;

        tracing::info!(
            advanced = report.advanced.len(),
            mismatches = report.mismatches.len(),
            fills = report.fills_observed,
            orphaned = report.orphaned.len(),
            "Reconciliation pass complete"
        );

        Ok(report)
    }
}

fn exchange_state(order: &ExchangeOrder, slot: &OrderSlot) -> OrderState {
    match order.status {
        ExchangeOrderStatus::New | ExchangeOrderStatus::PartiallyFilled => {
            slot.record.state_for_fill(order.filled_quantity)
        }
        ExchangeOrderStatus::Filled => OrderState::Filled,
        ExchangeOrderStatus::Canceled | ExchangeOrderStatus::Expired => OrderState::Cancelled,
        ExchangeOrderStatus::Rejected => OrderState::Rejected(RejectReason::Exchange {
            code: 0,
            message: "rejected by exchange".to_string(),
        }),
    }
}

fn apply_exchange_view(slot: &mut OrderSlot, order: &ExchangeOrder, report: &mut ReconcileReport) {
    let was_cancelled_before_ack =
        slot.record.state == OrderState::Rejected(RejectReason::CancelledBeforeAck);
    let from = slot.record.state.clone();

    slot.set_exchange_order_id(&order.exchange_order_id);
    if slot.record_fill(order.filled_quantity, order.avg_fill_price) {
        report.fills_observed += 1;
    }

    let target = exchange_state(order, slot);
    let change = StateChange {
        client_request_id: slot.record.client_request_id.clone(),
        symbol: slot.record.symbol.clone(),
        from: from.clone(),
        to: target.clone(),
    };

    if from == target {
        // Nothing moved, but an ambiguous record is now confirmed
    } else if !from.is_terminal() && slot.follow_exchange(target.clone()) {
        report.advanced.push(change);
    } else {
        tracing::warn!(
            symbol = %change.symbol,
            client_request_id = %change.client_request_id,
            local = %change.from,
            exchange = %change.to,
            "Reconciliation mismatch, adopting exchange state"
        );
        slot.correct_to(target);
        report.mismatches.push(change);
    }
    slot.unverified = false;

    if was_cancelled_before_ack && order.status.is_live() {
        report.to_cancel.push(PendingCancel {
            symbol: slot.record.symbol.clone(),
            exchange_order_id: order.exchange_order_id.clone(),
            client_request_id: slot.record.client_request_id.clone(),
        });
    }
}

fn apply_missing(slot: &mut OrderSlot, report: &mut ReconcileReport) {
    if slot.record.state.is_terminal() {
        // The ambiguous request never reached the exchange
        tracing::info!(
            symbol = %slot.record.symbol,
            client_request_id = %slot.record.client_request_id,
            state = %slot.record.state,
            "Exchange has no trace of order, local state confirmed"
        );
        slot.unverified = false;
        return;
    }

    if slot.record.filled_quantity > 0.0 {
        tracing::warn!(
            symbol = %slot.record.symbol,
            client_request_id = %slot.record.client_request_id,
            "Partially filled order unknown to the exchange, leaving as is"
        );
        return;
    }

    let to = OrderState::Rejected(RejectReason::ReconciliationMismatch);
    let change = StateChange {
        client_request_id: slot.record.client_request_id.clone(),
        symbol: slot.record.symbol.clone(),
        from: slot.record.state.clone(),
        to: to.clone(),
    };
    tracing::warn!(
        symbol = %change.symbol,
        client_request_id = %change.client_request_id,
        local = %change.from,
        "Reconciliation mismatch, order not found on exchange"
    );
    slot.correct_to(to);
    report.mismatches.push(change);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Exchange, PaperExchange};
    use crate::clock::ClockSync;
    use crate::config::ClockSettings;
    use crate::execution::order_store::Registration;
    use crate::gateway::RetryPolicy;
    use crate::models::{OrderIntent, Side};
    use std::time::Duration;

    struct Fixture {
        exchange: Arc<PaperExchange>,
        store: Arc<OrderStore>,
        tracker: PositionTracker,
    }

    async fn fixture() -> Fixture {
        let exchange = Arc::new(PaperExchange::new());
        let clock = Arc::new(ClockSync::new(ClockSettings::default()));
        let gateway = Arc::new(ExchangeGateway::new(
            exchange.clone(),
            clock,
            RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 2),
            Duration::from_secs(1),
        ));
        gateway.resync_clock().await.unwrap();

        let store = Arc::new(OrderStore::new());
        let tracker = PositionTracker::new(gateway, store.clone(), Arc::new(PositionTable::new()));
        Fixture {
            exchange,
            store,
            tracker,
        }
    }

    async fn place_directly(exchange: &PaperExchange, intent: &OrderIntent) -> String {
        let ack = exchange.place_order(intent, 0).await.unwrap();
        ack.exchange_order_id.unwrap()
    }

    async fn local_record(store: &OrderStore, intent: &OrderIntent, state: OrderState) {
        let Registration::Created(slot) = store.register(intent).await else {
            panic!("id already registered");
        };
        let mut slot = slot.lock().await;
        slot.in_flight = false;
        slot.advance_to(state);
    }

    #[tokio::test]
    async fn test_positions_come_from_exchange() {
        let f = fixture().await;
        f.exchange.set_mark("BTCUSDT", 110.0).await;
        f.exchange.set_position("BTCUSDT", 2.0, 100.0).await;

        let report = f.tracker.reconcile().await.unwrap();
        assert!(report.flat_symbols.is_empty());

        let position = f.tracker.positions().get("BTCUSDT").await.unwrap();
        assert_eq!(position.net_quantity, 2.0);
        assert_eq!(position.unrealized_pnl, 20.0);

        f.tracker.mark_price("BTCUSDT", 95.0).await;
        let position = f.tracker.positions().get("BTCUSDT").await.unwrap();
        assert_eq!(position.unrealized_pnl, -10.0);
        assert_eq!(position.entry_price, 100.0);

        f.exchange.set_position("BTCUSDT", 0.0, 0.0).await;
        let report = f.tracker.reconcile().await.unwrap();
        assert_eq!(report.flat_symbols, vec!["BTCUSDT".to_string()]);
        assert!(f.tracker.positions().get("BTCUSDT").await.is_none());
    }

    #[tokio::test]
    async fn test_missing_acknowledged_order_is_rejected() {
        let f = fixture().await;
        let intent = OrderIntent::limit("BTCUSDT", Side::Buy, 1.0, 90.0);
        local_record(&f.store, &intent, OrderState::Acknowledged).await;

        let report = f.tracker.reconcile().await.unwrap();

        assert_eq!(report.mismatches.len(), 1);
        let record = f.store.get(&intent.client_request_id).await.unwrap();
        assert_eq!(
            record.state,
            OrderState::Rejected(RejectReason::ReconciliationMismatch)
        );
    }

    #[tokio::test]
    async fn test_fills_found_on_exchange_advance_record() {
        let f = fixture().await;
        let intent = OrderIntent::limit("ETHUSDT", Side::Sell, 4.0, 2000.0);
        let ack = place_directly(&f.exchange, &intent).await;
        local_record(&f.store, &intent, OrderState::Acknowledged).await;

        f.exchange.fill_order(&ack, 1.0, 2000.0).await.unwrap();
        let report = f.tracker.reconcile().await.unwrap();
        assert_eq!(report.fills_observed, 1);
        assert_eq!(report.advanced.len(), 1);
        assert!(report.mismatches.is_empty());

        let record = f.store.get(&intent.client_request_id).await.unwrap();
        assert_eq!(record.state, OrderState::PartiallyFilled);
        assert_eq!(record.filled_quantity, 1.0);
        assert_eq!(record.exchange_order_id.as_deref(), Some(ack.as_str()));

        // Fully filled orders drop off the open list and are found by lookup
        f.exchange.fill_order(&ack, 3.0, 2010.0).await.unwrap();
        f.tracker.reconcile().await.unwrap();
        let record = f.store.get(&intent.client_request_id).await.unwrap();
        assert_eq!(record.state, OrderState::Filled);
        assert_eq!(record.filled_quantity, 4.0);
    }

    #[tokio::test]
    async fn test_in_flight_records_are_skipped() {
        let f = fixture().await;
        let intent = OrderIntent::limit("BTCUSDT", Side::Buy, 1.0, 90.0);
        let Registration::Created(_slot) = f.store.register(&intent).await else {
            panic!("id already registered");
        };

        let report = f.tracker.reconcile().await.unwrap();

        assert_eq!(report.skipped_in_flight, 1);
        let record = f.store.get(&intent.client_request_id).await.unwrap();
        assert_eq!(record.state, OrderState::Pending);
    }

    #[tokio::test]
    async fn test_unknown_open_orders_are_reported() {
        let f = fixture().await;
        let intent = OrderIntent::limit("BTCUSDT", Side::Buy, 1.0, 90.0);
        place_directly(&f.exchange, &intent).await;

        let report = f.tracker.reconcile().await.unwrap();

        assert_eq!(report.orphaned.len(), 1);
        assert_eq!(
            report.orphaned[0].client_request_id,
            Some(intent.client_request_id)
        );
    }
}
