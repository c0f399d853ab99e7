use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;

use crate::models::{ClientRequestId, OrderIntent, OrderRecord, OrderState, Side};

/// One order's record plus the coordination flags around it
///
/// Holding the slot's mutex is the right to rewrite its record.
#[derive(Debug)]
pub struct OrderSlot {
    pub(crate) record: OrderRecord,
    /// A request for this record is on the wire; reconciliation leaves it alone
    pub(crate) in_flight: bool,
    /// The exchange may know more than we do (ambiguous failure, pre-ack cancel)
    pub(crate) unverified: bool,
    pub(crate) abort: Arc<Notify>,
    /// Fills seen locally that the position table may not reflect yet
    unsynced_fills: Vec<(Instant, f64)>,
}

impl OrderSlot {
    fn new(record: OrderRecord) -> Self {
        Self {
            record,
            in_flight: false,
            unverified: false,
            abort: Arc::new(Notify::new()),
            unsynced_fills: Vec::new(),
        }
    }

    pub fn record(&self) -> &OrderRecord {
        &self.record
    }

    /// Lifecycle-checked transition
    ///
    /// Returns false and leaves the record untouched when the lifecycle
    /// forbids the move.
    pub fn advance_to(&mut self, next: OrderState) -> bool {
        let current = &self.record.state;
        if *current == next && next != OrderState::PartiallyFilled {
            return true;
        }

        if !current.can_transition_to(&next) {
            tracing::debug!(
                client_request_id = %self.record.client_request_id,
                from = %current,
                to = %next,
                "Ignoring transition not allowed by the order lifecycle"
            );
            return false;
        }

        tracing::info!(
            symbol = %self.record.symbol,
            client_request_id = %self.record.client_request_id,
            from = %current,
            to = %next,
            "Order state changed"
        );
        self.record.state = next;
        self.record.last_updated = Utc::now();
        true
    }

    /// Advance to a state the exchange reported
    ///
    /// An order the exchange already cancelled was accepted first, so a
    /// `Pending` record records the `Acknowledged` step before `Cancelled`.
    pub fn follow_exchange(&mut self, next: OrderState) -> bool {
        if self.record.state == OrderState::Pending && next == OrderState::Cancelled {
            self.advance_to(OrderState::Acknowledged);
        }
        self.advance_to(next)
    }

    /// Overwrite the state with what the exchange reports
    ///
    /// Only reconciliation calls this; it is the one path allowed to leave a
    /// terminal state or skip the lifecycle.
    pub fn correct_to(&mut self, next: OrderState) {
        self.record.state = next;
        self.record.last_updated = Utc::now();
    }

    /// Fill progress only ever grows
    ///
    /// The new quantity also counts as unsynced exposure until a position
    /// refresh taken after this call settles it.
    pub fn record_fill(&mut self, filled_quantity: f64, avg_fill_price: f64) -> bool {
        if filled_quantity <= self.record.filled_quantity {
            return false;
        }
        let filled_quantity = filled_quantity.min(self.record.quantity);
        let delta = filled_quantity - self.record.filled_quantity;
        self.record.filled_quantity = filled_quantity;
        if avg_fill_price > 0.0 {
            self.record.avg_fill_price = avg_fill_price;
        }
        self.record.last_updated = Utc::now();
        if delta > 0.0 {
            self.unsynced_fills.push((Instant::now(), delta));
        }
        true
    }

    /// Signed quantity filled since the last position refresh
    pub fn unsynced_fill(&self) -> f64 {
        let quantity: f64 = self.unsynced_fills.iter().map(|(_, q)| q).sum();
        self.record.side.sign() * quantity
    }

    pub fn set_exchange_order_id(&mut self, exchange_order_id: &str) {
        if self.record.exchange_order_id.is_none() {
            self.record.exchange_order_id = Some(exchange_order_id.to_string());
        }
    }
}

/// Outcome of registering an intent
pub enum Registration {
    Created(Arc<Mutex<OrderSlot>>),
    Existing(OrderRecord),
}

/// The OrderRecord table: one slot per client request id
///
/// Terminal records move to the archive after a while; lookups search both.
#[derive(Default)]
pub struct OrderStore {
    live: RwLock<HashMap<ClientRequestId, Arc<Mutex<OrderSlot>>>>,
    archive: RwLock<HashMap<ClientRequestId, OrderRecord>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a `Pending` record marked in flight, unless the id is taken
    pub async fn register(&self, intent: &OrderIntent) -> Registration {
        let mut live = self.live.write().await;
        if let Some(slot) = live.get(&intent.client_request_id).cloned() {
            drop(live);
            return Registration::Existing(slot.lock().await.record.clone());
        }
        // Checked under the live lock so a concurrent archive pass can't slip between
        if let Some(record) = self.archive.read().await.get(&intent.client_request_id) {
            return Registration::Existing(record.clone());
        }

        let mut slot = OrderSlot::new(OrderRecord::pending(intent));
        slot.in_flight = true;
        let slot = Arc::new(Mutex::new(slot));
        live.insert(intent.client_request_id.clone(), slot.clone());
        Registration::Created(slot)
    }

    pub async fn slot(&self, id: &ClientRequestId) -> Option<Arc<Mutex<OrderSlot>>> {
        self.live.read().await.get(id).cloned()
    }

    pub async fn get(&self, id: &ClientRequestId) -> Option<OrderRecord> {
        if let Some(slot) = self.slot(id).await {
            return Some(slot.lock().await.record.clone());
        }
        self.archive.read().await.get(id).cloned()
    }

    pub async fn live_slots(&self) -> Vec<Arc<Mutex<OrderSlot>>> {
        self.live.read().await.values().cloned().collect()
    }

    /// Every record, live and archived, oldest first
    pub async fn records(&self) -> Vec<OrderRecord> {
        let mut records = Vec::new();
        for slot in self.live_slots().await {
            records.push(slot.lock().await.record.clone());
        }
        records.extend(self.archive.read().await.values().cloned());
        records.sort_by_key(|r| r.last_updated);
        records
    }

    /// Unfilled quantity of non-terminal orders on one side of a symbol
    pub async fn open_quantity(&self, symbol: &str, side: Side) -> f64 {
        let mut total = 0.0;
        for slot in self.live_slots().await {
            let slot = slot.lock().await;
            let record = &slot.record;
            if record.symbol == symbol && record.side == side && !record.state.is_terminal() {
                total += record.remaining_quantity();
            }
        }
        total
    }

    /// Signed net quantity filled on a symbol that positions don't show yet
    pub async fn unsynced_fill(&self, symbol: &str) -> f64 {
        let mut total = 0.0;
        for slot in self.live_slots().await {
            let slot = slot.lock().await;
            if slot.record.symbol == symbol {
                total += slot.unsynced_fill();
            }
        }
        total
    }

    /// Drop unsynced fills noted before a position snapshot was requested
    pub async fn settle_fills(&self, synced_at: Instant) {
        for slot in self.live_slots().await {
            slot.lock()
                .await
                .unsynced_fills
                .retain(|(noted_at, _)| *noted_at >= synced_at);
        }
    }

    /// Whether an ambiguous outcome on this symbol is still unresolved
    pub async fn needs_reconciliation(&self, symbol: &str) -> bool {
        for slot in self.live_slots().await {
            let slot = slot.lock().await;
            if slot.unverified && slot.record.symbol == symbol {
                return true;
            }
        }
        false
    }

    /// Move settled terminal records older than `max_age` to the archive
    pub async fn archive_terminal(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut live = self.live.write().await;
        let mut archive = self.archive.write().await;

        let mut settled = Vec::new();
        for (id, slot) in live.iter() {
            // Busy slots wait for the next pass
            let Ok(slot) = slot.try_lock() else { continue };
            if slot.record.state.is_terminal()
                && !slot.in_flight
                && !slot.unverified
                && slot.unsynced_fills.is_empty()
                && slot.record.last_updated <= cutoff
            {
                settled.push((id.clone(), slot.record.clone()));
            }
        }

        for (id, record) in &settled {
            live.remove(id);
            archive.insert(id.clone(), record.clone());
        }

        if !settled.is_empty() {
            tracing::debug!(archived = settled.len(), "Archived terminal orders");
        }
        settled.len()
    }

    pub async fn live_len(&self) -> usize {
        self.live.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RejectReason;

    async fn created(store: &OrderStore, intent: &OrderIntent) -> Arc<Mutex<OrderSlot>> {
        match store.register(intent).await {
            Registration::Created(slot) => slot,
            Registration::Existing(_) => panic!("expected a new slot"),
        }
    }

    #[tokio::test]
    async fn test_register_is_keyed_by_client_request_id() {
        let store = OrderStore::new();
        let intent = OrderIntent::limit("BTCUSDT", Side::Buy, 1.0, 100.0);

        let slot = created(&store, &intent).await;
        assert!(slot.lock().await.in_flight);

        match store.register(&intent).await {
            Registration::Existing(record) => assert_eq!(record.state, OrderState::Pending),
            Registration::Created(_) => panic!("duplicate id created a second record"),
        }
        assert_eq!(store.live_len().await, 1);
    }

    #[tokio::test]
    async fn test_lifecycle_is_enforced() {
        let store = OrderStore::new();
        let intent = OrderIntent::limit("BTCUSDT", Side::Buy, 2.0, 100.0);
        let slot = created(&store, &intent).await;
        let mut slot = slot.lock().await;

        assert!(slot.advance_to(OrderState::Acknowledged));
        assert!(!slot.advance_to(OrderState::Pending));
        assert!(slot.record_fill(1.0, 100.0));
        assert!(slot.advance_to(OrderState::PartiallyFilled));
        assert!(!slot.record_fill(0.5, 99.0));
        assert!(slot.advance_to(OrderState::Filled));
        assert!(!slot.advance_to(OrderState::Cancelled));
        assert_eq!(slot.record.filled_quantity, 1.0);
    }

    #[tokio::test]
    async fn test_pending_cannot_jump_to_cancelled() {
        let store = OrderStore::new();
        let intent = OrderIntent::limit("BTCUSDT", Side::Buy, 2.0, 100.0);
        let slot = created(&store, &intent).await;
        let mut slot = slot.lock().await;

        assert!(!slot.advance_to(OrderState::Cancelled));
        assert_eq!(slot.record.state, OrderState::Pending);

        // An exchange-side cancel records the acknowledgment on the way
        assert!(slot.follow_exchange(OrderState::Cancelled));
        assert_eq!(slot.record.state, OrderState::Cancelled);
    }

    #[tokio::test]
    async fn test_unsynced_fills_settle_on_position_refresh() {
        let store = OrderStore::new();
        let buy = OrderIntent::market("BTCUSDT", Side::Buy, 8.0);
        let sell = OrderIntent::limit("BTCUSDT", Side::Sell, 5.0, 120.0);
        {
            let slot = created(&store, &buy).await;
            let mut slot = slot.lock().await;
            slot.in_flight = false;
            slot.advance_to(OrderState::Acknowledged);
            assert!(slot.record_fill(8.0, 100.0));
            slot.advance_to(OrderState::Filled);
        }
        {
            let slot = created(&store, &sell).await;
            let mut slot = slot.lock().await;
            slot.in_flight = false;
            slot.advance_to(OrderState::Acknowledged);
            slot.record_fill(2.0, 120.0);
            // Overfill reports are clamped to the order size
            slot.record_fill(9.0, 120.0);
        }

        assert_eq!(store.unsynced_fill("BTCUSDT").await, 3.0);
        assert_eq!(store.unsynced_fill("ETHUSDT").await, 0.0);
        // Filled but unsynced records stay live
        assert_eq!(store.archive_terminal(Duration::zero()).await, 0);

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let synced_at = Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let later = OrderIntent::market("BTCUSDT", Side::Buy, 1.0);
        {
            let slot = created(&store, &later).await;
            let mut slot = slot.lock().await;
            slot.advance_to(OrderState::Acknowledged);
            slot.record_fill(1.0, 100.0);
        }

        store.settle_fills(synced_at).await;
        assert_eq!(store.unsynced_fill("BTCUSDT").await, 1.0);
        assert_eq!(store.archive_terminal(Duration::zero()).await, 1);
    }

    #[tokio::test]
    async fn test_open_quantity_counts_live_same_side_orders() {
        let store = OrderStore::new();
        let buy = OrderIntent::limit("BTCUSDT", Side::Buy, 2.0, 100.0);
        let sell = OrderIntent::limit("BTCUSDT", Side::Sell, 5.0, 120.0);
        let other = OrderIntent::limit("ETHUSDT", Side::Buy, 7.0, 10.0);
        let done = OrderIntent::limit("BTCUSDT", Side::Buy, 3.0, 100.0);

        {
            let slot = created(&store, &buy).await;
            let mut slot = slot.lock().await;
            slot.advance_to(OrderState::Acknowledged);
            slot.record_fill(0.5, 100.0);
            slot.advance_to(OrderState::PartiallyFilled);
        }
        created(&store, &sell).await;
        created(&store, &other).await;
        {
            let slot = created(&store, &done).await;
            slot.lock()
                .await
                .advance_to(OrderState::Rejected(RejectReason::SubmissionFailed));
        }

        assert_eq!(store.open_quantity("BTCUSDT", Side::Buy).await, 1.5);
        assert_eq!(store.open_quantity("BTCUSDT", Side::Sell).await, 5.0);
    }

    #[tokio::test]
    async fn test_archive_keeps_records_visible() {
        let store = OrderStore::new();
        let intent = OrderIntent::market("BTCUSDT", Side::Buy, 1.0);
        {
            let slot = created(&store, &intent).await;
            let mut slot = slot.lock().await;
            slot.in_flight = false;
            slot.advance_to(OrderState::Filled);
        }

        // Not old enough yet
        assert_eq!(store.archive_terminal(Duration::hours(1)).await, 0);
        assert_eq!(store.archive_terminal(Duration::zero()).await, 1);
        assert_eq!(store.live_len().await, 0);

        let record = store.get(&intent.client_request_id).await.unwrap();
        assert_eq!(record.state, OrderState::Filled);
        assert!(matches!(store.register(&intent).await, Registration::Existing(_)));
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unverified_records_block_symbol_and_stay_live() {
        let store = OrderStore::new();
        let intent = OrderIntent::market("BTCUSDT", Side::Buy, 1.0);
        {
            let slot = created(&store, &intent).await;
            let mut slot = slot.lock().await;
            slot.in_flight = false;
            slot.unverified = true;
            slot.advance_to(OrderState::Rejected(RejectReason::SubmissionFailed));
        }

        assert!(store.needs_reconciliation("BTCUSDT").await);
        assert!(!store.needs_reconciliation("ETHUSDT").await);
        assert_eq!(store.archive_terminal(Duration::zero()).await, 0);
    }
}
