use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use crate::api::Exchange;
use crate::clock::{ClockOffset, ClockStatus, ClockSync};
use crate::config::Settings;
use crate::execution::{OrderExecutor, OrderStore, PositionTable, PositionTracker, ReconcileReport};
use crate::gateway::{ExchangeGateway, RetryPolicy};
use crate::indicators::IndicatorEngine;
use crate::models::{
    AssetBalance, ClientRequestId, IndicatorSnapshot, OrderIntent, OrderRecord, Position,
    PriceBar, RiskRule,
};
use crate::risk::RiskManager;
use crate::Result;

/// Everything the dashboard/CLI talks to, plus the background activities
///
/// Queries return snapshots; commands go through the executor. The engine
/// never reads the environment; it gets a finished [`Settings`].
pub struct TradingEngine {
    settings: Settings,
    gateway: Arc<ExchangeGateway>,
    store: Arc<OrderStore>,
    positions: Arc<PositionTable>,
    risk: Arc<RiskManager>,
    executor: Arc<OrderExecutor>,
    indicators: RwLock<HashMap<String, IndicatorEngine>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TradingEngine {
    pub fn new(exchange: Arc<dyn Exchange>, settings: Settings) -> Self {
        let clock = Arc::new(ClockSync::new(settings.clock.clone()));
        let gateway = Arc::new(ExchangeGateway::new(
            exchange,
            clock,
            RetryPolicy::from(&settings.retry),
            settings.exchange.request_timeout(),
        ));

        let store = Arc::new(OrderStore::new());
        let positions = Arc::new(PositionTable::new());
        let risk = Arc::new(RiskManager::new(
            settings.risk.clone(),
            positions.clone(),
            store.clone(),
        ));
        let tracker = Arc::new(PositionTracker::new(
            gateway.clone(),
            store.clone(),
            positions.clone(),
        ));
        let executor = Arc::new(OrderExecutor::new(
            gateway.clone(),
            store.clone(),
            risk.clone(),
            tracker,
        ));

        let (shutdown_tx, _) = broadcast::channel(4);

        Self {
            settings,
            gateway,
            store,
            positions,
            risk,
            executor,
            indicators: RwLock::new(HashMap::new()),
            shutdown_tx,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn gateway(&self) -> &Arc<ExchangeGateway> {
        &self.gateway
    }

    // Queries

    pub async fn list_orders(&self) -> Vec<OrderRecord> {
        self.executor.orders().await
    }

    pub async fn order(&self, id: &ClientRequestId) -> Option<OrderRecord> {
        self.executor.order(id).await
    }

    pub async fn list_positions(&self) -> Vec<Position> {
        self.positions.all().await
    }

    pub async fn indicator_snapshot(&self, symbol: &str) -> Option<IndicatorSnapshot> {
        self.indicators
            .read()
            .await
            .get(&symbol.to_uppercase())
            .map(IndicatorEngine::snapshot)
    }

    pub async fn risk_rule(&self, symbol: &str) -> RiskRule {
        self.risk.rule(&symbol.to_uppercase()).await
    }

    pub async fn clock_status(&self) -> ClockStatus {
        self.gateway.clock().status().await
    }

    pub async fn balances(&self) -> Result<Vec<AssetBalance>> {
        Ok(self.gateway.balances().await?)
    }

    // Commands

    pub async fn submit_intent(&self, intent: OrderIntent) -> Result<OrderRecord> {
        self.executor.submit(intent).await
    }

    pub async fn cancel_intent(&self, id: &ClientRequestId) -> Result<OrderRecord> {
        self.executor.cancel(id).await
    }

    pub async fn set_risk_rule(&self, rule: RiskRule) {
        self.risk.set_rule(rule).await;
    }

    // Activities

    pub async fn sync_clock(&self) -> Result<ClockOffset> {
        Ok(self.gateway.resync_clock().await?)
    }

    /// One reconciliation pass, then archive settled records
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let report = self.executor.reconcile().await?;

        let max_age = chrono::Duration::seconds(self.settings.reconcile.archive_after_secs as i64);
        self.store.archive_terminal(max_age).await;

        Ok(report)
    }

    /// Feed one closed bar to the symbol's indicators
    pub async fn on_bar(&self, symbol: &str, bar: &PriceBar) -> Result<IndicatorSnapshot> {
        let mut indicators = self.indicators.write().await;
        let engine = indicators.entry(symbol.to_uppercase()).or_default();
        Ok(engine.on_bar(bar)?)
    }

    /// Fetch new bars and the latest price for a symbol, then act on the tick
    pub async fn poll_market_data(&self, symbol: &str) -> Result<Option<OrderRecord>> {
        let symbol = symbol.to_uppercase();
        let symbol = symbol.as_str();
        let market = &self.settings.market_data;
        let bars = self
            .gateway
            .klines(symbol, &market.interval, market.limit)
            .await?;

        let snapshot = {
            let mut indicators = self.indicators.write().await;
            let engine = indicators.entry(symbol.to_string()).or_default();
            let applied = engine.catch_up(&bars);
            tracing::debug!(symbol, applied, bars_seen = engine.bars_seen(), "Indicators updated");
            engine.snapshot()
        };
        tracing::debug!(
            symbol,
            sma20 = ?snapshot.sma20,
            sma50 = ?snapshot.sma50,
            rsi14 = ?snapshot.rsi14,
            "Indicator snapshot"
        );

        let price = self.gateway.ticker_price(symbol).await?;
        self.executor.on_price_tick(symbol, price).await
    }

    /// Initial clock sync and reconciliation
    ///
    /// Failures are logged, not fatal: a stale clock only blocks new orders.
    pub async fn start(&self) {
        match self.sync_clock().await {
            Ok(offset) => tracing::info!(offset_ms = offset.offset_ms, "Initial clock sync done"),
            Err(e) => tracing::warn!(error = %e, "Initial clock sync failed, order placement blocked until it succeeds"),
        }
        match self.reconcile().await {
            Ok(report) => {
                let positions = self.positions.all().await.len();
                tracing::info!(
                    positions,
                    orphaned = report.orphaned.len(),
                    "Initial reconciliation done"
                );
            }
            Err(e) => tracing::warn!(error = %e, "Initial reconciliation failed"),
        }
    }

    /// Spawn the clock, reconciliation and market data loops
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let clock_task = {
            let engine = self.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move { engine.clock_loop(shutdown).await })
        };
        let reconcile_task = {
            let engine = self.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move { engine.reconcile_loop(shutdown).await })
        };
        let market_task = {
            let engine = self.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move { engine.market_data_loop(shutdown).await })
        };

        vec![clock_task, reconcile_task, market_task]
    }

    pub fn shutdown(&self) {
        // No receivers just means no loops are running
        let _ = self.shutdown_tx.send(());
    }

    async fn clock_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        let period = Duration::from_secs(self.settings.clock.resync_interval_secs.max(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(every_secs = period.as_secs(), "Clock resync loop starting");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_clock().await {
                        let stale = self.gateway.clock().is_stale().await;
                        tracing::warn!(error = %e, stale, "Clock resync failed, keeping last offset");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Clock resync loop shutting down");
                    break;
                }
            }
        }
    }

    async fn reconcile_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        let period = Duration::from_secs(self.settings.reconcile.interval_secs.max(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let fills = self.executor.reconcile_signal();
        tracing::info!(every_secs = period.as_secs(), "Reconciliation loop starting");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = fills.notified() => {
                    tracing::debug!("Fill observed, reconciling early");
                }
                _ = shutdown.recv() => {
                    tracing::info!("Reconciliation loop shutting down");
                    break;
                }
            }

            if let Err(e) = self.reconcile().await {
                tracing::warn!(error = %e, "Reconciliation pass failed");
            }
        }
    }

    async fn market_data_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        let period = Duration::from_secs(self.settings.market_data.poll_interval_secs.max(1));
        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            every_secs = period.as_secs(),
            symbols = ?self.settings.market_data.symbols,
            "Market data loop starting"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => {
                    tracing::info!("Market data loop shutting down");
                    break;
                }
            }

            for symbol in &self.settings.market_data.symbols {
                match self.poll_market_data(symbol).await {
                    Ok(Some(record)) => tracing::info!(
                        symbol = %symbol,
                        client_request_id = %record.client_request_id,
                        state = %record.state,
                        "Exit order placed"
                    ),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(symbol = %symbol, error = %e, "Market data tick failed"),
                }
            }
        }
    }
}
