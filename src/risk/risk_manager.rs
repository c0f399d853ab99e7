use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::config::RiskSettings;
use crate::execution::{OrderStore, PositionTable};
use crate::models::{OrderIntent, Position, RiskRule, Side};

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Allow,
    Reject(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => f.write_str("stop-loss"),
            ExitReason::TakeProfit => f.write_str("take-profit"),
        }
    }
}

/// Market order that fully closes a position
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitIntent {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub reason: ExitReason,
    pub trigger_price: f64,
}

impl ExitIntent {
    pub fn to_order_intent(&self) -> OrderIntent {
        OrderIntent::market(&self.symbol, self.side, self.quantity).reduce_only()
    }
}

/// Pre-trade limits and stop-loss / take-profit evaluation
///
/// Rules are re-read on every call so the latest `set_rule` wins. Exits are
/// debounced per symbol until the position table shows the position flat.
pub struct RiskManager {
    defaults: RiskSettings,
    rules: RwLock<HashMap<String, RiskRule>>,
    positions: Arc<PositionTable>,
    orders: Arc<OrderStore>,
    /// Symbol -> side of the position an exit was emitted for
    exits_emitted: Mutex<HashMap<String, Side>>,
}

impl RiskManager {
    /// Starts with the rules from settings installed
    pub fn new(defaults: RiskSettings, positions: Arc<PositionTable>, orders: Arc<OrderStore>) -> Self {
        let rules = defaults
            .rules
            .iter()
            .map(|rule| {
                let mut rule = rule.clone();
                rule.symbol = rule.symbol.to_uppercase();
                (rule.symbol.clone(), rule)
            })
            .collect();
        Self {
            defaults,
            rules: RwLock::new(rules),
            positions,
            orders,
            exits_emitted: Mutex::new(HashMap::new()),
        }
    }

    pub async fn set_rule(&self, rule: RiskRule) {
        tracing::info!(
            symbol = %rule.symbol,
            stop_loss = ?rule.stop_loss_price,
            take_profit = ?rule.take_profit_price,
            max_position_size = rule.max_position_size,
            "Risk rule updated"
        );
        self.rules.write().await.insert(rule.symbol.clone(), rule);
    }

    /// The symbol's rule, or one built from configured defaults
    pub async fn rule(&self, symbol: &str) -> RiskRule {
        match self.rules.read().await.get(symbol) {
            Some(rule) => rule.clone(),
            None => RiskRule::new(symbol, self.defaults.default_max_position_size),
        }
    }

    /// Would this intent push the position past the size limit?
    ///
    /// Counts the reconciled position, fills seen since it was last
    /// refreshed, and every still-open order on the same side, so concurrent
    /// intents can't jointly overshoot. Reduce-only intents and intents that
    /// shrink the absolute exposure are always allowed.
    pub async fn check_pre_trade(&self, intent: &OrderIntent) -> RiskDecision {
        if intent.reduce_only {
            return RiskDecision::Allow;
        }

        let rule = self.rule(&intent.symbol).await;
        let net = self.positions.net_quantity(&intent.symbol).await;
        let unsynced = self.orders.unsynced_fill(&intent.symbol).await;
        let reserved = self.orders.open_quantity(&intent.symbol, intent.side).await;

        let current = net + unsynced;
        let projected = current + intent.side.sign() * (reserved + intent.quantity);
        if projected.abs() <= rule.max_position_size || projected.abs() < current.abs() {
            return RiskDecision::Allow;
        }

        let reason = format!(
            "projected position {:.4} exceeds max {:.4} (position {:.4}, unsynced fills {:.4}, open {:.4}, intent {:.4})",
            projected, rule.max_position_size, net, unsynced, reserved, intent.quantity
        );
        tracing::warn!(
            symbol = %intent.symbol,
            client_request_id = %intent.client_request_id,
            %reason,
            "Pre-trade check rejected intent"
        );
        RiskDecision::Reject(reason)
    }

    /// Check a price tick against the symbol's exit thresholds
    pub async fn evaluate(&self, symbol: &str, price: f64) -> Option<ExitIntent> {
        let position = self.positions.get(symbol).await.filter(|p| !p.is_flat());
        let mut emitted = self.exits_emitted.lock().await;

        let Some(position) = position else {
            if emitted.remove(symbol).is_some() {
                tracing::info!(symbol, "Position confirmed flat, exit debounce released");
            }
            return None;
        };
        let side = position.side()?;

        match emitted.get(symbol) {
            Some(exited) if *exited == side => {
                tracing::debug!(symbol, price, "Exit already emitted, waiting for flat");
                return None;
            }
            Some(_) => {
                // Flipped without a flat observation in between; the old exit is moot
                emitted.remove(symbol);
            }
            None => {}
        }

        let rule = self.rule(symbol).await;
        let (stop_loss, take_profit) = self.thresholds(&rule, &position);
        let reason = exit_reason(side, price, stop_loss, take_profit)?;

        let exit = ExitIntent {
            symbol: symbol.to_string(),
            side: side.opposite(),
            quantity: position.net_quantity.abs(),
            reason,
            trigger_price: price,
        };
        emitted.insert(symbol.to_string(), side);

        tracing::warn!(
            symbol,
            %reason,
            price,
            entry_price = position.entry_price,
            quantity = exit.quantity,
            "Exit threshold crossed"
        );
        Some(exit)
    }

    /// Let the next tick try again after an exit order failed
    pub async fn release_exit(&self, symbol: &str) {
        if self.exits_emitted.lock().await.remove(symbol).is_some() {
            tracing::warn!(symbol, "Exit order did not go through, debounce released");
        }
    }

    pub async fn exit_pending(&self, symbol: &str) -> bool {
        self.exits_emitted.lock().await.contains_key(symbol)
    }

    /// Explicit prices win; otherwise configured percentages off the entry
    fn thresholds(&self, rule: &RiskRule, position: &Position) -> (Option<f64>, Option<f64>) {
        let entry = position.entry_price;
        let long = position.net_quantity > 0.0;

        let stop_loss = rule.stop_loss_price.or_else(|| {
            self.defaults
                .default_stop_loss_pct
                .map(|pct| if long { entry * (1.0 - pct) } else { entry * (1.0 + pct) })
        });
        let take_profit = rule.take_profit_price.or_else(|| {
            self.defaults
                .default_take_profit_pct
                .map(|pct| if long { entry * (1.0 + pct) } else { entry * (1.0 - pct) })
        });

        (stop_loss, take_profit)
    }
}

fn exit_reason(
    position_side: Side,
    price: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
) -> Option<ExitReason> {
    match position_side {
        Side::Buy => {
            if stop_loss.is_some_and(|sl| price <= sl) {
                Some(ExitReason::StopLoss)
            } else if take_profit.is_some_and(|tp| price >= tp) {
                Some(ExitReason::TakeProfit)
            } else {
                None
            }
        }
        Side::Sell => {
            if stop_loss.is_some_and(|sl| price >= sl) {
                Some(ExitReason::StopLoss)
            } else if take_profit.is_some_and(|tp| price <= tp) {
                Some(ExitReason::TakeProfit)
            } else {
                None
            }
        }
    }
}
