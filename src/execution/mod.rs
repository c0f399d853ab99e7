// Order execution, order/position state and reconciliation
pub mod executor;
pub mod order_store;
pub mod position_tracker;
pub mod symbol_locks;

pub use executor::OrderExecutor;
pub use order_store::{OrderSlot, OrderStore};
pub use position_tracker::{PositionTable, PositionTracker, ReconcileReport, StateChange};
pub use symbol_locks::SymbolLocks;
