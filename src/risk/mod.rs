// Risk management module
pub mod risk_manager;

pub use risk_manager::{ExitIntent, ExitReason, RiskDecision, RiskManager};
