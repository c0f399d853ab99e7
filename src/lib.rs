// Core modules
pub mod api;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod indicators;
pub mod models;
pub mod risk;

// Re-export commonly used types
pub use api::{BinanceFuturesClient, Exchange, ExchangeError, PaperExchange};
pub use config::Settings;
pub use engine::TradingEngine;
pub use error::EngineError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, EngineError>;
