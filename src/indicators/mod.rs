// Technical indicators: SMA and Wilder RSI, batch and streaming

pub mod engine;
pub mod moving_average;
pub mod rsi;

pub use engine::{IndicatorEngine, IndicatorError};
pub use moving_average::{calculate_sma, RollingSma};
pub use rsi::{calculate_rsi, WilderRsi};
