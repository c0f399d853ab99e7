use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{RollingSma, WilderRsi};
use crate::models::{IndicatorSnapshot, PriceBar};

pub const SMA_FAST_PERIOD: usize = 20;
pub const SMA_SLOW_PERIOD: usize = 50;
pub const RSI_PERIOD: usize = 14;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum IndicatorError {
    #[error("bar at {bar} is not after last accepted bar at {last}")]
    OutOfOrderBar {
        bar: DateTime<Utc>,
        last: DateTime<Utc>,
    },
}

/// Streaming SMA20 / SMA50 / RSI14 over one symbol's closed bars
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    sma_fast: RollingSma,
    sma_slow: RollingSma,
    rsi: WilderRsi,
    last_bar: Option<DateTime<Utc>>,
    bars_seen: usize,
}

impl IndicatorEngine {
    pub fn new() -> Self {
        Self {
            sma_fast: RollingSma::new(SMA_FAST_PERIOD),
            sma_slow: RollingSma::new(SMA_SLOW_PERIOD),
            rsi: WilderRsi::new(RSI_PERIOD),
            last_bar: None,
            bars_seen: 0,
        }
    }

    /// Fold in the next bar
    ///
    /// A bar not strictly after the last accepted one is rejected and leaves
    /// every window untouched.
    pub fn on_bar(&mut self, bar: &PriceBar) -> Result<IndicatorSnapshot, IndicatorError> {
        if let Some(last) = self.last_bar {
            if bar.timestamp <= last {
                return Err(IndicatorError::OutOfOrderBar {
                    bar: bar.timestamp,
                    last,
                });
            }
        }

        self.sma_fast.push(bar.close);
        self.sma_slow.push(bar.close);
        self.rsi.push(bar.close);
        self.last_bar = Some(bar.timestamp);
        self.bars_seen += 1;

        Ok(self.snapshot())
    }

    /// Feed only the bars newer than the last accepted one
    ///
    /// Polling returns overlapping history; already-seen bars are skipped
    /// rather than reported as out of order. Returns how many were applied.
    pub fn catch_up(&mut self, bars: &[PriceBar]) -> usize {
        let mut applied = 0;
        for bar in bars {
            if self.last_bar.map_or(true, |last| bar.timestamp > last)
                && self.on_bar(bar).is_ok()
            {
                applied += 1;
            }
        }
        applied
    }

    pub fn snapshot(&self) -> IndicatorSnapshot {
        IndicatorSnapshot {
            sma20: self.sma_fast.value(),
            sma50: self.sma_slow.value(),
            rsi14: self.rsi.value(),
            as_of_bar_timestamp: self.last_bar,
        }
    }

    pub fn bars_seen(&self) -> usize {
        self.bars_seen
    }
}

impl Default for IndicatorEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{calculate_rsi, calculate_sma};
    use chrono::{Duration, TimeZone};

    fn bar(i: i64, close: f64) -> PriceBar {
        PriceBar {
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::hours(i),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    fn closes(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + ((i * 7) % 11) as f64 - 5.0).collect()
    }

    #[test]
    fn test_sma20_after_twenty_bars() {
        let prices = closes(20);
        let mut engine = IndicatorEngine::new();

        let mut snapshot = IndicatorSnapshot::default();
        for (i, close) in prices.iter().enumerate() {
            snapshot = engine.on_bar(&bar(i as i64, *close)).unwrap();
            if i < 19 {
                assert!(snapshot.sma20.is_none());
            }
        }

        let mean = prices.iter().sum::<f64>() / 20.0;
        assert!((snapshot.sma20.unwrap() - mean).abs() < 1e-9);
        assert!(snapshot.sma50.is_none());
        assert_eq!(snapshot.as_of_bar_timestamp, Some(bar(19, 0.0).timestamp));
    }

    #[test]
    fn test_insufficient_history_per_indicator() {
        let mut engine = IndicatorEngine::new();
        let prices = closes(60);

        for (i, close) in prices.iter().enumerate() {
            let snapshot = engine.on_bar(&bar(i as i64, *close)).unwrap();
            let seen = i + 1;
            assert_eq!(snapshot.rsi14.is_some(), seen > RSI_PERIOD);
            assert_eq!(snapshot.sma20.is_some(), seen >= SMA_FAST_PERIOD);
            assert_eq!(snapshot.sma50.is_some(), seen >= SMA_SLOW_PERIOD);
        }
    }

    #[test]
    fn test_matches_batch_calculation() {
        let prices = closes(75);
        let mut engine = IndicatorEngine::new();
        let mut snapshot = IndicatorSnapshot::default();
        for (i, close) in prices.iter().enumerate() {
            snapshot = engine.on_bar(&bar(i as i64, *close)).unwrap();
        }

        assert!((snapshot.sma50.unwrap() - calculate_sma(&prices, 50).unwrap()).abs() < 1e-9);
        assert!((snapshot.rsi14.unwrap() - calculate_rsi(&prices, 14).unwrap()).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_order_bar_leaves_windows_unchanged() {
        let mut engine = IndicatorEngine::new();
        for (i, close) in closes(30).iter().enumerate() {
            engine.on_bar(&bar(i as i64, *close)).unwrap();
        }
        let before = engine.snapshot();

        let duplicate = engine.on_bar(&bar(29, 1_000.0));
        assert!(matches!(duplicate, Err(IndicatorError::OutOfOrderBar { .. })));

        let older = engine.on_bar(&bar(3, 1_000.0));
        assert!(matches!(older, Err(IndicatorError::OutOfOrderBar { .. })));

        assert_eq!(engine.snapshot(), before);
        assert_eq!(engine.bars_seen(), 30);
    }

    #[test]
    fn test_catch_up_skips_seen_bars() {
        let prices = closes(25);
        let bars: Vec<PriceBar> = prices
            .iter()
            .enumerate()
            .map(|(i, c)| bar(i as i64, *c))
            .collect();

        let mut engine = IndicatorEngine::new();
        assert_eq!(engine.catch_up(&bars[..20]), 20);
        assert_eq!(engine.catch_up(&bars[10..]), 5);
        assert_eq!(engine.bars_seen(), 25);
    }
}
