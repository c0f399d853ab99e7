/// Calculate Relative Strength Index (RSI) with Wilder smoothing
///
/// The first average gain/loss is the simple mean of the first `period`
/// changes; every later change folds in as `(prev * (period - 1) + x) / period`.
/// Needs `period + 1` prices.
///
/// Values:
/// - RSI > 70: Overbought
/// - RSI < 30: Oversold
///
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    let mut rsi = WilderRsi::new(period);
    let mut value = None;
    for price in prices {
        value = rsi.push(*price);
    }
    value
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        // Flat series reads as neutral
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }

    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// Incremental Wilder RSI
#[derive(Debug, Clone)]
pub struct WilderRsi {
    period: usize,
    prev_close: Option<f64>,
    // Sums of the seed changes until `period` have been seen
    seed_gain: f64,
    seed_loss: f64,
    changes: usize,
    avg_gain: f64,
    avg_loss: f64,
}

impl WilderRsi {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            prev_close: None,
            seed_gain: 0.0,
            seed_loss: 0.0,
            changes: 0,
            avg_gain: 0.0,
            avg_loss: 0.0,
        }
    }

    pub fn push(&mut self, close: f64) -> Option<f64> {
        let Some(prev) = self.prev_close.replace(close) else {
            return None;
        };
        if self.period == 0 {
            return None;
        }

        let change = close - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        self.changes += 1;

        let period = self.period as f64;
        if self.changes < self.period {
            self.seed_gain += gain;
            self.seed_loss += loss;
        } else if self.changes == self.period {
            self.avg_gain = (self.seed_gain + gain) / period;
            self.avg_loss = (self.seed_loss + loss) / period;
        } else {
            self.avg_gain = (self.avg_gain * (period - 1.0) + gain) / period;
            self.avg_loss = (self.avg_loss * (period - 1.0) + loss) / period;
        }

        self.value()
    }

    /// `None` until `period` changes (`period + 1` closes) have been seen
    pub fn value(&self) -> Option<f64> {
        if self.period == 0 || self.changes < self.period {
            return None;
        }
        Some(rsi_from_averages(self.avg_gain, self.avg_loss))
    }
}
