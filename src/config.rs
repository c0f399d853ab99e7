use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::models::RiskRule;

/// Immutable startup configuration
///
/// Built once by the binary; the library only ever receives the sections
/// it needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub exchange: ExchangeSettings,
    pub retry: RetrySettings,
    pub clock: ClockSettings,
    pub reconcile: ReconcileSettings,
    pub market_data: MarketDataSettings,
    pub risk: RiskSettings,
}

impl Settings {
    /// Layer defaults, an optional TOML file and `FUTURESBOT__*` env vars
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        } else {
            builder = builder.add_source(config::File::with_name("futuresbot").required(false));
        }

        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix("FUTURESBOT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("market_data.symbols")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        tracing::debug!(
            base_url = %settings.exchange.resolved_base_url(),
            symbols = ?settings.market_data.symbols,
            "Loaded settings"
        );

        Ok(settings)
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub testnet: bool,
    /// Overrides the testnet/mainnet URL when set
    pub base_url: Option<String>,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window_ms: u64,
    pub request_timeout_ms: u64,
    pub rate_limit_per_minute: u32,
    /// Treat client order ids as authoritative duplicate detection
    pub honors_idempotency_keys: bool,
}

impl ExchangeSettings {
    pub fn resolved_base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if self.testnet => crate::api::binance::TESTNET_URL.to_string(),
            None => crate::api::binance::MAINNET_URL.to_string(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            testnet: true,
            base_url: None,
            api_key: String::new(),
            api_secret: String::new(),
            recv_window_ms: 5_000,
            request_timeout_ms: 10_000,
            rate_limit_per_minute: 1_200,
            honors_idempotency_keys: false,
        }
    }
}

// Keep credentials out of logs
impl std::fmt::Debug for ExchangeSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeSettings")
            .field("testnet", &self.testnet)
            .field("base_url", &self.base_url)
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("recv_window_ms", &self.recv_window_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field("honors_idempotency_keys", &self.honors_idempotency_keys)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            max_delay_ms: 8_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSettings {
    pub resync_interval_secs: u64,
    /// Samples with a longer round trip are discarded
    pub max_round_trip_ms: i64,
    /// Larger offsets are treated as suspect
    pub max_abs_offset_ms: i64,
    pub stale_after_secs: u64,
    /// Signed timestamps are pulled back by this much
    pub timestamp_buffer_ms: i64,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            resync_interval_secs: 300,
            max_round_trip_ms: 1_000,
            max_abs_offset_ms: 60_000,
            stale_after_secs: 900,
            timestamp_buffer_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    pub interval_secs: u64,
    pub archive_after_secs: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            archive_after_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketDataSettings {
    pub symbols: Vec<String>,
    pub interval: String,
    pub limit: u16,
    pub poll_interval_secs: u64,
}

impl Default for MarketDataSettings {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            interval: "1h".to_string(),
            limit: 100,
            poll_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    /// Applies to symbols without an explicit rule
    pub default_max_position_size: f64,
    /// Fraction of entry price, e.g. 0.02 = 2%
    pub default_stop_loss_pct: Option<f64>,
    pub default_take_profit_pct: Option<f64>,
    /// Per-symbol rules installed at startup
    pub rules: Vec<RiskRule>,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            default_max_position_size: 1.0,
            default_stop_loss_pct: None,
            default_take_profit_pct: None,
            rules: Vec::new(),
        }
    }
}
