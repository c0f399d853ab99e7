use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::api::{Exchange, ExchangeError};
use crate::config::ClockSettings;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClockError {
    #[error("server time query failed: {0}")]
    TimeQuery(#[from] ExchangeError),

    #[error("server time query timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    #[error("round trip of {round_trip_ms}ms exceeds {max_ms}ms, sample discarded")]
    LatencyTooHigh { round_trip_ms: i64, max_ms: i64 },

    #[error("offset of {offset_ms}ms exceeds sanity bound of {max_ms}ms")]
    OffsetOutOfBounds { offset_ms: i64, max_ms: i64 },
}

/// Estimated local-minus-exchange clock difference
///
/// `offset_ms = midpoint(local send, local receive) - exchange time`, so
/// exchange time is `local - offset_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClockOffset {
    pub offset_ms: i64,
    pub round_trip_ms: i64,
    pub measured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClockStatus {
    pub offset: Option<ClockOffset>,
    pub stale: bool,
}

#[derive(Default)]
struct ClockState {
    current: Option<ClockOffset>,
    last_good: Option<Instant>,
    /// Last sample breached the offset sanity bound
    suspect: bool,
}

/// Keeps the exchange clock estimate every signed request is stamped with
pub struct ClockSync {
    settings: ClockSettings,
    state: RwLock<ClockState>,
}

impl ClockSync {
    pub fn new(settings: ClockSettings) -> Self {
        Self {
            settings,
            state: RwLock::new(ClockState::default()),
        }
    }

    /// Ask the exchange for its time once and fold the sample in
    ///
    /// On any failure, a timeout included, the previous offset is kept.
    pub async fn resync(
        &self,
        exchange: &dyn Exchange,
        timeout: Duration,
    ) -> Result<ClockOffset, ClockError> {
        let sent = Utc::now().timestamp_millis();
        let server = match tokio::time::timeout(timeout, exchange.server_time()).await {
            Ok(Ok(server)) => server,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Server time query failed, keeping last offset");
                return Err(e.into());
            }
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                tracing::warn!(timeout_ms, "Server time query timed out, keeping last offset");
                return Err(ClockError::TimedOut { timeout_ms });
            }
        };
        let received = Utc::now().timestamp_millis();

        self.apply_sample(sent, received, server).await
    }

    /// Fold in one sample: local send/receive times and the exchange's answer
    pub async fn apply_sample(
        &self,
        sent_ms: i64,
        received_ms: i64,
        server_ms: i64,
    ) -> Result<ClockOffset, ClockError> {
        let round_trip_ms = received_ms - sent_ms;
        if round_trip_ms > self.settings.max_round_trip_ms {
            tracing::warn!(
                round_trip_ms,
                max_ms = self.settings.max_round_trip_ms,
                "Discarding clock sample with excessive latency"
            );
            return Err(ClockError::LatencyTooHigh {
                round_trip_ms,
                max_ms: self.settings.max_round_trip_ms,
            });
        }

        let midpoint = sent_ms + round_trip_ms / 2;
        let offset_ms = midpoint - server_ms;

        let mut state = self.state.write().await;

        if offset_ms.abs() > self.settings.max_abs_offset_ms {
            state.suspect = true;
            tracing::warn!(
                offset_ms,
                max_ms = self.settings.max_abs_offset_ms,
                "Clock offset beyond sanity bound, flagging clock stale"
            );
            return Err(ClockError::OffsetOutOfBounds {
                offset_ms,
                max_ms: self.settings.max_abs_offset_ms,
            });
        }

        let offset = ClockOffset {
            offset_ms,
            round_trip_ms,
            measured_at: Utc::now(),
        };
        state.current = Some(offset);
        state.last_good = Some(Instant::now());
        state.suspect = false;

        tracing::info!(offset_ms, round_trip_ms, "Clock synchronized");
        Ok(offset)
    }

    pub async fn offset(&self) -> Option<ClockOffset> {
        self.state.read().await.current
    }

    /// No good sample within `stale_after_secs`, or the last one was suspect
    pub async fn is_stale(&self) -> bool {
        let state = self.state.read().await;
        let max_age = Duration::from_secs(self.settings.stale_after_secs);
        state.suspect || state.last_good.map_or(true, |at| at.elapsed() > max_age)
    }

    pub async fn status(&self) -> ClockStatus {
        ClockStatus {
            offset: self.offset().await,
            stale: self.is_stale().await,
        }
    }

    /// Estimated exchange time minus the safety buffer, in epoch ms
    ///
    /// Uses the last known offset even when stale; callers decide whether
    /// staleness matters for them.
    pub async fn request_timestamp_ms(&self) -> i64 {
        let offset = self.state.read().await.current.map_or(0, |o| o.offset_ms);
        Utc::now().timestamp_millis() - offset - self.settings.timestamp_buffer_ms
    }
}
