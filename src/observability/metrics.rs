//! Connectivity metrics
//!
//! Translates raw connected/disconnected signals into the three observable
//! values: `isConnected`, `reconnectionAttempts` and
//! `reconnectionAttemptsLatestBatch`. Every transition runs under one mutex.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct MetricState {
    is_connected: bool,
    reconnection_attempts: u64,
    latest_batch: u64,
    last_transition: Option<DateTime<Utc>>,
}

/// Point-in-time copy of the connectivity metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivitySnapshot {
    /// Gauge, 0 or 1
    pub is_connected: u8,
    /// Monotonic across the process lifetime
    pub reconnection_attempts: u64,
    /// Attempts since connectivity was last lost
    pub reconnection_attempts_latest_batch: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition: Option<DateTime<Utc>>,
}

/// Thread-safe connectivity state machine
#[derive(Debug, Default)]
pub struct ConnectivityMetrics {
    state: Mutex<MetricState>,
}

impl ConnectivityMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connectivity signal.
    ///
    /// | previous | new | effect |
    /// |---|---|---|
    /// | 0 | 0 | one more failed attempt in this episode |
    /// | 0 | 1 | the successful attempt also counts, then connected |
    /// | 1 | 0 | a new episode begins, batch back to 0 |
    /// | 1 | 1 | nothing |
    pub fn set_connected(&self, connected: bool) {
        if let Ok(mut state) = self.state.lock() {
            match (state.is_connected, connected) {
                (false, _) => {
                    state.reconnection_attempts += 1;
                    state.latest_batch += 1;
                }
                (true, false) => {
                    state.latest_batch = 0;
                }
                (true, true) => return,
            }
            state.is_connected = connected;
            state.last_transition = Some(Utc::now());

            debug!(
                is_connected = connected,
                reconnection_attempts = state.reconnection_attempts,
                latest_batch = state.latest_batch,
                "Connectivity metrics updated"
            );
        }
    }

    pub fn snapshot(&self) -> ConnectivitySnapshot {
        match self.state.lock() {
            Ok(state) => ConnectivitySnapshot {
                is_connected: u8::from(state.is_connected),
                reconnection_attempts: state.reconnection_attempts,
                reconnection_attempts_latest_batch: state.latest_batch,
                last_transition: state.last_transition,
            },
            Err(_) => ConnectivitySnapshot {
                is_connected: 0,
                reconnection_attempts: 0,
                reconnection_attempts_latest_batch: 0,
                last_transition: None,
            },
        }
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot().is_connected == 1
    }

    pub fn reconnection_attempts(&self) -> u64 {
        self.snapshot().reconnection_attempts
    }

    pub fn reconnection_attempts_latest_batch(&self) -> u64 {
        self.snapshot().reconnection_attempts_latest_batch
    }
}
