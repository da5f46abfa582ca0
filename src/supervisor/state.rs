//! Pure lifecycle state machine for the connection supervisor
//!
//! `next_state` is a pure function; the supervisor publishes its result
//! through a watch channel and logs each change with `log_state_transition`.

use serde::Serialize;
use std::fmt;
use tracing::{error, info, warn};

/// Supervisor lifecycle.
///
/// `Disconnected -> Connecting -> Connected -> (Closing | Recovering) -> Disconnected`.
/// `ShuttingDown` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Recovering,
    ShuttingDown,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Disconnected => "disconnected",
            SupervisorState::Connecting => "connecting",
            SupervisorState::Connected => "connected",
            SupervisorState::Closing => "closing",
            SupervisorState::Recovering => "recovering",
            SupervisorState::ShuttingDown => "shutting_down",
        }
    }

    /// Handles may be handed out only in this state
    pub fn is_connected(&self) -> bool {
        matches!(self, SupervisorState::Connected)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectRequested,
    AttemptSucceeded,
    AttemptFailed { will_retry: bool },
    CloseRequested,
    Closed,
    ConnectionLost,
    Recovered,
    ShutdownRequested,
}

/// Determine next state after a connection event (pure function)
pub fn next_state(current: SupervisorState, event: ConnectionEvent) -> SupervisorState {
    use ConnectionEvent as E;
    use SupervisorState as S;

    match (current, event) {
        (S::ShuttingDown, _) | (_, E::ShutdownRequested) => S::ShuttingDown,

        (S::Connected, E::ConnectRequested) => S::Connected,
        (_, E::ConnectRequested) => S::Connecting,

        (_, E::AttemptSucceeded) => S::Connected,
        (_, E::AttemptFailed { will_retry: true }) => S::Connecting,
        (_, E::AttemptFailed { will_retry: false }) => S::Disconnected,

        (_, E::CloseRequested) => S::Closing,
        (_, E::Closed) => S::Disconnected,

        (S::Connected, E::ConnectionLost) => S::Recovering,
        (S::Recovering, E::Recovered) => S::Connected,

        // Late notifications from the client's recovery thread
        (state, E::ConnectionLost) | (state, E::Recovered) => state,
    }
}

/// Log connection state transition (pure logging function)
pub fn log_state_transition(from: SupervisorState, to: SupervisorState) {
    use SupervisorState as S;

    if from == to {
        return;
    }

    match (from, to) {
        (S::Connecting, S::Connected) => info!("Broker connection established"),
        (S::Connected, S::Recovering) => warn!("Broker connection lost, waiting for recovery"),
        (S::Recovering, S::Connected) => info!("Broker connection recovered"),
        (S::Connecting, S::Disconnected) => error!("Broker connection failed, giving up"),
        (_, S::ShuttingDown) => info!(from = %from, "Supervisor shutting down"),
        _ => info!(from = %from, to = %to, "Supervisor state changed"),
    }
}
