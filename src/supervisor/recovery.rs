//! Reaction to the broker client's own recovery notifications
//!
//! The client re-establishes the connection by itself; this observer only
//! updates the metrics and state on loss and re-primes the exchange once the
//! client reports recovery. A failed re-prime is retried every recovery
//! interval while the supervisor stays in `Recovering`.

use super::state::{ConnectionEvent, SupervisorState};
use super::Shared;
use crate::recovery_span;
use crate::transport::{BrokerChannel, BrokerConnection, RecoveryListener};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn, Instrument};

/// Registered on the connection when automatic recovery is enabled
pub struct RecoveryObserver {
    shared: Weak<Shared>,
}

impl RecoveryObserver {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl RecoveryListener for RecoveryObserver {
    fn on_connection_lost(&self, reason: &str) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let _span = recovery_span!(event = "connection_lost").entered();

        // Losses during close, reset or shutdown are expected
        let state = shared.current_state();
        if state != SupervisorState::Connected {
            debug!(state = %state, reason = %reason, "Ignoring connection loss");
            return;
        }

        warn!(reason = %reason, "Broker client reported connection loss");
        shared.metrics.set_connected(false);
        shared.transition(ConnectionEvent::ConnectionLost);
    }

    async fn on_recovered(&self, channel: Arc<dyn BrokerChannel>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        async move {
            let state = shared.current_state();
            if !matches!(state, SupervisorState::Recovering | SupervisorState::Connected) {
                debug!(state = %state, "Ignoring recovery notification");
                let _ = channel.close().await;
                return;
            }

            let Some(connection) = shared.handles.lock().await.connection.clone() else {
                debug!("No connection held, ignoring recovery notification");
                return;
            };

            if reinitialize(&shared, connection.as_ref(), channel).await {
                return;
            }

            let retry = retry_reinitialize(Arc::downgrade(&shared), connection);
            tokio::spawn(retry.instrument(recovery_span!(event = "reinitialize")));
        }
        .instrument(recovery_span!(event = "recovered"))
        .await
    }
}

/// Ensure the exchange on `channel` and adopt it. False when the exchange
/// could not be initialized.
async fn reinitialize(
    shared: &Shared,
    connection: &dyn BrokerConnection,
    channel: Arc<dyn BrokerChannel>,
) -> bool {
    let ensured = match shared.exchange.ensure(connection, channel).await {
        Ok(ensured) => ensured,
        Err(e) => {
            error!(
                error = %e,
                "Exchange re-initialization after recovery failed"
            );
            return false;
        }
    };

    let mut handles = shared.handles.lock().await;
    let state = shared.current_state();
    if !matches!(state, SupervisorState::Recovering | SupervisorState::Connected) {
        drop(handles);
        debug!(state = %state, "Supervisor moved on, discarding recovered channel");
        let _ = ensured.channel.close().await;
        return true;
    }
    handles.channel = Some(ensured.channel);
    drop(handles);

    shared.transition(ConnectionEvent::Recovered);
    info!(status = ?ensured.status, "Exchange re-initialized after recovery");
    true
}

/// Retry exchange initialization every recovery interval until it succeeds,
/// the supervisor leaves `Recovering`, or the connection is replaced.
async fn retry_reinitialize(shared: Weak<Shared>, connection: Arc<dyn BrokerConnection>) {
    let (mut state_rx, interval) = match shared.upgrade() {
        Some(shared) => (shared.state_tx.subscribe(), shared.recovery_interval),
        None => return,
    };
    let mut attempt = 1u32;

    loop {
        let still_recovering = tokio::select! {
            _ = tokio::time::sleep(interval) => true,
            _ = state_rx.wait_for(|state| *state != SupervisorState::Recovering) => false,
        };
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !still_recovering || shared.current_state() != SupervisorState::Recovering {
            debug!("Supervisor left recovery, stopping exchange re-initialization");
            return;
        }
        if !holds_connection(&shared, &connection).await {
            debug!("Connection replaced, stopping exchange re-initialization");
            return;
        }

        attempt += 1;
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(attempt, error = %e, "Cannot open a channel for exchange re-initialization");
                continue;
            }
        };
        if reinitialize(&shared, connection.as_ref(), channel).await {
            info!(attempt, "Exchange re-initialization succeeded after retry");
            return;
        }
    }
}

async fn holds_connection(shared: &Shared, connection: &Arc<dyn BrokerConnection>) -> bool {
    shared
        .handles
        .lock()
        .await
        .connection
        .as_ref()
        .is_some_and(|held| Arc::as_ptr(held) as *const () == Arc::as_ptr(connection) as *const ())
}
