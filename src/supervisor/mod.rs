//! Connection supervisor
//!
//! Owns the broker connection and channel, runs the bounded connect/retry
//! loop, and exposes explicit reset and shutdown.
//!
//! # Architecture
//!
//! - [`state`] - Pure lifecycle state machine
//! - [`recovery`] - Listener for the broker client's own recovery notifications
//! - [`readiness`] - Collaborator-owned "ready for shutdown" flag
//!
//! # Usage
//!
//! ```rust,no_run
//! use amqp_supervisor::config::SupervisorConfig;
//! use amqp_supervisor::credentials::EnvPropertySource;
//! use amqp_supervisor::supervisor::ConnectionSupervisor;
//! use amqp_supervisor::transport::LapinConnector;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = SupervisorConfig::load_from_file("supervisor.toml".as_ref())?;
//! let supervisor = ConnectionSupervisor::new(
//!     config,
//!     Arc::new(LapinConnector::new()),
//!     Arc::new(EnvPropertySource::new()),
//! )?;
//!
//! supervisor.connect().await?;
//! let channel = supervisor.channel().await;
//! // ... publish through the channel ...
//! supervisor.shutdown().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod readiness;
pub mod recovery;
pub mod state;

pub use readiness::ShutdownReadiness;
pub use recovery::RecoveryObserver;
pub use state::{log_state_transition, next_state, ConnectionEvent, SupervisorState};

use crate::config::SupervisorConfig;
use crate::credentials::{CredentialResolver, Credentials, PropertyNames, PropertySource};
use crate::error::{AttemptError, SupervisorError, SupervisorResult};
use crate::exchange::ExchangeInitializer;
use crate::observability::metrics::ConnectivityMetrics;
use crate::tls::TlsContextBuilder;
use crate::transport::{BrokerChannel, BrokerConnection, BrokerConnector, ConnectPlan};
use crate::{connection_span, lifecycle_span};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn, Instrument};

/// Handles owned by the supervisor. Both are `None` unless connected.
#[derive(Default)]
pub(crate) struct ConnectionState {
    pub(crate) connection: Option<Arc<dyn BrokerConnection>>,
    pub(crate) channel: Option<Arc<dyn BrokerChannel>>,
    /// Credentials of the current or last attempt
    pub(crate) credentials: Credentials,
}

/// State reachable from the recovery observer
pub(crate) struct Shared {
    pub(crate) handles: Mutex<ConnectionState>,
    pub(crate) state_tx: watch::Sender<SupervisorState>,
    pub(crate) metrics: Arc<ConnectivityMetrics>,
    pub(crate) exchange: ExchangeInitializer,
    /// Pause between exchange re-initialization attempts after recovery
    pub(crate) recovery_interval: Duration,
}

impl Shared {
    pub(crate) fn current_state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    /// Apply an event and log the change
    pub(crate) fn transition(&self, event: ConnectionEvent) -> SupervisorState {
        let mut from = SupervisorState::Disconnected;
        let mut to = SupervisorState::Disconnected;
        self.state_tx.send_if_modified(|state| {
            from = *state;
            to = next_state(from, event);
            *state = to;
            from != to
        });
        log_state_transition(from, to);
        to
    }
}

/// Why one attempt failed, and whether the loop may go on
enum AttemptFailure {
    Fatal(SupervisorError),
    Retryable(AttemptError),
}

/// Small capability interface for hosts
#[async_trait]
pub trait BrokerLifecycle: Send + Sync {
    async fn connect(&self) -> SupervisorResult<()>;
    async fn reset(&self) -> SupervisorResult<()>;
    async fn shutdown(&self);
    fn current_state(&self) -> SupervisorState;
}

/// Supervises one broker connection and its channel
pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    base_plan: ConnectPlan,
    connector: Arc<dyn BrokerConnector>,
    resolver: CredentialResolver,
    shared: Arc<Shared>,
    connect_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    readiness: ShutdownReadiness,
}

impl ConnectionSupervisor {
    /// Validate the configuration and build an idle supervisor.
    ///
    /// No network call happens here.
    pub fn new(
        config: SupervisorConfig,
        connector: Arc<dyn BrokerConnector>,
        property_source: Arc<dyn PropertySource>,
    ) -> SupervisorResult<Self> {
        let ignored = config.validate()?;
        if !ignored.is_empty() {
            warn!(
                ignored = ?ignored,
                "broker.uri is set; these fields are ignored"
            );
        }

        let base_plan = config.base_plan()?;
        let (state_tx, _) = watch::channel(SupervisorState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            handles: Mutex::new(ConnectionState::default()),
            state_tx,
            metrics: Arc::new(ConnectivityMetrics::new()),
            exchange: ExchangeInitializer::new(config.exchange_spec()),
            recovery_interval: base_plan.recovery.interval,
        });

        Ok(Self {
            config,
            base_plan,
            connector,
            resolver: CredentialResolver::new(property_source),
            shared,
            connect_lock: Mutex::new(()),
            shutdown_tx,
            readiness: ShutdownReadiness::default(),
        })
    }

    /// Use a readiness flag shared with the collaborator
    pub fn with_readiness(mut self, readiness: ShutdownReadiness) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn readiness(&self) -> ShutdownReadiness {
        self.readiness.clone()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<ConnectivityMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    pub fn current_state(&self) -> SupervisorState {
        self.shared.current_state()
    }

    /// Receiver that sees every state change
    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.shared.state_tx.subscribe()
    }

    pub fn using_default_exchange(&self) -> bool {
        self.shared.exchange.using_default_exchange()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Current channel, only while connected
    pub async fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        let handles = self.shared.handles.lock().await;
        if self.current_state().is_connected() {
            handles.channel.clone()
        } else {
            None
        }
    }

    /// Current connection, only while connected
    pub async fn connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        let handles = self.shared.handles.lock().await;
        if self.current_state().is_connected() {
            handles.connection.clone()
        } else {
            None
        }
    }

    fn property_names(&self) -> PropertyNames {
        self.config.credentials.property_names()
    }

    /// Check that the property source holds non-blank credentials
    pub fn validate_properties(&self) -> SupervisorResult<()> {
        Ok(self.resolver.validate_properties(&self.property_names())?)
    }

    /// Connect, retrying every recovery interval while automatic recovery
    /// is enabled. Returns immediately when already connected.
    pub async fn connect(&self) -> SupervisorResult<()> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShutdownInProgress);
        }

        let _guard = self.connect_lock.lock().await;

        if self.is_shutting_down() {
            return Err(SupervisorError::ShutdownInProgress);
        }
        if self.current_state().is_connected() {
            debug!("Already connected");
            return Ok(());
        }

        self.connect_loop()
            .instrument(connection_span!(endpoint = %self.base_plan.endpoint))
            .await
    }

    async fn connect_loop(&self) -> SupervisorResult<()> {
        self.shared.transition(ConnectionEvent::ConnectRequested);
        let recovery = self.base_plan.recovery;
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let error = match self.attempt(attempts).await {
                Ok(()) => return Ok(()),
                Err(AttemptFailure::Fatal(e)) => {
                    error!(attempt = attempts, error = %e.sanitized_message(), "Connect aborted");
                    self.shared
                        .transition(ConnectionEvent::AttemptFailed { will_retry: false });
                    return Err(e);
                }
                Err(AttemptFailure::Retryable(e)) => e,
            };

            self.shared.metrics.set_connected(false);

            if self.is_shutting_down() {
                return Err(SupervisorError::ShutdownInProgress);
            }

            let will_retry = recovery.enabled;
            error!(
                attempt = attempts,
                will_retry,
                error = %crate::error::sanitize_message(&error.to_string()),
                "Connect attempt failed"
            );
            self.shared
                .transition(ConnectionEvent::AttemptFailed { will_retry });

            if !will_retry {
                return Err(SupervisorError::connect_failed(attempts, error));
            }

            info!(
                delay_ms = recovery.interval.as_millis() as u64,
                "Retrying connect after delay"
            );
            if !self.interruptible_sleep(recovery.interval).await {
                return Err(SupervisorError::ShutdownInProgress);
            }
        }
    }

    /// One pass of resolve, TLS, dial, exchange bootstrap
    async fn attempt(&self, attempt: u32) -> Result<(), AttemptFailure> {
        let credentials = self
            .resolver
            .resolve(
                &self.config.credentials.static_credentials(),
                &self.property_names(),
            )
            .map_err(|e| AttemptFailure::Retryable(e.into()))?;

        let tls = if self.config.tls.enabled {
            let context = TlsContextBuilder::build(&self.config.tls)
                .map_err(|e| AttemptFailure::Fatal(e.into()))?;
            Some(context)
        } else {
            None
        };

        let mut plan = self.base_plan.clone();
        plan.credentials = credentials.clone();
        plan.tls = tls;

        info!(attempt, endpoint = %plan.endpoint, tls = plan.tls.is_some(), "Connecting to broker");

        let connection = self
            .connector
            .connect(&plan)
            .await
            .map_err(|e| AttemptFailure::Retryable(e.into()))?;

        match self.prime(&connection).await {
            Ok(channel) => self.adopt(connection, channel, credentials).await,
            Err(e) => {
                close_connection_quietly(connection.as_ref()).await;
                Err(AttemptFailure::Retryable(e))
            }
        }
    }

    /// Register the recovery hook, open the channel and ensure the exchange
    async fn prime(
        &self,
        connection: &Arc<dyn BrokerConnection>,
    ) -> Result<Arc<dyn BrokerChannel>, AttemptError> {
        if self.base_plan.recovery.enabled {
            connection.register_recovery_listener(Arc::new(RecoveryObserver::new(
                Arc::downgrade(&self.shared),
            )));
        }

        let channel = connection.create_channel().await?;
        let ensured = self.shared.exchange.ensure(connection.as_ref(), channel).await?;
        Ok(ensured.channel)
    }

    /// Store fresh handles unless shutdown won the race
    async fn adopt(
        &self,
        connection: Arc<dyn BrokerConnection>,
        channel: Arc<dyn BrokerChannel>,
        credentials: Credentials,
    ) -> Result<(), AttemptFailure> {
        let mut handles = self.shared.handles.lock().await;
        if self.is_shutting_down() {
            drop(handles);
            close_channel_quietly(channel.as_ref()).await;
            close_connection_quietly(connection.as_ref()).await;
            return Err(AttemptFailure::Fatal(SupervisorError::ShutdownInProgress));
        }

        info!(
            address = %connection.address(),
            channel = channel.id(),
            "Broker connection and channel ready"
        );
        handles.connection = Some(connection);
        handles.channel = Some(channel);
        handles.credentials = credentials;
        drop(handles);

        self.shared.transition(ConnectionEvent::AttemptSucceeded);
        self.shared.metrics.set_connected(true);
        Ok(())
    }

    /// Sleep unless shutdown is requested first.
    /// Returns true if the sleep completed.
    async fn interruptible_sleep(&self, delay: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return false;
        }
        tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => {
                info!("Shutdown signal received during retry delay, stopping");
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Close channel then connection, logging failures.
    /// Returns whether a connection was held.
    async fn close_resources(&self) -> bool {
        let (channel, connection) = {
            let mut handles = self.shared.handles.lock().await;
            (handles.channel.take(), handles.connection.take())
        };

        if let Some(channel) = channel {
            close_channel_quietly(channel.as_ref()).await;
        }

        match connection {
            Some(connection) => {
                close_connection_quietly(connection.as_ref()).await;
                true
            }
            None => false,
        }
    }

    /// Close everything and connect again. A no-op when automatic recovery
    /// is disabled.
    pub async fn reset(&self) -> SupervisorResult<()> {
        if !self.base_plan.recovery.enabled {
            info!("Automatic recovery disabled, reset ignored");
            return Ok(());
        }
        if self.is_shutting_down() {
            return Err(SupervisorError::ShutdownInProgress);
        }

        async {
            {
                let _guard = self.connect_lock.lock().await;
                self.shared.transition(ConnectionEvent::CloseRequested);
            }

            if self.close_resources().await {
                self.shared.metrics.set_connected(false);
            }
            self.shared.transition(ConnectionEvent::Closed);

            self.connect().await
        }
        .instrument(lifecycle_span!(event = "reset"))
        .await
    }

    /// Reset if the supervisor is down and the property source now holds
    /// different credentials. Returns whether a reset happened.
    pub async fn reconnect_if_credentials_changed(&self) -> SupervisorResult<bool> {
        if !self.base_plan.recovery.enabled || self.is_shutting_down() {
            return Ok(false);
        }
        if !matches!(
            self.current_state(),
            SupervisorState::Recovering | SupervisorState::Disconnected
        ) {
            return Ok(false);
        }

        let current = self.shared.handles.lock().await.credentials.clone();
        if !self
            .resolver
            .credentials_changed(&current, &self.property_names())?
        {
            return Ok(false);
        }

        info!(
            source = %self.resolver.source_description(),
            "Credentials changed while disconnected, reconnecting"
        );
        self.reset().await?;
        Ok(true)
    }

    /// Stop retrying, release the channel and connection, then wait until
    /// the collaborator reports it is ready. Idempotent.
    pub async fn shutdown(&self) {
        async {
            self.shutdown_tx.send_replace(true);
            self.shared.transition(ConnectionEvent::ShutdownRequested);

            if self.close_resources().await {
                self.shared.metrics.set_connected(false);
            }

            if !self.readiness.is_ready() {
                info!("Waiting for in-flight processing to drain");
            }
            self.readiness.wait_ready().await;
            info!("Supervisor shut down");
        }
        .instrument(lifecycle_span!(event = "shutdown"))
        .await
    }
}

#[async_trait]
impl BrokerLifecycle for ConnectionSupervisor {
    async fn connect(&self) -> SupervisorResult<()> {
        ConnectionSupervisor::connect(self).await
    }

    async fn reset(&self) -> SupervisorResult<()> {
        ConnectionSupervisor::reset(self).await
    }

    async fn shutdown(&self) {
        ConnectionSupervisor::shutdown(self).await
    }

    fn current_state(&self) -> SupervisorState {
        ConnectionSupervisor::current_state(self)
    }
}

async fn close_channel_quietly(channel: &dyn BrokerChannel) {
    if let Err(e) = channel.close().await {
        warn!(channel = channel.id(), error = %e, "Failed to close channel");
    }
}

async fn close_connection_quietly(connection: &dyn BrokerConnection) {
    if let Err(e) = connection.close().await {
        warn!(address = %connection.address(), error = %e, "Failed to close connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::InMemoryPropertySource;
    use crate::testing::mocks::{MockBroker, MockConnector};
    use crate::transport::BrokerError;

    fn build(config: SupervisorConfig) -> (ConnectionSupervisor, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::new(MockBroker::new()));
        let supervisor = ConnectionSupervisor::new(
            config,
            connector.clone(),
            Arc::new(InMemoryPropertySource::new()),
        )
        .unwrap();
        (supervisor, connector)
    }

    #[tokio::test]
    async fn test_connect_twice_is_noop() {
        let (supervisor, connector) = build(SupervisorConfig::test_config());

        supervisor.connect().await.unwrap();
        supervisor.connect().await.unwrap();

        assert_eq!(connector.attempts(), 1);
        assert_eq!(supervisor.current_state(), SupervisorState::Connected);
        assert!(supervisor.channel().await.is_some());
    }

    #[tokio::test]
    async fn test_handles_hidden_unless_connected() {
        let (supervisor, _connector) = build(SupervisorConfig::test_config());
        assert!(supervisor.channel().await.is_none());
        assert!(supervisor.connection().await.is_none());

        supervisor.connect().await.unwrap();
        assert!(supervisor.connection().await.is_some());

        supervisor.shutdown().await;
        assert!(supervisor.channel().await.is_none());
        assert!(supervisor.connection().await.is_none());
    }

    #[tokio::test]
    async fn test_recovery_listener_only_with_recovery() {
        let (supervisor, connector) = build(SupervisorConfig::test_config());
        supervisor.connect().await.unwrap();
        assert!(connector.last_connection().unwrap().has_recovery_listener());

        let mut config = SupervisorConfig::test_config();
        config.recovery.enabled = false;
        let (supervisor, connector) = build(config);
        supervisor.connect().await.unwrap();
        assert!(!connector.last_connection().unwrap().has_recovery_listener());
    }

    #[tokio::test]
    async fn test_connect_after_shutdown_rejected() {
        let (supervisor, connector) = build(SupervisorConfig::test_config());
        supervisor.shutdown().await;

        let err = supervisor.connect().await.unwrap_err();
        assert!(matches!(err, SupervisorError::ShutdownInProgress));
        assert_eq!(connector.attempts(), 0);
        assert_eq!(supervisor.current_state(), SupervisorState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_exchange_failure_closes_partial_connection() {
        let mut config = SupervisorConfig::test_config();
        config.recovery.enabled = false;
        let broker = MockBroker::new();
        broker.fail_declares_with("PRECONDITION_FAILED");
        let connector = Arc::new(MockConnector::new(broker));
        let supervisor = ConnectionSupervisor::new(
            config,
            connector.clone(),
            Arc::new(InMemoryPropertySource::new()),
        )
        .unwrap();

        let err = supervisor.connect().await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::ConnectFailed {
                attempts: 1,
                source: AttemptError::Exchange(_)
            }
        ));
        assert!(connector.last_connection().unwrap().is_closed());
        assert_eq!(supervisor.current_state(), SupervisorState::Disconnected);
    }

    #[tokio::test]
    async fn test_reset_is_noop_without_recovery() {
        let mut config = SupervisorConfig::test_config();
        config.recovery.enabled = false;
        let (supervisor, connector) = build(config);
        supervisor.connect().await.unwrap();

        supervisor.reset().await.unwrap();

        assert_eq!(connector.attempts(), 1);
        assert!(!connector.last_connection().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_reset_reconnects() {
        let (supervisor, connector) = build(SupervisorConfig::test_config());
        supervisor.connect().await.unwrap();
        let first = connector.last_connection().unwrap();

        supervisor.reset().await.unwrap();

        assert!(first.is_closed());
        assert_eq!(connector.attempts(), 2);
        assert_eq!(supervisor.current_state(), SupervisorState::Connected);
        let snapshot = supervisor.metrics().snapshot();
        assert_eq!(snapshot.is_connected, 1);
        assert_eq!(snapshot.reconnection_attempts_latest_batch, 1);
    }

    #[tokio::test]
    async fn test_close_failures_are_swallowed() {
        let (supervisor, connector) = build(SupervisorConfig::test_config());
        supervisor.connect().await.unwrap();
        connector.last_connection().unwrap().set_fail_close(true);

        supervisor.shutdown().await;

        assert_eq!(supervisor.current_state(), SupervisorState::ShuttingDown);
        assert_eq!(supervisor.metrics().snapshot().is_connected, 0);
    }

    #[tokio::test]
    async fn test_shutdown_without_connection_keeps_metrics() {
        let (supervisor, _connector) = build(SupervisorConfig::test_config());
        supervisor.shutdown().await;
        supervisor.shutdown().await;

        let snapshot = supervisor.metrics().snapshot();
        assert_eq!(snapshot.reconnection_attempts, 0);
        assert_eq!(snapshot.is_connected, 0);
    }

    #[tokio::test]
    async fn test_authentication_failure_retried() {
        let (supervisor, connector) = build(SupervisorConfig::test_config());
        connector.fail_next(
            1,
            BrokerError::Authentication("ACCESS_REFUSED".to_string()),
        );

        supervisor.connect().await.unwrap();
        assert_eq!(connector.attempts(), 2);
    }
}
