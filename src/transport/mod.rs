//! Transport layer between the supervisor and the broker client library
//!
//! The supervisor never talks to a broker client directly. It sees connections
//! and channels through these traits so the production AMQP client and the
//! test doubles in [`crate::testing::mocks`] are interchangeable.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod amqp;

pub use amqp::{Address, BrokerEndpoint, ConnectPlan, LapinConnector, RecoverySettings};

/// Failures reported by the broker client
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("authentication rejected: {0}")]
    Authentication(String),
    #[error("channel error: {0}")]
    Channel(String),
    #[error("connection or channel already closed")]
    Closed,
}

/// Opens connections to a broker
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open one connection according to the plan.
    ///
    /// For an address list the addresses are tried in order and the first
    /// successful one wins.
    async fn connect(&self, plan: &ConnectPlan) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// An open broker connection
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new logical channel on this connection
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Close the connection. Also stops any background recovery.
    async fn close(&self) -> Result<(), BrokerError>;

    /// Address of the broker node this connection is attached to
    fn address(&self) -> String;

    /// Register the listener notified by the client's own recovery machinery
    fn register_recovery_listener(&self, listener: Arc<dyn RecoveryListener>);
}

/// A logical channel on a connection
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Check that an exchange exists without creating it.
    ///
    /// A failed check leaves the channel unusable.
    async fn exchange_declare_passive(&self, name: &str) -> Result<(), BrokerError>;

    /// Declare (create) an exchange
    async fn exchange_declare(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
        auto_delete: bool,
    ) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    /// Channel number, for logging
    fn id(&self) -> u16;
}

/// Notifications from the broker client's automatic recovery
#[async_trait::async_trait]
pub trait RecoveryListener: Send + Sync {
    /// The connection dropped; the client is recovering on its own.
    fn on_connection_lost(&self, reason: &str);

    /// The client re-established the connection and opened `channel` on it.
    async fn on_recovered(&self, channel: Arc<dyn BrokerChannel>);
}
