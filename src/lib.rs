//! AMQP connection supervisor
//!
//! Establishes, monitors and re-establishes a broker connection and its
//! channel. Credentials are resolved per attempt with property-source
//! overrides, TLS material is loaded from key and trust stores, and the
//! configured exchange is ensured before traffic flows.
//!
//! # Overview
//!
//! - [`credentials`] - Credential resolution with external property sources
//! - [`tls`] - TLS context built from key/trust store configuration
//! - [`exchange`] - Passive check, then declare, of the target exchange
//! - [`supervisor`] - Bounded connect/retry loop, reset and shutdown
//! - [`observability`] - Logging, connectivity metrics and health endpoint
//! - [`transport`] - Broker client abstraction and the lapin adapter
//!
//! # Quick Start
//!
//! ```rust
//! use amqp_supervisor::config::SupervisorConfig;
//! use amqp_supervisor::credentials::InMemoryPropertySource;
//! use amqp_supervisor::supervisor::{ConnectionSupervisor, SupervisorState};
//! use amqp_supervisor::testing::{MockBroker, MockConnector};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = SupervisorConfig::from_toml_str(
//!     r#"
//! [broker]
//! hosts = ["localhost:5672"]
//!
//! [exchange]
//! name = "events"
//! kind = "topic"
//! "#,
//! )
//! .unwrap();
//!
//! let broker = MockBroker::new();
//! let supervisor = ConnectionSupervisor::new(
//!     config,
//!     Arc::new(MockConnector::new(broker.clone())),
//!     Arc::new(InMemoryPropertySource::new()),
//! )
//! .unwrap();
//!
//! supervisor.connect().await.unwrap();
//! assert_eq!(supervisor.current_state(), SupervisorState::Connected);
//! assert!(broker.exchange("events").is_some());
//! # });
//! ```

pub mod config;
pub mod credentials;
pub mod error;
pub mod exchange;
pub mod observability;
pub mod supervisor;
pub mod testing;
pub mod tls;
pub mod transport;

pub use config::SupervisorConfig;
pub use credentials::{CredentialResolver, Credentials, PropertySource};
pub use error::{SupervisorError, SupervisorResult};
pub use exchange::{ExchangeInitializer, ExchangeSpec};
pub use observability::{ConnectivityMetrics, ConnectivitySnapshot};
pub use supervisor::{BrokerLifecycle, ConnectionSupervisor, ShutdownReadiness, SupervisorState};
pub use tls::{TlsContext, TlsContextBuilder};
pub use transport::LapinConnector;
