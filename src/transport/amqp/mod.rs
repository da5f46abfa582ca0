//! AMQP 0-9-1 transport backed by `lapin`
//!
//! # Architecture
//!
//! - [`connection`] - Pure endpoint parsing, URI construction and connect plans
//! - [`client`] - Impure I/O: the lapin adapter and its background recovery task
//!
//! # Usage
//!
//! ```rust,no_run
//! use amqp_supervisor::transport::{BrokerConnector, ConnectPlan, LapinConnector};
//! use amqp_supervisor::transport::amqp::{Address, BrokerEndpoint};
//!
//! # tokio_test::block_on(async {
//! let plan = ConnectPlan::for_endpoint(BrokerEndpoint::Addresses(vec![Address::new(
//!     "localhost", 5672,
//! )]));
//! let connection = LapinConnector::new().connect(&plan).await?;
//! let channel = connection.create_channel().await?;
//! channel.exchange_declare("events", "topic", false, true).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;

pub use client::{AmqpChannel, AmqpConnection, LapinConnector};
pub use connection::{Address, BrokerEndpoint, ConnectPlan, RecoverySettings};
