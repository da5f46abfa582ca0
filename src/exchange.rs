//! Exchange bootstrap
//!
//! Makes sure the configured exchange exists before traffic flows: a passive
//! check first, and on failure an active declare on a fresh channel.

use crate::transport::{BrokerChannel, BrokerConnection, BrokerError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The exchange to ensure. An empty name selects the broker's default exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// Non-durable, auto-delete exchange
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            durable: false,
            auto_delete: true,
        }
    }

    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }
}

impl Default for ExchangeSpec {
    fn default() -> Self {
        Self::new("", "direct")
    }
}

/// How `ensure` found or created the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    /// Empty name, nothing checked
    Default,
    /// Passive check found it
    Existing,
    /// Created on a fresh channel
    Declared,
}

/// Result of [`ExchangeInitializer::ensure`]
pub struct EnsuredExchange {
    /// Channel to keep using; replaced when the passive check failed
    pub channel: Arc<dyn BrokerChannel>,
    pub status: ExchangeStatus,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("failed to declare exchange '{exchange}' of type '{kind}': {source}")]
    Declare {
        exchange: String,
        kind: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to open a channel for exchange declaration: {source}")]
    ChannelOpen {
        #[source]
        source: BrokerError,
    },
}

#[derive(Debug, Clone)]
pub struct ExchangeInitializer {
    spec: ExchangeSpec,
}

impl ExchangeInitializer {
    pub fn new(spec: ExchangeSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &ExchangeSpec {
        &self.spec
    }

    pub fn using_default_exchange(&self) -> bool {
        self.spec.is_default()
    }

    /// Ensure the exchange exists, returning the channel to use afterwards.
    ///
    /// Safe to call repeatedly: an existing exchange is only checked, never
    /// declared again.
    pub async fn ensure(
        &self,
        connection: &dyn BrokerConnection,
        channel: Arc<dyn BrokerChannel>,
    ) -> Result<EnsuredExchange, ExchangeError> {
        if self.spec.is_default() {
            debug!("Using default exchange, skipping declaration");
            return Ok(EnsuredExchange {
                channel,
                status: ExchangeStatus::Default,
            });
        }

        let name = &self.spec.name;
        match channel.exchange_declare_passive(name).await {
            Ok(()) => {
                debug!(exchange = %name, "Exchange exists");
                return Ok(EnsuredExchange {
                    channel,
                    status: ExchangeStatus::Existing,
                });
            }
            Err(e) => {
                warn!(
                    exchange = %name,
                    channel = channel.id(),
                    error = %e,
                    "Passive exchange check failed, declaring on a new channel"
                );
            }
        }

        // The failed passive check closed the old channel
        drop(channel);
        let channel = connection
            .create_channel()
            .await
            .map_err(|source| ExchangeError::ChannelOpen { source })?;

        channel
            .exchange_declare(
                name,
                &self.spec.kind,
                self.spec.durable,
                self.spec.auto_delete,
            )
            .await
            .map_err(|source| ExchangeError::Declare {
                exchange: name.clone(),
                kind: self.spec.kind.clone(),
                source,
            })?;

        info!(
            exchange = %name,
            kind = %self.spec.kind,
            durable = self.spec.durable,
            auto_delete = self.spec.auto_delete,
            "Exchange declared"
        );

        Ok(EnsuredExchange {
            channel,
            status: ExchangeStatus::Declared,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{DeclaredExchange, MockBroker};
    use crate::transport::BrokerConnection;

    #[tokio::test]
    async fn test_default_exchange_is_untouched() {
        let broker = MockBroker::new();
        let connection = broker.connection("h1:5672");
        let channel = connection.create_channel().await.unwrap();
        let initializer = ExchangeInitializer::new(ExchangeSpec::default());

        let ensured = initializer
            .ensure(connection.as_ref(), channel.clone())
            .await
            .unwrap();

        assert_eq!(ensured.status, ExchangeStatus::Default);
        assert_eq!(ensured.channel.id(), channel.id());
        assert_eq!(broker.passive_checks(), 0);
        assert!(initializer.using_default_exchange());
    }

    #[tokio::test]
    async fn test_existing_exchange_keeps_channel() {
        let broker = MockBroker::new().with_exchange("events", "topic");
        let connection = broker.connection("h1:5672");
        let channel = connection.create_channel().await.unwrap();
        let initializer = ExchangeInitializer::new(ExchangeSpec::new("events", "topic"));

        for _ in 0..2 {
            let ensured = initializer
                .ensure(connection.as_ref(), channel.clone())
                .await
                .unwrap();
            assert_eq!(ensured.status, ExchangeStatus::Existing);
            assert_eq!(ensured.channel.id(), channel.id());
        }

        assert_eq!(broker.declarations("events"), 0);
        assert_eq!(connection.channels_opened(), 1);
    }

    #[tokio::test]
    async fn test_missing_exchange_declared_once_on_new_channel() {
        let broker = MockBroker::new();
        let connection = broker.connection("h1:5672");
        let channel = connection.create_channel().await.unwrap();
        let initializer = ExchangeInitializer::new(ExchangeSpec::new("events", "topic"));

        let ensured = initializer
            .ensure(connection.as_ref(), channel.clone())
            .await
            .unwrap();

        assert_eq!(ensured.status, ExchangeStatus::Declared);
        assert_ne!(ensured.channel.id(), channel.id());
        assert_eq!(broker.declarations("events"), 1);
        assert_eq!(
            broker.exchange("events"),
            Some(DeclaredExchange {
                name: "events".to_string(),
                kind: "topic".to_string(),
                durable: false,
                auto_delete: true,
            })
        );

        // Second call finds it
        let again = initializer
            .ensure(connection.as_ref(), ensured.channel)
            .await
            .unwrap();
        assert_eq!(again.status, ExchangeStatus::Existing);
        assert_eq!(broker.declarations("events"), 1);
    }

    #[tokio::test]
    async fn test_declare_failure_propagates() {
        let broker = MockBroker::new();
        broker.fail_declares_with("PRECONDITION_FAILED - inequivalent arg 'type'");
        let connection = broker.connection("h1:5672");
        let channel = connection.create_channel().await.unwrap();
        let initializer = ExchangeInitializer::new(ExchangeSpec::new("events", "topic"));

        let err = initializer
            .ensure(connection.as_ref(), channel)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, ExchangeError::Declare { ref exchange, .. } if exchange == "events"));
        assert!(err.to_string().contains("PRECONDITION_FAILED"));
    }

    #[tokio::test]
    async fn test_replacement_channel_failure() {
        let broker = MockBroker::new();
        let connection = broker.connection("h1:5672");
        let channel = connection.create_channel().await.unwrap();
        connection.set_fail_channel(true);
        let initializer = ExchangeInitializer::new(ExchangeSpec::new("events", "topic"));

        let err = initializer
            .ensure(connection.as_ref(), channel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExchangeError::ChannelOpen { .. }));
    }
}
