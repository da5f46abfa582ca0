//! Impure I/O operations for the AMQP transport
//!
//! This module handles all network communication through `lapin`, including
//! the background recovery task that re-dials a lost connection.

use super::connection::{redact_uri, ConnectPlan};
use crate::error::sanitize_message;
use crate::tls::{ClientIdentity, TlsContext};
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, RecoveryListener,
};
use async_trait::async_trait;
use lapin::options::ExchangeDeclareOptions;
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const REPLY_SUCCESS: u16 = 200;

/// Production [`BrokerConnector`] backed by `lapin`
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Self {
        Self
    }

    /// Dial a single URI, bounded by the plan's connection timeout
    async fn dial(uri: &str, plan: &ConnectPlan) -> Result<Connection, BrokerError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(plan.connection_name.clone().into());

        let attempt = async {
            match &plan.tls {
                Some(context) => {
                    Connection::connect_with_config(uri, properties, owned_tls_config(context))
                        .await
                }
                None => Connection::connect(uri, properties).await,
            }
        };

        match tokio::time::timeout(plan.connection_timeout, attempt).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => Err(connection_error(&e)),
            Err(_) => Err(BrokerError::Timeout(plan.connection_timeout)),
        }
    }

    /// Try every candidate URI in order; the first that answers wins
    async fn dial_any(plan: &ConnectPlan) -> Result<(Connection, String), BrokerError> {
        let mut last_error =
            BrokerError::Connection("no broker address configured".to_string());

        for uri in plan.candidate_uris() {
            let address = redact_uri(&uri);
            match Self::dial(&uri, plan).await {
                Ok(connection) => return Ok((connection, address)),
                Err(e) => {
                    warn!(address = %address, error = %e, "Broker address unreachable");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(&self, plan: &ConnectPlan) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let runtime = Handle::try_current()
            .map_err(|e| BrokerError::Connection(format!("no async runtime available: {e}")))?;

        let (connection, address) = Self::dial_any(plan).await?;
        info!(address = %address, "Connected to broker");

        Ok(Arc::new(AmqpConnection::new(
            connection,
            address,
            plan.clone(),
            runtime,
        )))
    }
}

/// State shared between a connection handle and its recovery task
struct RecoveryContext {
    plan: ConnectPlan,
    current: RwLock<Arc<Connection>>,
    address: RwLock<String>,
    listener: Mutex<Option<Arc<dyn RecoveryListener>>>,
    closed: AtomicBool,
    recovering: AtomicBool,
    close_tx: watch::Sender<bool>,
    runtime: Handle,
}

impl RecoveryContext {
    fn current(&self) -> Result<Arc<Connection>, BrokerError> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| BrokerError::Closed)
    }

    fn address(&self) -> String {
        self.address
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn listener(&self) -> Option<Arc<dyn RecoveryListener>> {
        self.listener.lock().ok().and_then(|slot| slot.clone())
    }

    fn install_error_hook(self: &Arc<Self>, connection: &Connection) {
        let context = Arc::downgrade(self);
        connection.on_error(move |err| {
            if let Some(context) = context.upgrade() {
                context.handle_connection_error(err.to_string());
            }
        });
    }

    fn swap_connection(&self, connection: Arc<Connection>, address: String) {
        if let Ok(mut current) = self.current.write() {
            *current = connection;
        }
        if let Ok(mut current) = self.address.write() {
            *current = address;
        }
    }

    /// Called from lapin's I/O thread when the connection fails
    fn handle_connection_error(self: &Arc<Self>, reason: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let reason = sanitize_message(&reason);

        if !self.plan.recovery.enabled {
            warn!(
                address = %self.address(),
                error = %reason,
                "Broker connection lost, automatic recovery disabled"
            );
            return;
        }

        if self
            .recovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Recovery already running, ignoring duplicate connection error");
            return;
        }

        warn!(
            address = %self.address(),
            error = %reason,
            "Broker connection lost, starting automatic recovery"
        );

        if let Some(listener) = self.listener() {
            listener.on_connection_lost(&reason);
        }

        let context = Arc::clone(self);
        self.runtime.spawn(async move {
            context.recover().await;
        });
    }

    /// Re-dial until a connection and channel are back, or the handle is closed
    async fn recover(self: Arc<Self>) {
        let mut closed_rx = self.close_tx.subscribe();
        let interval = self.plan.recovery.interval;
        let mut attempt = 0u32;

        loop {
            if !interruptible_sleep(&mut closed_rx, interval).await {
                info!("Connection closed, stopping automatic recovery");
                break;
            }

            attempt += 1;
            let (connection, address) = match LapinConnector::dial_any(&self.plan).await {
                Ok(dialed) => dialed,
                Err(e) => {
                    warn!(attempt, error = %e, "Automatic recovery attempt failed");
                    continue;
                }
            };

            if self.closed.load(Ordering::SeqCst) {
                let _ = connection.close(REPLY_SUCCESS, "Bye").await;
                break;
            }

            match connection.create_channel().await {
                Ok(channel) => {
                    let connection = Arc::new(connection);
                    self.swap_connection(Arc::clone(&connection), address.clone());
                    self.recovering.store(false, Ordering::SeqCst);
                    self.install_error_hook(&connection);

                    info!(attempt, address = %address, "Broker connection recovered");

                    if let Some(listener) = self.listener() {
                        listener
                            .on_recovered(Arc::new(AmqpChannel::new(channel)))
                            .await;
                    }
                    return;
                }
                Err(e) => {
                    error!(attempt, error = %channel_error(&e), "Recovered connection refused a channel");
                    let _ = connection.close(REPLY_SUCCESS, "Bye").await;
                }
            }
        }

        self.recovering.store(false, Ordering::SeqCst);
    }
}

/// Perform interruptible sleep with close monitoring.
/// Returns true if sleep completed, false if the connection was closed.
async fn interruptible_sleep(closed_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *closed_rx.borrow() {
        return false;
    }
    tokio::select! {
        changed = closed_rx.changed() => changed.is_ok() && !*closed_rx.borrow(),
        _ = tokio::time::sleep(delay) => true,
    }
}

/// A lapin connection plus the machinery that keeps it alive
pub struct AmqpConnection {
    context: Arc<RecoveryContext>,
}

impl AmqpConnection {
    fn new(connection: Connection, address: String, plan: ConnectPlan, runtime: Handle) -> Self {
        let (close_tx, _) = watch::channel(false);
        let connection = Arc::new(connection);

        let context = Arc::new(RecoveryContext {
            plan,
            current: RwLock::new(Arc::clone(&connection)),
            address: RwLock::new(address),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
            close_tx,
            runtime,
        });
        context.install_error_hook(&connection);

        Self { context }
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let connection = self.context.current()?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| channel_error(&e))?;

        debug!(channel = channel.id(), "Opened channel");
        Ok(Arc::new(AmqpChannel::new(channel)))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.context.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.context.close_tx.send(true);

        let connection = self.context.current()?;
        connection
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(|e| connection_error(&e))
    }

    fn address(&self) -> String {
        self.context.address()
    }

    fn register_recovery_listener(&self, listener: Arc<dyn RecoveryListener>) {
        if let Ok(mut slot) = self.context.listener.lock() {
            *slot = Some(listener);
        }
    }
}

/// A lapin channel
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn exchange_declare_passive(&self, name: &str) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            passive: true,
            ..ExchangeDeclareOptions::default()
        };
        // The broker ignores the kind of a passive declare
        self.channel
            .exchange_declare(name, ExchangeKind::Direct, options, FieldTable::default())
            .await
            .map_err(|e| channel_error(&e))
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
        auto_delete: bool,
    ) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            durable,
            auto_delete,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(name, exchange_kind(kind), options, FieldTable::default())
            .await
            .map_err(|e| channel_error(&e))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(|e| channel_error(&e))
    }

    fn id(&self) -> u16 {
        self.channel.id()
    }
}

/// Map a configured exchange type onto the lapin enum
pub fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind.to_ascii_lowercase().as_str() {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        _ => ExchangeKind::Custom(kind.to_string()),
    }
}

/// Convert a built TLS context into lapin's owned TLS settings
pub fn owned_tls_config(context: &TlsContext) -> OwnedTLSConfig {
    let mut tls = OwnedTLSConfig::default();
    tls.cert_chain = context.trust_chain_pem.clone();
    tls.identity = Some(match &context.identity {
        ClientIdentity::Pkcs12 { der, password } => OwnedIdentity::PKCS12 {
            der: der.clone(),
            password: password.clone(),
        },
        ClientIdentity::Pem { cert_pem, key_pem } => OwnedIdentity::PKCS8 {
            pem: cert_pem.clone(),
            key: key_pem.clone(),
        },
    });
    tls
}

fn is_auth_failure(text: &str) -> bool {
    text.contains("ACCESS_REFUSED") || text.to_ascii_lowercase().contains("authentication")
}

fn connection_error(error: &lapin::Error) -> BrokerError {
    let text = sanitize_message(&error.to_string());
    if is_auth_failure(&text) {
        BrokerError::Authentication(text)
    } else {
        BrokerError::Connection(text)
    }
}

fn channel_error(error: &lapin::Error) -> BrokerError {
    BrokerError::Channel(sanitize_message(&error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_mapping() {
        assert_eq!(exchange_kind("topic"), ExchangeKind::Topic);
        assert_eq!(exchange_kind("FANOUT"), ExchangeKind::Fanout);
        assert_eq!(exchange_kind("direct"), ExchangeKind::Direct);
        assert_eq!(exchange_kind("headers"), ExchangeKind::Headers);
        assert_eq!(
            exchange_kind("x-delayed-message"),
            ExchangeKind::Custom("x-delayed-message".to_string())
        );
    }

    #[test]
    fn test_auth_failure_detection() {
        assert!(is_auth_failure("ACCESS_REFUSED - Login was refused"));
        assert!(is_auth_failure("SASL Authentication failed"));
        assert!(!is_auth_failure("Connection refused (os error 111)"));
    }

    #[test]
    fn test_owned_tls_config_carries_identity_and_trust() {
        let context = TlsContext {
            protocol: crate::tls::TlsProtocol::TlsV12,
            identity: ClientIdentity::Pkcs12 {
                der: vec![0x30, 0x82],
                password: "changeit".to_string(),
            },
            trust_chain_pem: Some("-----BEGIN CERTIFICATE-----\n".to_string()),
            key_manager_algorithm: "PKIX".to_string(),
            trust_manager_algorithm: "PKIX".to_string(),
        };

        let owned = owned_tls_config(&context);
        assert!(owned.cert_chain.is_some());
        assert!(matches!(
            owned.identity,
            Some(OwnedIdentity::PKCS12 { ref password, .. }) if password == "changeit"
        ));
    }

    #[test]
    fn test_owned_tls_config_passes_pem_identity() {
        let pem = std::fs::read(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/client.pem"))
            .unwrap();
        let context = TlsContext {
            protocol: crate::tls::TlsProtocol::Tls,
            identity: ClientIdentity::Pem {
                cert_pem: pem.clone(),
                key_pem: pem.clone(),
            },
            trust_chain_pem: None,
            key_manager_algorithm: "PKIX".to_string(),
            trust_manager_algorithm: "PKIX".to_string(),
        };

        let owned = owned_tls_config(&context);
        assert_eq!(
            owned.identity,
            Some(OwnedIdentity::PKCS8 {
                pem: pem.clone(),
                key: pem,
            })
        );
    }

    #[tokio::test]
    async fn test_interruptible_sleep_stops_on_close() {
        let (close_tx, mut close_rx) = watch::channel(false);
        let sleeper = tokio::spawn(async move {
            interruptible_sleep(&mut close_rx, Duration::from_secs(30)).await
        });

        close_tx.send(true).unwrap();
        let completed = tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(!completed);
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_fails_fast() {
        use crate::transport::amqp::connection::{Address, BrokerEndpoint};

        let mut plan =
            ConnectPlan::for_endpoint(BrokerEndpoint::Addresses(vec![Address::new("127.0.0.1", 1)]));
        plan.connection_timeout = Duration::from_secs(2);

        let result = LapinConnector::new().connect(&plan).await;
        assert!(result.is_err());
    }
}
