//! Mock implementations for testing
//!
//! Provides an in-process broker with mock connector, connection and channel
//! implementations so the supervisor can be exercised without RabbitMQ.

use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, ConnectPlan, RecoveryListener,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An exchange as the mock broker recorded it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredExchange {
    pub name: String,
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, DeclaredExchange>,
    declarations: HashMap<String, usize>,
    passive_checks: usize,
    declare_failure: Option<String>,
}

/// Shared in-memory broker state
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    next_channel_id: Arc<AtomicU16>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker that already has `name`
    pub fn with_exchange(self, name: &str, kind: &str) -> Self {
        self.add_exchange(name, kind);
        self
    }

    pub fn add_exchange(&self, name: &str, kind: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.exchanges.insert(
                name.to_string(),
                DeclaredExchange {
                    name: name.to_string(),
                    kind: kind.to_string(),
                    durable: false,
                    auto_delete: true,
                },
            );
        }
    }

    /// Drop an exchange, as an auto-delete exchange is after a partition
    pub fn remove_exchange(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.exchanges.remove(name);
        }
    }

    pub fn exchange(&self, name: &str) -> Option<DeclaredExchange> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.exchanges.get(name).cloned())
    }

    /// Number of active declares of `name`
    pub fn declarations(&self, name: &str) -> usize {
        self.state
            .lock()
            .map(|state| state.declarations.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn passive_checks(&self) -> usize {
        self.state.lock().map(|s| s.passive_checks).unwrap_or(0)
    }

    /// Make every active declare fail with `message`
    pub fn fail_declares_with(&self, message: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.declare_failure = Some(message.to_string());
        }
    }

    pub fn clear_declare_failure(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.declare_failure = None;
        }
    }

    /// Open a connection directly, bypassing any connector
    pub fn connection(&self, address: &str) -> Arc<MockConnection> {
        Arc::new(MockConnection::new(self.clone(), address))
    }

    fn next_channel(&self) -> MockChannel {
        let id = self.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1;
        MockChannel::new(self.clone(), id)
    }
}

/// Mock connection
pub struct MockConnection {
    broker: MockBroker,
    address: String,
    closed: AtomicBool,
    fail_close: AtomicBool,
    fail_channel: AtomicBool,
    channels_opened: AtomicUsize,
    listener: Mutex<Option<Arc<dyn RecoveryListener>>>,
}

impl MockConnection {
    pub fn new(broker: MockBroker, address: &str) -> Self {
        Self {
            broker,
            address: address.to_string(),
            closed: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            fail_channel: AtomicBool::new(false),
            channels_opened: AtomicUsize::new(0),
            listener: Mutex::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> usize {
        self.channels_opened.load(Ordering::SeqCst)
    }

    pub fn has_recovery_listener(&self) -> bool {
        self.listener.lock().map(|l| l.is_some()).unwrap_or(false)
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_channel(&self, fail: bool) {
        self.fail_channel.store(fail, Ordering::SeqCst);
    }

    fn listener(&self) -> Option<Arc<dyn RecoveryListener>> {
        self.listener.lock().ok().and_then(|l| l.clone())
    }

    /// Fire the client's "connection lost" notification.
    /// A closed connection fires nothing.
    pub fn simulate_connection_lost(&self, reason: &str) {
        if self.is_closed() {
            return;
        }
        if let Some(listener) = self.listener() {
            listener.on_connection_lost(reason);
        }
    }

    /// Fire the client's "recovery completed" notification with a fresh channel
    pub async fn simulate_recovery(&self) {
        if self.is_closed() {
            return;
        }
        let channel: Arc<dyn BrokerChannel> = Arc::new(self.broker.next_channel());
        self.channels_opened.fetch_add(1, Ordering::SeqCst);
        if let Some(listener) = self.listener() {
            listener.on_recovered(channel).await;
        }
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        if self.fail_channel.load(Ordering::SeqCst) {
            return Err(BrokerError::Channel("Mock channel failure".to_string()));
        }
        self.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.broker.next_channel()))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("Mock close failure".to_string()));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn register_recovery_listener(&self, listener: Arc<dyn RecoveryListener>) {
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(listener);
        }
    }
}

/// Mock channel. A failed passive check closes it, as a real broker does.
pub struct MockChannel {
    broker: MockBroker,
    id: u16,
    closed: AtomicBool,
}

impl MockChannel {
    fn new(broker: MockBroker, id: u16) -> Self {
        Self {
            broker,
            id,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn fail(&self, message: String) -> BrokerError {
        self.closed.store(true, Ordering::SeqCst);
        BrokerError::Channel(message)
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn exchange_declare_passive(&self, name: &str) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let exists = match self.broker.state.lock() {
            Ok(mut state) => {
                state.passive_checks += 1;
                state.exchanges.contains_key(name)
            }
            Err(_) => false,
        };
        if exists {
            Ok(())
        } else {
            Err(self.fail(format!("NOT_FOUND - no exchange '{name}' in vhost '/'")))
        }
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
        auto_delete: bool,
    ) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let outcome = match self.broker.state.lock() {
            Ok(mut state) => {
                if let Some(message) = state.declare_failure.clone() {
                    Err(message)
                } else if state
                    .exchanges
                    .get(name)
                    .is_some_and(|existing| existing.kind != kind)
                {
                    Err(format!(
                        "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}'"
                    ))
                } else {
                    state
                        .exchanges
                        .entry(name.to_string())
                        .or_insert_with(|| DeclaredExchange {
                            name: name.to_string(),
                            kind: kind.to_string(),
                            durable,
                            auto_delete,
                        });
                    *state.declarations.entry(name.to_string()).or_insert(0) += 1;
                    Ok(())
                }
            }
            Err(e) => Err(e.to_string()),
        };

        outcome.map_err(|message| self.fail(message))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn id(&self) -> u16 {
        self.id
    }
}

/// Mock connector with scripted failures
pub struct MockConnector {
    broker: MockBroker,
    script: Mutex<VecDeque<BrokerError>>,
    fail_always: Mutex<Option<BrokerError>>,
    connect_delay: Mutex<Option<Duration>>,
    attempts: AtomicU32,
    plans: Mutex<Vec<ConnectPlan>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    pub fn new(broker: MockBroker) -> Self {
        Self {
            broker,
            script: Mutex::new(VecDeque::new()),
            fail_always: Mutex::new(None),
            connect_delay: Mutex::new(None),
            attempts: AtomicU32::new(0),
            plans: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `count` attempts with `error`, then succeed
    pub fn fail_next(&self, count: usize, error: BrokerError) {
        if let Ok(mut script) = self.script.lock() {
            script.extend(std::iter::repeat(error).take(count));
        }
    }

    /// Fail every attempt with `error` until cleared
    pub fn fail_always(&self, error: Option<BrokerError>) {
        if let Ok(mut slot) = self.fail_always.lock() {
            *slot = error;
        }
    }

    /// Delay every attempt, to simulate a slow handshake
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.connect_delay.lock() {
            *slot = delay;
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Every plan passed to `connect`, in order
    pub fn plans(&self) -> Vec<ConnectPlan> {
        self.plans.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Every connection handed out, in order
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.connections().last().cloned()
    }
}

#[async_trait]
impl BrokerConnector for MockConnector {
    async fn connect(&self, plan: &ConnectPlan) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut plans) = self.plans.lock() {
            plans.push(plan.clone());
        }

        let delay = self.connect_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let always = self.fail_always.lock().ok().and_then(|e| e.clone());
        if let Some(error) = always {
            return Err(error);
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        if let Some(error) = scripted {
            return Err(error);
        }

        let address = plan
            .candidate_uris()
            .first()
            .map(|uri| crate::transport::amqp::connection::redact_uri(uri))
            .unwrap_or_default();
        let connection = self.broker.connection(&address);
        if let Ok(mut connections) = self.connections.lock() {
            connections.push(Arc::clone(&connection));
        }
        Ok(connection as Arc<dyn BrokerConnection>)
    }
}
