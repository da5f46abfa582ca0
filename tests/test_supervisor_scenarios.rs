//! Connect, retry, reset and shutdown behavior of the connection supervisor
//!
//! Every scenario runs against the in-process mock broker.


use amqp_supervisor::error::{AttemptError, SupervisorError};
use amqp_supervisor::supervisor::{BrokerLifecycle, ShutdownReadiness, SupervisorState};
use amqp_supervisor::testing::MockBroker;
use amqp_supervisor::transport::{BrokerEndpoint, BrokerError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_helpers::{config_with, harness, harness_with_broker, test_config};
use tokio::time::timeout;

fn refused() -> BrokerError {
    BrokerError::Connection("Connection refused".to_string())
}

#[tokio::test]
async fn test_connect_succeeds_on_third_attempt() {
    let h = harness(test_config());
    h.connector.fail_next(2, refused());

    let start = Instant::now();
    h.supervisor.connect().await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(h.connector.attempts(), 3);
    assert!(
        elapsed >= Duration::from_millis(100),
        "two retry delays of 50ms expected, got {elapsed:?}"
    );
    assert_eq!(h.supervisor.current_state(), SupervisorState::Connected);

    let snapshot = h.supervisor.metrics().snapshot();
    assert_eq!(snapshot.is_connected, 1);
    assert_eq!(snapshot.reconnection_attempts, 3);
    assert_eq!(snapshot.reconnection_attempts_latest_batch, 3);
}

#[tokio::test]
async fn test_single_attempt_without_recovery() {
    let config = config_with(
        r#"
[recovery]
enabled = false
interval_ms = 5000
"#,
    );
    let h = harness(config);
    h.connector.fail_always(Some(refused()));

    let start = Instant::now();
    let err = h.supervisor.connect().await.unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(h.connector.attempts(), 1);
    match err {
        SupervisorError::ConnectFailed { attempts, source } => {
            assert_eq!(attempts, 1);
            assert!(matches!(source, AttemptError::Broker(BrokerError::Connection(_))));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.supervisor.current_state(), SupervisorState::Disconnected);
    assert!(h.supervisor.channel().await.is_none());
}

#[tokio::test]
async fn test_unreadable_key_store_fails_before_dialing() {
    let config = config_with(
        r#"
[recovery]
enabled = true
interval_ms = 50

[tls]
enabled = true

[tls.key_store]
path = "/nonexistent/client.p12"
password = "changeit"

[tls.trust_store]
path = "/nonexistent/ca.pem"
"#,
    );
    let h = harness(config);

    let err = h.supervisor.connect().await.unwrap_err();

    assert!(matches!(err, SupervisorError::SecurityConfig(_)));
    assert!(!err.is_retryable());
    assert_eq!(h.connector.attempts(), 0);
    assert_eq!(h.supervisor.metrics().snapshot().reconnection_attempts, 0);
    assert_eq!(h.supervisor.current_state(), SupervisorState::Disconnected);
}

fn tls_config(key_store_password: &str) -> String {
    let fixtures = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");
    format!(
        r#"
[recovery]
enabled = true
interval_ms = 50

[tls]
enabled = true

[tls.key_store]
path = "{fixtures}/client.p12"
password = "{key_store_password}"

[tls.trust_store]
path = "{fixtures}/ca.pem"
"#
    )
}

#[tokio::test]
async fn test_wrong_key_store_password_fails_before_dialing() {
    let h = harness(config_with(&tls_config("wrong")));

    let err = h.supervisor.connect().await.unwrap_err();

    assert!(matches!(err, SupervisorError::SecurityConfig(_)));
    assert_eq!(h.connector.attempts(), 0);
    assert_eq!(h.supervisor.current_state(), SupervisorState::Disconnected);
}

#[tokio::test]
async fn test_valid_key_store_dials_amqps() {
    let h = harness(config_with(&tls_config("changeit")));

    h.supervisor.connect().await.unwrap();

    let plan = &h.connector.plans()[0];
    assert!(plan.tls.is_some());
    assert!(plan.candidate_uris()[0].starts_with("amqps://"));
}

#[tokio::test]
async fn test_missing_key_store_path_rejected_at_construction() {
    let result = amqp_supervisor::config::SupervisorConfig::from_toml_str(
        r#"
[tls]
enabled = true

[tls.key_store]
password = "changeit"

[tls.trust_store]
path = "ca.pem"
"#,
    );

    assert!(result.is_err());
}

#[tokio::test]
async fn test_existing_exchange_is_not_redeclared() {
    let broker = MockBroker::new().with_exchange("events", "topic");
    let h = harness_with_broker(test_config(), broker);

    h.supervisor.connect().await.unwrap();

    assert_eq!(h.broker.passive_checks(), 1);
    assert_eq!(h.broker.declarations("events"), 0);
    assert_eq!(h.connector.last_connection().unwrap().channels_opened(), 1);
}

#[tokio::test]
async fn test_missing_exchange_declared_once_across_reset() {
    let h = harness(test_config());

    h.supervisor.connect().await.unwrap();

    let exchange = h.broker.exchange("events").unwrap();
    assert_eq!(exchange.kind, "topic");
    assert!(!exchange.durable);
    assert!(exchange.auto_delete);
    assert_eq!(h.broker.declarations("events"), 1);
    // The failed passive check poisons the first channel
    assert_eq!(h.connector.last_connection().unwrap().channels_opened(), 2);

    h.supervisor.reset().await.unwrap();

    assert_eq!(h.broker.declarations("events"), 1);
    assert_eq!(h.broker.passive_checks(), 2);
}

#[tokio::test]
async fn test_default_exchange_skips_broker_calls() {
    let config = amqp_supervisor::config::SupervisorConfig::from_toml_str(
        r#"
[broker]
hosts = ["h1"]
"#,
    )
    .unwrap();
    let h = harness(config);

    h.supervisor.connect().await.unwrap();

    assert!(h.supervisor.using_default_exchange());
    assert_eq!(h.broker.passive_checks(), 0);
    assert!(h.supervisor.channel().await.is_some());
}

#[tokio::test]
async fn test_plan_carries_endpoint_and_settings() {
    let config = config_with(
        r#"
[recovery]
enabled = true
interval_ms = 50
"#,
    );
    let h = harness(config);

    h.supervisor.connect().await.unwrap();

    let plan = &h.connector.plans()[0];
    match &plan.endpoint {
        BrokerEndpoint::Addresses(addresses) => {
            assert_eq!(addresses.len(), 2);
            assert_eq!(addresses[0].host, "h1");
            assert_eq!(addresses[1].port, 5673);
        }
        other => panic!("unexpected endpoint: {other:?}"),
    }
    assert!(plan.tls.is_none());
    assert!(plan.recovery.enabled);
    assert_eq!(plan.recovery.interval, Duration::from_millis(50));
}

#[tokio::test]
async fn test_shutdown_interrupts_retry_sleep() {
    let config = config_with(
        r#"
[recovery]
enabled = true
interval_ms = 10000
"#,
    );
    let h = harness(config);
    h.connector.fail_always(Some(refused()));

    let connecting = {
        let supervisor = Arc::clone(&h.supervisor);
        tokio::spawn(async move { supervisor.connect().await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.supervisor.shutdown().await;

    let result = timeout(Duration::from_secs(1), connecting)
        .await
        .expect("connect should stop promptly after shutdown")
        .unwrap();

    assert!(matches!(result, Err(SupervisorError::ShutdownInProgress)));
    assert_eq!(h.connector.attempts(), 1);
    assert_eq!(h.supervisor.current_state(), SupervisorState::ShuttingDown);
}

#[tokio::test]
async fn test_shutdown_releases_handles_and_rejects_connect() {
    let h = harness(test_config());
    h.supervisor.connect().await.unwrap();
    let connection = h.connector.last_connection().unwrap();

    h.supervisor.shutdown().await;

    assert!(connection.is_closed());
    assert!(h.supervisor.channel().await.is_none());
    assert_eq!(h.supervisor.metrics().snapshot().is_connected, 0);

    let err = h.supervisor.connect().await.unwrap_err();
    assert!(matches!(err, SupervisorError::ShutdownInProgress));
    assert!(matches!(
        h.supervisor.reset().await,
        Err(SupervisorError::ShutdownInProgress)
    ));
}

#[tokio::test]
async fn test_shutdown_waits_for_readiness() {
    let h = harness(test_config());
    let readiness = ShutdownReadiness::new(false);
    let supervisor = Arc::new(
        amqp_supervisor::supervisor::ConnectionSupervisor::new(
            test_config(),
            h.connector.clone(),
            h.properties.clone(),
        )
        .unwrap()
        .with_readiness(readiness.clone()),
    );
    supervisor.connect().await.unwrap();

    let shutting_down = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.shutdown().await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!shutting_down.is_finished());
    assert_eq!(supervisor.current_state(), SupervisorState::ShuttingDown);

    readiness.set_ready(true);
    timeout(Duration::from_secs(1), shutting_down)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_reset_replaces_connection() {
    let h = harness(test_config());
    h.supervisor.connect().await.unwrap();
    let first = h.connector.last_connection().unwrap();

    h.supervisor.reset().await.unwrap();

    let second = h.connector.last_connection().unwrap();
    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(h.connector.connections().len(), 2);
    assert_eq!(h.supervisor.current_state(), SupervisorState::Connected);
}

#[tokio::test]
async fn test_state_changes_are_published() {
    let h = harness(test_config());
    let mut states = h.supervisor.subscribe_state();
    assert_eq!(*states.borrow_and_update(), SupervisorState::Disconnected);

    h.supervisor.connect().await.unwrap();

    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), SupervisorState::Connected);
}

#[tokio::test]
async fn test_lifecycle_trait_object() {
    let h = harness(test_config());
    let lifecycle: Arc<dyn BrokerLifecycle> = h.supervisor.clone();

    lifecycle.connect().await.unwrap();
    assert_eq!(lifecycle.current_state(), SupervisorState::Connected);

    lifecycle.shutdown().await;
    assert_eq!(lifecycle.current_state(), SupervisorState::ShuttingDown);
}

#[tokio::test]
async fn test_concurrent_connect_dials_once() {
    let h = harness(test_config());
    h.connector
        .set_connect_delay(Some(Duration::from_millis(50)));

    let a = {
        let supervisor = Arc::clone(&h.supervisor);
        tokio::spawn(async move { supervisor.connect().await })
    };
    let b = {
        let supervisor = Arc::clone(&h.supervisor);
        tokio::spawn(async move { supervisor.connect().await })
    };

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();
    assert_eq!(h.connector.attempts(), 1);
}
