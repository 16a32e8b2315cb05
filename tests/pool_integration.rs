//! Connection pool and recovery integration tests
//!
//! These tests drive the pool through the in-memory transport, so no remote
//! endpoint is required.

use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;

use session_transport::config::{CircuitBreakerConfig, PoolConfig, Settings};
use session_transport::pool::{ConnectionPool, PoolError, Priority};
use session_transport::recovery::{
    CircuitBreakerRegistry, CircuitState, ErrorKind, RecoveryController, RetryConfig,
};
use session_transport::transport::{MemoryTransportFactory, TransportError};

struct TestPool {
    pool: Arc<ConnectionPool>,
    factory: MemoryTransportFactory,
    controller: Arc<RecoveryController>,
}

fn create_pool(max_pool_size: usize) -> TestPool {
    let factory = MemoryTransportFactory::new();
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 5,
        recovery_timeout_secs: 60,
    }));
    let controller = Arc::new(RecoveryController::new(breakers));
    let config = PoolConfig {
        max_pool_size,
        ..PoolConfig::default()
    };
    let retry = RetryConfig::default().with_max_attempts(1).without_jitter();

    let pool = Arc::new(ConnectionPool::new(
        config,
        retry,
        Arc::new(factory.clone()),
        controller.clone(),
    ));

    TestPool {
        pool,
        factory,
        controller,
    }
}

#[tokio::test(start_paused = true)]
async fn test_sixth_normal_acquire_rejected_at_capacity() {
    let env = create_pool(5);

    for i in 0..5 {
        assert_ok!(env.pool.acquire(&format!("s{}", i), Priority::Normal).await);
    }

    match env.pool.acquire("s5", Priority::Normal).await {
        Err(PoolError::Capacity { current, max }) => {
            assert_eq!(current, 5);
            assert_eq!(max, 5);
        }
        other => panic!("expected capacity error, got {:?}", other.map(|h| h.id())),
    }

    assert_eq!(env.pool.stats().total, 5);
    assert_eq!(env.factory.connect_attempts(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_critical_acquire_evicts_oldest() {
    let env = create_pool(5);

    for i in 0..5 {
        env.pool
            .acquire(&format!("s{}", i), Priority::Normal)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
    }

    let handle = assert_ok!(env.pool.acquire("s5", Priority::Critical).await);
    assert!(handle.is_connected());

    assert_eq!(env.pool.stats().total, 5);
    assert!(env.pool.current_id("s0").is_none());
    assert!(env.factory.latest("s0").unwrap().is_closed());
    for i in 1..=5 {
        assert!(env.pool.current_id(&format!("s{}", i)).is_some());
    }
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_after_threshold_and_recovers() {
    let env = create_pool(5);
    env.factory
        .set_failure(Some(TransportError::Connect("connection refused".into())));

    for _ in 0..5 {
        match env.pool.acquire("s1", Priority::Normal).await {
            Err(PoolError::EstablishFailed { kind, .. }) => assert_eq!(kind, ErrorKind::Network),
            other => panic!("expected establish failure, got {:?}", other.map(|h| h.id())),
        }
    }
    assert_eq!(env.factory.connect_attempts(), 5);

    let breakers = env.controller.breakers();
    assert_eq!(breakers.state("connect:s1"), CircuitState::Open);

    // Fails fast without touching the factory
    match env.pool.acquire("s1", Priority::Normal).await {
        Err(PoolError::CircuitOpen { retry_after, .. }) => {
            assert!(retry_after <= Duration::from_secs(60));
        }
        other => panic!("expected open circuit, got {:?}", other.map(|h| h.id())),
    }
    assert_eq!(env.factory.connect_attempts(), 5);

    // Other keys have their own breaker
    env.factory.set_failure(None);
    assert_ok!(env.pool.acquire("s2", Priority::Normal).await);

    tokio::time::advance(Duration::from_secs(60)).await;

    let handle = assert_ok!(env.pool.acquire("s1", Priority::Normal).await);
    assert!(handle.is_connected());
    assert_eq!(breakers.state("connect:s1"), CircuitState::Closed);
    assert_eq!(breakers.failure_count("connect:s1"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_reopens_circuit() {
    let env = create_pool(5);
    env.factory
        .set_failure(Some(TransportError::Timeout(Duration::from_secs(10))));

    for _ in 0..5 {
        assert!(env.pool.acquire("s1", Priority::Normal).await.is_err());
    }
    tokio::time::advance(Duration::from_secs(61)).await;

    // The half-open probe fails and the circuit opens again
    assert!(env.pool.acquire("s1", Priority::Normal).await.is_err());
    assert_eq!(env.factory.connect_attempts(), 6);
    assert_eq!(env.controller.breakers().state("connect:s1"), CircuitState::Open);

    match env.pool.acquire("s1", Priority::Normal).await {
        Err(e) => assert_eq!(e.code(), "CIRCUIT_OPEN"),
        Ok(_) => panic!("expected open circuit"),
    }
}

#[tokio::test]
async fn test_protocol_errors_do_not_open_circuit() {
    let env = create_pool(5);
    env.factory
        .set_failure(Some(TransportError::Protocol("unexpected handshake".into())));

    for _ in 0..8 {
        assert!(env.pool.acquire("s1", Priority::Normal).await.is_err());
    }

    assert_eq!(env.factory.connect_attempts(), 8);
    assert_eq!(env.controller.breakers().state("connect:s1"), CircuitState::Closed);
}

#[tokio::test]
async fn test_repeated_acquire_reuses_connection() {
    let env = create_pool(5);

    let first = env.pool.acquire("s1", Priority::Normal).await.unwrap();
    let second = env.pool.acquire("s1", Priority::Normal).await.unwrap();
    let third = env.pool.acquire("s1", Priority::High).await.unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(second.id(), third.id());
    assert_eq!(third.use_count(), first.use_count() + 2);
    assert_eq!(env.factory.connect_attempts(), 1);

    env.pool.release("s1", true).await;
    let fresh = env.pool.acquire("s1", Priority::Normal).await.unwrap();
    assert_ne!(fresh.id(), first.id());
}

#[tokio::test(start_paused = true)]
async fn test_capacity_never_exceeded_under_concurrency() {
    let env = create_pool(3);
    env.factory.set_connect_delay(Duration::from_millis(50));

    let mut tasks = Vec::new();
    for i in 0..12 {
        let pool = env.pool.clone();
        let key = format!("s{}", i % 6);
        tasks.push(tokio::spawn(async move {
            pool.acquire(&key, Priority::Normal).await
        }));
    }

    let mut succeeded = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }

    let stats = env.pool.stats();
    assert!(stats.total <= 3);
    assert_eq!(stats.pending, 0);
    assert!(succeeded >= 3);
    // One connect per key that got a slot
    assert_eq!(env.factory.connect_attempts(), stats.total);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_connect_frees_slot_for_next_acquire() {
    let env = create_pool(1);
    env.factory.set_connect_delay(Duration::from_secs(2));

    let gave_up =
        tokio::time::timeout(Duration::from_millis(100), env.pool.acquire("s1", Priority::Normal))
            .await;
    assert!(gave_up.is_err());

    let handle = assert_ok!(env.pool.acquire("s1", Priority::Normal).await);
    assert!(handle.is_connected());

    let stats = env.pool.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.pending, 0);
    // The abandoned connect never produced a transport
    assert_eq!(env.factory.transports().len(), 1);
    assert_eq!(env.factory.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_connect_stops_feeding_breaker() {
    let env = create_pool(1);
    env.factory.set_connect_delay(Duration::from_secs(2));
    env.factory
        .set_failure(Some(TransportError::Connect("connection refused".into())));

    for _ in 0..10 {
        let gave_up = tokio::time::timeout(
            Duration::from_millis(100),
            env.pool.acquire("s1", Priority::Critical),
        )
        .await;
        assert!(gave_up.is_err());
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    let breakers = env.controller.breakers();
    assert_eq!(breakers.failure_count("connect:s1"), 0);
    assert_eq!(breakers.state("connect:s1"), CircuitState::Closed);
    assert_eq!(env.pool.stats().pending, 0);
}

#[tokio::test]
async fn test_shutdown_rejects_new_acquires() {
    let env = create_pool(5);
    let handle = env.pool.acquire("s1", Priority::Normal).await.unwrap();

    env.pool.shutdown().await;

    assert!(!handle.is_connected());
    assert!(env.pool.is_shutting_down());
    assert!(matches!(
        env.pool.acquire("s1", Priority::Critical).await,
        Err(PoolError::ShuttingDown)
    ));
}

#[test]
fn test_zero_health_check_interval_rejected() {
    let mut settings = Settings::default();
    settings.pool.health_check_interval_secs = 0;
    assert!(settings.validate().is_err());

    settings.pool.health_check_interval_secs = 30;
    assert_ok!(settings.validate());
}
