//! Factory and validator failures.

use std::error::Error as _;
use std::time::Duration;

use pretty_assertions::assert_eq;
use sluice::testing::{MockFactory, ToggleValidator};
use sluice::{AlwaysValid, Context, Error, Pool, PoolConfig};

fn config(core_size: usize, max_size: usize) -> PoolConfig {
    PoolConfig {
        name: "failure".to_string(),
        core_size,
        max_size,
        max_wait: Duration::from_secs(1),
        validate_while_idle: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn creation_failure_is_reported_and_not_retried() {
    let factory = MockFactory::new();
    let pool = Pool::start(config(0, 2), factory.clone(), AlwaysValid)
        .await
        .unwrap();
    factory.fail_creates(true);

    let err = pool.borrow(&Context::new()).await.unwrap_err();
    assert!(matches!(err, Error::Creation { .. }), "got {err:?}");
    assert!(err.is_retryable());
    assert_eq!(err.pool_name(), Some("failure"));
    assert!(
        err.source()
            .is_some_and(|source| source.to_string().contains("connection refused"))
    );
    assert_eq!(factory.create_failures(), 1, "one attempt, no retry loop");

    let stats = pool.stats();
    assert_eq!(stats.total, 0, "reserved slot released");
    assert_eq!(stats.creation_failures, 1);
    assert_eq!(stats.borrow_requests, 1);
    assert_eq!(stats.borrow_successes, 0);
}

#[tokio::test(start_paused = true)]
async fn destroyed_handle_lets_a_waiter_grow_the_pool() {
    let factory = MockFactory::new();
    let validator = ToggleValidator::new();
    let pool = Pool::start(config(0, 1), factory.clone(), validator.clone())
        .await
        .unwrap();
    let mut held = pool.borrow(&Context::new()).await.unwrap();
    let old = held.id();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.borrow(&Context::new()).await.map(|h| h.id()) }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.stats().waiting, 1);

    validator.set_valid(false);
    held.close().await.unwrap();
    validator.set_valid(true);

    let got = waiter.await.unwrap().unwrap();
    assert_ne!(got, old);
    assert_eq!(factory.created(), 2);
    assert_eq!(factory.closed_ids(), vec![1]);
    assert_eq!(pool.stats().validation_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn slow_probe_counts_as_invalid() {
    let factory = MockFactory::new();
    let validator = ToggleValidator::new();
    let pool = Pool::start(
        PoolConfig {
            validate_on_borrow: true,
            validation_timeout: Duration::from_millis(10),
            ..config(1, 1)
        },
        factory.clone(),
        validator.clone(),
    )
    .await
    .unwrap();
    validator.set_delay(Duration::from_secs(5));

    let handle = pool.borrow(&Context::new()).await.unwrap();
    assert_eq!(handle.id(), 2, "warm handle failed its probe and was replaced");
    assert_eq!(validator.probes(), 1);

    let stats = pool.stats();
    assert_eq!(stats.validation_failures, 1);
    assert_eq!(stats.destroyed, 1);
    assert_eq!(stats.total, 1);
    assert_eq!(factory.closed(), 1);
}

#[tokio::test]
async fn stale_idle_handle_is_probed_before_lending() {
    let validator = ToggleValidator::new();
    let pool = Pool::start(
        PoolConfig {
            validation_interval: Duration::ZERO,
            ..config(1, 1)
        },
        MockFactory::new(),
        validator.clone(),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let handle = pool.borrow(&Context::new()).await.unwrap();
    assert_eq!(validator.probes(), 1);
    drop(handle);
}

#[tokio::test]
async fn fresh_idle_handle_skips_the_probe() {
    let validator = ToggleValidator::new();
    let pool = Pool::start(config(1, 1), MockFactory::new(), validator.clone())
        .await
        .unwrap();

    let handle = pool.borrow(&Context::new()).await.unwrap();
    assert_eq!(validator.probes(), 0);
    drop(handle);
}

#[tokio::test]
async fn close_errors_are_swallowed() {
    let factory = MockFactory::new();
    let validator = ToggleValidator::new();
    let pool = Pool::start(config(0, 1), factory.clone(), validator.clone())
        .await
        .unwrap();
    factory.fail_closes(true);

    let mut handle = pool.borrow(&Context::new()).await.unwrap();
    validator.set_valid(false);
    handle.close().await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.destroyed, 1);
    assert_eq!(stats.total, 0);
    assert_eq!(factory.closed(), 1);
}

#[tokio::test]
async fn failed_replacement_leaves_pool_below_core() {
    let factory = MockFactory::new();
    let validator = ToggleValidator::new();
    let pool = Pool::start(config(1, 2), factory.clone(), validator.clone())
        .await
        .unwrap();

    let mut handle = pool.borrow(&Context::new()).await.unwrap();
    validator.set_valid(false);
    factory.fail_creates(true);
    handle.close().await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.creation_failures, 1);

    validator.set_valid(true);
    factory.fail_creates(false);
    let handle = pool.borrow(&Context::new()).await.unwrap();
    assert_eq!(pool.stats().total, 1);
    drop(handle);
}
