//! Background sweeps: idle reaping, leak detection, idle validation.

use std::time::Duration;

use pretty_assertions::assert_eq;
use sluice::testing::{MockFactory, ToggleValidator};
use sluice::{AlwaysValid, Context, DestroyReason, Pool, PoolConfig, PoolEvent};

fn config(core_size: usize, max_size: usize) -> PoolConfig {
    PoolConfig {
        name: "maintenance".to_string(),
        core_size,
        max_size,
        max_wait: Duration::from_secs(1),
        validate_while_idle: false,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn reaper_shrinks_back_to_core() {
    let factory = MockFactory::new();
    let pool = Pool::start(
        PoolConfig {
            max_idle_time: Duration::from_secs(1),
            reap_interval: Duration::from_millis(500),
            ..config(1, 3)
        },
        factory.clone(),
        AlwaysValid,
    )
    .await
    .unwrap();

    let ctx = Context::new();
    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.borrow(&ctx).await.unwrap());
    }
    for mut handle in held {
        handle.close().await.unwrap();
    }
    assert_eq!(pool.stats().idle, 3);

    tokio::time::sleep(Duration::from_secs(2)).await;

    let stats = pool.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.destroyed, 2);
    assert_eq!(factory.closed(), 2);
}

#[tokio::test(start_paused = true)]
async fn reaper_never_goes_below_core() {
    let pool = Pool::start(
        PoolConfig {
            max_idle_time: Duration::from_secs(1),
            reap_interval: Duration::from_millis(100),
            ..config(2, 4)
        },
        MockFactory::new(),
        AlwaysValid,
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    pool.run_maintenance().await;

    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.destroyed, 0);
}

#[tokio::test(start_paused = true)]
async fn run_maintenance_reaps_on_demand() {
    let factory = MockFactory::new();
    let pool = Pool::start(
        PoolConfig {
            max_idle_time: Duration::from_secs(1),
            ..config(0, 2)
        },
        factory.clone(),
        AlwaysValid,
    )
    .await
    .unwrap();
    let mut handle = pool.borrow(&Context::new()).await.unwrap();
    handle.close().await.unwrap();

    tokio::time::advance(Duration::from_secs(2)).await;
    pool.run_maintenance().await;

    assert_eq!(pool.stats().total, 0);
    assert_eq!(factory.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn leak_is_reported_once_with_borrow_site() {
    let pool = Pool::start(
        PoolConfig {
            leak_threshold: Duration::from_secs(1),
            leak_scan_interval: Duration::from_millis(250),
            ..config(1, 2)
        },
        MockFactory::new(),
        AlwaysValid,
    )
    .await
    .unwrap();
    let mut events = pool.events();

    let ctx = Context::new()
        .with_label("leaky-worker")
        .with_metadata("tenant", "acme");
    let leaked = pool.borrow(&ctx).await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;

    let stats = pool.stats();
    assert_eq!(stats.leaks_detected, 1, "many sweeps, one report");
    assert_eq!(stats.active, 1, "leaked handle is not reclaimed");

    let mut reports = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::LeakDetected {
            handle_id,
            held_for,
            site,
            ..
        } = event
        {
            reports.push((handle_id, held_for, site));
        }
    }
    assert_eq!(reports.len(), 1);
    let (handle_id, held_for, site) = reports.remove(0);
    assert_eq!(handle_id, leaked.id());
    assert!(held_for > Duration::from_secs(1));
    let site = site.expect("borrow site is captured while leak detection is on");
    assert_eq!(site.label.as_deref(), Some("leaky-worker"));
    assert_eq!(
        site.metadata.get("tenant").map(String::as_str),
        Some("acme")
    );
    assert!(site.to_string().contains("tenant=acme"));
    assert!(site.location.file().ends_with("maintenance.rs"));
    assert!(site.backtrace.is_none());
}

#[tokio::test(start_paused = true)]
async fn returned_handle_is_not_reported() {
    let pool = Pool::start(
        PoolConfig {
            leak_threshold: Duration::from_secs(1),
            leak_scan_interval: Duration::from_millis(250),
            ..config(1, 1)
        },
        MockFactory::new(),
        AlwaysValid,
    )
    .await
    .unwrap();

    let mut handle = pool.borrow(&Context::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.close().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(pool.stats().leaks_detected, 0);
}

#[tokio::test(start_paused = true)]
async fn idle_validator_replaces_invalid_handles_within_one_cycle() {
    let factory = MockFactory::new();
    let validator = ToggleValidator::new();
    let pool = Pool::start(
        PoolConfig {
            validate_while_idle: true,
            validation_interval: Duration::ZERO,
            idle_validation_interval: Duration::from_millis(100),
            ..config(2, 2)
        },
        factory.clone(),
        validator.clone(),
    )
    .await
    .unwrap();
    let mut events = pool.events();

    validator.set_valid(false);
    tokio::time::sleep(Duration::from_millis(150)).await;
    validator.set_valid(true);

    let stats = pool.stats();
    assert_eq!(stats.validation_failures, 2);
    assert_eq!(stats.total, 2);
    assert_eq!(stats.idle, 2);
    assert_eq!(factory.created(), 4);
    assert_eq!(factory.closed_ids(), vec![1, 2]);

    let mut destroyed = 0;
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::Destroyed { reason, .. } = event {
            assert_eq!(reason, DestroyReason::ValidationFailed);
            destroyed += 1;
        }
    }
    assert_eq!(destroyed, 2);
}

#[tokio::test(start_paused = true)]
async fn idle_validator_skips_recently_validated_handles() {
    let validator = ToggleValidator::new();
    let pool = Pool::start(
        PoolConfig {
            validate_while_idle: true,
            validation_interval: Duration::from_secs(30),
            idle_validation_interval: Duration::from_secs(1),
            ..config(1, 1)
        },
        MockFactory::new(),
        validator.clone(),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(10_500)).await;
    assert_eq!(validator.probes(), 0);

    tokio::time::sleep(Duration::from_secs(21)).await;
    assert_eq!(validator.probes(), 1, "probed once the last check went stale");
}

#[tokio::test(start_paused = true)]
async fn panicking_sweep_does_not_stop_the_others() {
    let factory = MockFactory::new();
    let validator = ToggleValidator::new();
    let pool = Pool::start(
        PoolConfig {
            validate_while_idle: true,
            validation_interval: Duration::ZERO,
            idle_validation_interval: Duration::from_millis(100),
            max_idle_time: Duration::from_millis(250),
            reap_interval: Duration::from_millis(100),
            ..config(0, 2)
        },
        factory.clone(),
        validator.clone(),
    )
    .await
    .unwrap();

    let ctx = Context::new();
    let mut first = pool.borrow(&ctx).await.unwrap();
    let mut second = pool.borrow(&ctx).await.unwrap();
    first.close().await.unwrap();
    second.close().await.unwrap();
    let before = validator.probes();
    validator.set_panics(true);

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(
        validator.probes() >= before + 2,
        "validator kept running after a panic"
    );
    let stats = pool.stats();
    assert_eq!(stats.total, 0, "reaper kept running");
    assert_eq!(stats.destroyed, 2);
    assert_eq!(factory.closed(), 2);
}
