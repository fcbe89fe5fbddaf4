//! Background maintenance: idle reaper, leak detector, idle validator.
//!
//! Each sweep runs on its own Tokio task and timer. A sweep that panics is
//! logged and the task carries on with the next tick; the other sweeps are
//! unaffected. Tasks hold only a `Weak` reference to the pool and exit once
//! it is gone.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::events::{DestroyReason, PoolEvent};
use crate::factory::{Factory, Validator};
use crate::pool::Shared;

/// Owns the maintenance tasks of one pool.
pub(crate) struct MaintenanceScheduler {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceScheduler {
    /// Spawn the sweeps the configuration enables.
    pub(crate) fn start<F, V>(pool: Weak<Shared<F, V>>, config: &PoolConfig) -> Self
    where
        F: Factory,
        V: Validator<F::Raw>,
    {
        let cancel = CancellationToken::new();
        let mut tasks = vec![spawn_sweep(
            "idle_reaper",
            config.reap_interval,
            pool.clone(),
            cancel.clone(),
            |shared| async move { reap_idle(&shared).await },
        )];
        if config.leak_detection_enabled() {
            tasks.push(spawn_sweep(
                "leak_detector",
                config.leak_scan_interval,
                pool.clone(),
                cancel.clone(),
                |shared| async move { detect_leaks(&shared) },
            ));
        }
        if config.validate_while_idle {
            tasks.push(spawn_sweep(
                "idle_validator",
                config.idle_validation_interval,
                pool,
                cancel.clone(),
                |shared| async move { validate_idle(&shared).await },
            ));
        }
        Self { cancel, tasks }
    }

    /// Cancel every task and wait for them until `deadline`; stragglers are
    /// aborted. Returns `false` if anything had to be aborted.
    pub(crate) async fn stop(mut self, deadline: Instant) -> bool {
        self.cancel.cancel();
        let mut tasks = std::mem::take(&mut self.tasks);
        let joined =
            tokio::time::timeout_at(deadline, futures::future::join_all(tasks.iter_mut())).await;
        if joined.is_ok() {
            return true;
        }
        for task in &tasks {
            task.abort();
        }
        // Aborted tasks drop their sweep state before this returns.
        for task in tasks {
            let _ = task.await;
        }
        false
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_sweep<F, V, S, Fut>(
    name: &'static str,
    period: Duration,
    pool: Weak<Shared<F, V>>,
    cancel: CancellationToken,
    sweep: S,
) -> JoinHandle<()>
where
    F: Factory,
    V: Validator<F::Raw>,
    S: Fn(Arc<Shared<F, V>>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = tokio::time::sleep(period) => {}
                () = cancel.cancelled() => break,
            }
            let Some(shared) = pool.upgrade() else {
                break;
            };
            let pool_name = shared.config.name.clone();
            if let Err(panic) = AssertUnwindSafe(sweep(shared)).catch_unwind().await {
                tracing::error!(
                    pool = %pool_name,
                    sweep = name,
                    panic = panic_message(panic.as_ref()),
                    "Maintenance sweep panicked"
                );
            }
        }
        tracing::debug!(sweep = name, "Maintenance task stopped");
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Run every enabled sweep once.
pub(crate) async fn run_all<F, V>(shared: &Shared<F, V>)
where
    F: Factory,
    V: Validator<F::Raw>,
{
    reap_idle(shared).await;
    if shared.config.leak_detection_enabled() {
        detect_leaks(shared);
    }
    if shared.config.validate_while_idle {
        validate_idle(shared).await;
    }
}

/// Destroy idle handles unused for longer than `max_idle_time`, never
/// taking the pool below `core_size`.
async fn reap_idle<F, V>(shared: &Shared<F, V>)
where
    F: Factory,
    V: Validator<F::Raw>,
{
    if shared.is_closed() {
        return;
    }
    let now = Instant::now();
    let core_size = shared.config.core_size;
    let max_idle_time = shared.config.max_idle_time;

    // The slot is given up inside the idle lock, one handle at a time, so
    // concurrent destroys cannot push `total` under `core_size`.
    let reaped = shared.idle.evict(|handle| {
        handle.idle_time(now) > max_idle_time
            && shared
                .total
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n > core_size).then(|| n - 1)
                })
                .is_ok()
    });

    for handle in reaped {
        shared.idle.notify_capacity();
        shared.stats.record_destroyed();
        shared.events.emit(PoolEvent::Destroyed {
            pool: shared.config.name.clone(),
            handle_id: handle.id,
            reason: DestroyReason::IdleTimeout,
        });
        tracing::debug!(
            pool = %shared.config.name,
            handle_id = handle.id,
            idle_ms = handle.idle_time(now).as_millis() as u64,
            "Reaped idle handle"
        );
        shared.close_handle(handle).await;
    }
}

/// Report every borrow held longer than `leak_threshold`. Each borrow is
/// reported once; the handle is left with its borrower.
fn detect_leaks<F, V>(shared: &Shared<F, V>)
where
    F: Factory,
    V: Validator<F::Raw>,
{
    let leaks = shared
        .active
        .scan_leaks(Instant::now(), shared.config.leak_threshold);
    for leak in leaks {
        shared.stats.record_leak();
        let site = leak
            .site
            .as_ref()
            .map_or_else(|| "unknown".to_string(), ToString::to_string);
        tracing::warn!(
            pool = %shared.config.name,
            handle_id = leak.handle_id,
            held_ms = leak.held_for.as_millis() as u64,
            borrowed_at = %site,
            "Possible handle leak"
        );
        if let Some(backtrace) = leak.site.as_ref().and_then(|s| s.backtrace.as_ref()) {
            tracing::warn!(
                pool = %shared.config.name,
                handle_id = leak.handle_id,
                "Leaked handle borrowed at:\n{backtrace}"
            );
        }
        shared.events.emit(PoolEvent::LeakDetected {
            pool: shared.config.name.clone(),
            handle_id: leak.handle_id,
            held_for: leak.held_for,
            site: leak.site,
        });
    }
}

/// Probe idle handles whose last probe is older than `validation_interval`.
/// Invalid ones are destroyed and replaced while the pool is below
/// `core_size`.
async fn validate_idle<F, V>(shared: &Shared<F, V>)
where
    F: Factory,
    V: Validator<F::Raw>,
{
    let now = Instant::now();
    let interval = shared.config.validation_interval;
    let due = shared
        .idle
        .ids_where(|handle| handle.validation_is_stale(now, interval));

    let mut checked = 0usize;
    let mut destroyed = 0usize;
    for id in due {
        if shared.is_closed() {
            return;
        }
        // Borrowed since the scan; the borrower vets it.
        let Some(handle) = shared.idle.take(id) else {
            continue;
        };
        checked += 1;
        match shared.check(handle).await {
            Some(handle) => shared.push_idle(handle).await,
            None => {
                destroyed += 1;
                shared.replenish().await;
            }
        }
    }
    if checked > 0 {
        tracing::debug!(
            pool = %shared.config.name,
            checked,
            destroyed,
            "Validated idle handles"
        );
    }
}
