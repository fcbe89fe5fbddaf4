//! Metrics collection for pool lifecycle events.
//!
//! Subscribes to a pool's event stream and translates events into counters
//! and histograms via the `metrics` crate.
//!
//! Gated behind the `metrics` feature.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::events::PoolEvent;
use crate::factory::{Factory, Validator};
use crate::pool::Pool;

/// Background metrics collector that subscribes to a pool's events and
/// records counters/histograms via the `metrics` crate.
///
/// # Usage
///
/// ```rust,ignore
/// let collector = MetricsCollector::new(&pool);
/// let cancel = CancellationToken::new();
/// tokio::spawn(collector.run(cancel));
/// ```
pub struct MetricsCollector {
    receiver: broadcast::Receiver<PoolEvent>,
}

impl MetricsCollector {
    /// Create a new collector subscribed to `pool`.
    #[must_use]
    pub fn new<F: Factory, V: Validator<F::Raw>>(pool: &Pool<F, V>) -> Self {
        Self::from_receiver(pool.events())
    }

    /// Create a collector over an existing subscription.
    #[must_use]
    pub fn from_receiver(receiver: broadcast::Receiver<PoolEvent>) -> Self {
        Self { receiver }
    }

    /// Run the collector loop, consuming events and updating metrics.
    ///
    /// Runs until every sender is gone (the pool was dropped) or `cancel`
    /// fires. Lagged events are skipped with a warning.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                result = self.receiver.recv() => {
                    match result {
                        Ok(event) => Self::record_event(&event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "MetricsCollector lagged behind pool events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    }

    /// Record a single event into the metrics system.
    fn record_event(event: &PoolEvent) {
        match event {
            PoolEvent::Created { pool, .. } => {
                metrics::counter!("sluice.handle.created", "pool" => pool.clone()).increment(1);
            }
            PoolEvent::Borrowed { pool, wait, .. } => {
                metrics::counter!("sluice.borrow.total", "pool" => pool.clone()).increment(1);
                metrics::histogram!("sluice.borrow.wait_seconds", "pool" => pool.clone())
                    .record(wait.as_secs_f64());
            }
            PoolEvent::Returned { pool, usage, .. } => {
                metrics::counter!("sluice.return.total", "pool" => pool.clone()).increment(1);
                metrics::histogram!("sluice.handle.usage_seconds", "pool" => pool.clone())
                    .record(usage.as_secs_f64());
            }
            PoolEvent::Destroyed { pool, reason, .. } => {
                metrics::counter!(
                    "sluice.handle.destroyed",
                    "pool" => pool.clone(),
                    "reason" => reason.to_string()
                )
                .increment(1);
            }
            PoolEvent::LeakDetected { pool, .. } => {
                metrics::counter!("sluice.leak.total", "pool" => pool.clone()).increment(1);
            }
            PoolEvent::BorrowTimedOut { pool, .. } => {
                metrics::counter!("sluice.borrow.timeouts", "pool" => pool.clone()).increment(1);
            }
        }
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish()
    }
}

/// Create a [`MetricsCollector`] for `pool` and spawn it as a background
/// task. Returns the `JoinHandle` so the caller can await or abort it.
pub fn spawn_metrics_collector<F: Factory, V: Validator<F::Raw>>(
    pool: &Pool<F, V>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(MetricsCollector::new(pool).run(cancel))
}
