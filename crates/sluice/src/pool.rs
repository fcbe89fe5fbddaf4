//! Pool core: borrow, release, growth and shutdown.
//!
//! `Pool<F, V>` lends out handles opened by a [`Factory`] and probed by a
//! [`Validator`]. Live handles are counted by a single atomic `total`
//! (idle + borrowed), reserved with a compare-and-swap before the factory is
//! called so the cap holds under any interleaving.

use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::active::ActiveSet;
use crate::config::PoolConfig;
use crate::context::Context;
use crate::entry::{BorrowSite, HandleId, PooledHandle};
use crate::error::{Error, Result};
use crate::events::{DestroyReason, EventBus, PoolEvent};
use crate::factory::{AlwaysValid, Factory, Validator};
use crate::idle::{Checkout, IdleSet, Waiter, Wakeup};
use crate::maintenance::{self, MaintenanceScheduler};
use crate::proxy::{Handle, Recycle};
use crate::stats::{PoolStats, StatsRecorder};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared by every clone of a [`Pool`], every outstanding [`Handle`]
/// and (weakly) the maintenance tasks.
pub(crate) struct Shared<F: Factory, V> {
    pub(crate) config: PoolConfig,
    factory: F,
    validator: V,
    pub(crate) idle: IdleSet<F::Raw>,
    pub(crate) active: ActiveSet,
    /// Live handles, idle plus borrowed. Never exceeds `config.max_size`.
    pub(crate) total: AtomicUsize,
    closed: AtomicBool,
    next_id: AtomicU64,
    pub(crate) stats: StatsRecorder,
    pub(crate) events: EventBus,
    scheduler: Mutex<Option<MaintenanceScheduler>>,
}

impl<F, V> Shared<F, V>
where
    F: Factory,
    V: Validator<F::Raw>,
{
    fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reserve a slot while `total < limit`.
    fn reserve(&self, limit: usize) -> Option<Reservation<'_, F, V>> {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()
            .map(|_| Reservation {
                shared: self,
                armed: true,
            })
    }

    /// Give a slot back and wake one waiter so it can grow the pool.
    fn release_slot(&self) {
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.idle.notify_capacity();
    }

    fn has_capacity(&self) -> bool {
        self.total.load(Ordering::Acquire) < self.config.max_size
    }

    /// Open a handle into a reserved slot. A factory failure gives the slot
    /// back.
    async fn create(&self, reservation: Reservation<'_, F, V>) -> Result<PooledHandle<F::Raw>> {
        match self.factory.create().await {
            Ok(raw) => {
                reservation.commit();
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.stats.record_created();
                self.events.emit(PoolEvent::Created {
                    pool: self.config.name.clone(),
                    handle_id: id,
                });
                tracing::debug!(pool = %self.name(), handle_id = id, "Created handle");
                Ok(PooledHandle::new(id, raw))
            }
            Err(e) => {
                drop(reservation);
                self.stats.record_creation_failure();
                tracing::warn!(pool = %self.name(), error = %e, "Factory failed to create handle");
                Err(Error::creation(self.config.name.clone(), e))
            }
        }
    }

    /// Run the validator, bounded by `validation_timeout`.
    async fn probe(&self, raw: &F::Raw) -> bool {
        tokio::time::timeout(self.config.validation_timeout, self.validator.validate(raw))
            .await
            .unwrap_or(false)
    }

    /// Probe a handle that nobody else can see. The handle is parked so that
    /// a caller dropping this future puts it back instead of losing it.
    /// Invalid handles are destroyed and `None` is returned.
    pub(crate) async fn check(
        &self,
        handle: PooledHandle<F::Raw>,
    ) -> Option<PooledHandle<F::Raw>> {
        let parked = Parked::new(self, handle);
        let valid = match parked.raw() {
            Some(raw) => self.probe(raw).await,
            None => false,
        };
        let mut handle = parked.into_inner()?;
        if valid {
            handle.mark_validated(Instant::now());
            Some(handle)
        } else {
            self.stats.record_validation_failure();
            tracing::warn!(
                pool = %self.name(),
                handle_id = handle.id,
                "Handle failed validation, destroying"
            );
            self.destroy(handle, DestroyReason::ValidationFailed).await;
            None
        }
    }

    /// Probe an idle handle before lending it, if the configuration asks for
    /// it or its last probe is stale.
    async fn vet(&self, handle: PooledHandle<F::Raw>) -> Option<PooledHandle<F::Raw>> {
        let due = self.config.validate_on_borrow
            || handle.validation_is_stale(Instant::now(), self.config.validation_interval);
        if due { self.check(handle).await } else { Some(handle) }
    }

    /// Remove a handle from the pool for good and close its raw resource.
    async fn destroy(&self, handle: PooledHandle<F::Raw>, reason: DestroyReason) {
        let id = handle.id;
        self.release_slot();
        self.stats.record_destroyed();
        self.events.emit(PoolEvent::Destroyed {
            pool: self.config.name.clone(),
            handle_id: id,
            reason,
        });
        tracing::debug!(pool = %self.name(), handle_id = id, %reason, "Destroyed handle");
        self.close_raw(id, handle.raw).await;
    }

    /// Close an idle handle whose slot was already given up.
    pub(crate) async fn close_handle(&self, handle: PooledHandle<F::Raw>) {
        self.close_raw(handle.id, handle.raw).await;
    }

    async fn close_raw(&self, id: HandleId, raw: F::Raw) {
        if let Err(e) = self.factory.close(raw).await {
            tracing::warn!(
                pool = %self.name(),
                handle_id = id,
                error = %e,
                "Failed to close handle"
            );
        }
    }

    /// Drop a handle without awaiting the factory. Used where no runtime or
    /// no async context is available.
    fn forget(&self, handle: PooledHandle<F::Raw>, reason: DestroyReason) {
        self.release_slot();
        self.stats.record_destroyed();
        self.events.emit(PoolEvent::Destroyed {
            pool: self.config.name.clone(),
            handle_id: handle.id,
            reason,
        });
    }

    /// Put an unborrowed handle back without awaiting. If the pool closed
    /// meanwhile the idle set is emptied again so nothing is stranded.
    fn restore(&self, handle: PooledHandle<F::Raw>) {
        self.idle.push(handle);
        if self.is_closed() {
            for handle in self.idle.drain() {
                self.forget(handle, DestroyReason::Shutdown);
            }
        }
    }

    /// Create one replacement while the pool is below `core_size`.
    pub(crate) async fn replenish(&self) {
        if self.is_closed() {
            return;
        }
        let Some(reservation) = self.reserve(self.config.core_size) else {
            return;
        };
        match self.create(reservation).await {
            Ok(handle) => {
                let id = handle.id;
                self.push_idle(handle).await;
                tracing::debug!(pool = %self.name(), handle_id = id, "Replaced destroyed handle");
            }
            Err(e) => {
                tracing::warn!(
                    pool = %self.name(),
                    error = %e,
                    "Failed to replace destroyed handle"
                );
            }
        }
    }

    /// Push a handle to the idle set, closing it straight away if shutdown
    /// raced ahead.
    pub(crate) async fn push_idle(&self, handle: PooledHandle<F::Raw>) {
        self.idle.push(handle);
        if self.is_closed() {
            self.drain_idle().await;
        }
    }

    async fn drain_idle(&self) {
        for handle in self.idle.drain() {
            self.destroy(handle, DestroyReason::Shutdown).await;
        }
    }

    /// Steps 1-3 of a borrow: pop and vet, grow, or wait.
    async fn acquire(&self, ctx: &Context, deadline: Instant) -> Result<PooledHandle<F::Raw>> {
        let start = Instant::now();
        if ctx.cancellation.is_cancelled() {
            return Err(self.cancelled(start));
        }
        loop {
            if self.is_closed() {
                return Err(Error::closed(self.config.name.clone()));
            }
            match self.idle.checkout(|| self.has_capacity()) {
                Checkout::Ready(handle) => {
                    if let Some(handle) = self.vet(handle).await {
                        return Ok(handle);
                    }
                }
                Checkout::Retry => {
                    if let Some(reservation) = self.reserve(self.config.max_size) {
                        return self.create(reservation).await;
                    }
                }
                Checkout::Wait(waiter) => {
                    let mut waiting = Waiting::new(self, waiter);
                    let outcome = tokio::select! {
                        biased;
                        wakeup = waiting.recv() => Outcome::Woken(wakeup),
                        () = ctx.cancellation.cancelled() => Outcome::Cancelled,
                        () = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
                    };
                    drop(waiting);
                    match outcome {
                        Outcome::Woken(Some(Wakeup::Handle(handle))) => {
                            if let Some(handle) = self.vet(handle).await {
                                return Ok(handle);
                            }
                        }
                        Outcome::Woken(Some(Wakeup::Capacity)) => {}
                        Outcome::Woken(None) => {
                            return Err(Error::closed(self.config.name.clone()));
                        }
                        Outcome::Cancelled => return Err(self.cancelled(start)),
                        Outcome::TimedOut => {
                            return Err(Error::Timeout {
                                pool: self.config.name.clone(),
                                waited: start.elapsed(),
                                total: self.total.load(Ordering::Acquire),
                                max_size: self.config.max_size,
                            });
                        }
                    }
                }
            }
        }
    }

    fn cancelled(&self, start: Instant) -> Error {
        Error::Cancelled {
            pool: self.config.name.clone(),
            waited: start.elapsed(),
        }
    }

    /// Record a handle as borrowed. Fails if shutdown closed the pool while
    /// the handle was being acquired.
    async fn lend(
        &self,
        mut handle: PooledHandle<F::Raw>,
        site: Option<BorrowSite>,
        waited: Duration,
    ) -> Result<PooledHandle<F::Raw>> {
        let now = Instant::now();
        handle.mark_borrowed(now, site.clone());
        self.active.insert(handle.id, now, site);
        if self.is_closed() {
            handle.mark_returned(now);
            if self.active.remove(handle.id).is_some() {
                self.destroy(handle, DestroyReason::Shutdown).await;
            } else {
                self.close_raw(handle.id, handle.raw).await;
            }
            return Err(Error::closed(self.config.name.clone()));
        }
        self.events.emit(PoolEvent::Borrowed {
            pool: self.config.name.clone(),
            handle_id: handle.id,
            wait: waited,
        });
        tracing::debug!(
            pool = %self.name(),
            handle_id = handle.id,
            wait_ms = waited.as_millis() as u64,
            "Borrowed handle"
        );
        Ok(handle)
    }

    fn capture_site(
        &self,
        location: &'static Location<'static>,
        ctx: &Context,
    ) -> Option<BorrowSite> {
        self.config
            .leak_detection_enabled()
            .then(|| BorrowSite::capture(location, ctx, self.config.capture_backtrace))
    }

    async fn borrow(
        &self,
        ctx: &Context,
        location: &'static Location<'static>,
    ) -> Result<PooledHandle<F::Raw>> {
        let start = Instant::now();
        let deadline = ctx.deadline_within(start, self.config.max_wait);
        let acquired = self.acquire(ctx, deadline).await;
        let waited = start.elapsed();
        let result = match acquired {
            Ok(handle) => {
                let site = self.capture_site(location, ctx);
                self.lend(handle, site, waited).await
            }
            Err(e) => Err(e),
        };

        self.stats.record_borrow(waited, result.is_ok());
        if let Err(Error::Timeout { total, .. }) = &result {
            self.stats.record_timeout();
            self.events.emit(PoolEvent::BorrowTimedOut {
                pool: self.config.name.clone(),
                waited,
            });
            tracing::debug!(
                pool = %self.name(),
                waited_ms = waited.as_millis() as u64,
                total,
                "Borrow timed out"
            );
        }
        result
    }

    async fn try_borrow(
        &self,
        ctx: &Context,
        location: &'static Location<'static>,
    ) -> Result<Option<PooledHandle<F::Raw>>> {
        let start = Instant::now();
        let acquired = loop {
            if self.is_closed() {
                break Err(Error::closed(self.config.name.clone()));
            }
            if let Some(handle) = self.idle.pop() {
                match self.vet(handle).await {
                    Some(handle) => break Ok(Some(handle)),
                    None => continue,
                }
            }
            match self.reserve(self.config.max_size) {
                Some(reservation) => break self.create(reservation).await.map(Some),
                None => break Ok(None),
            }
        };
        let waited = start.elapsed();
        let result = match acquired {
            Ok(Some(handle)) => {
                let site = self.capture_site(location, ctx);
                self.lend(handle, site, waited).await.map(Some)
            }
            other => other,
        };
        self.stats
            .record_borrow(waited, matches!(result, Ok(Some(_))));
        result
    }

    /// Return a borrowed handle: validate it and make it available again,
    /// or destroy it and top the pool back up to `core_size`.
    async fn give_back(&self, mut handle: PooledHandle<F::Raw>) {
        let id = handle.id;
        let now = Instant::now();
        let usage = handle
            .borrowed_at
            .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
        handle.mark_returned(now);

        if self.active.remove(id).is_none() {
            // Written off at shutdown; the slot is already gone.
            tracing::debug!(pool = %self.name(), handle_id = id, "Closing revoked handle");
            self.close_raw(id, handle.raw).await;
            return;
        }
        if self.is_closed() {
            self.destroy(handle, DestroyReason::Shutdown).await;
            return;
        }

        match self.check(handle).await {
            Some(handle) => {
                self.events.emit(PoolEvent::Returned {
                    pool: self.config.name.clone(),
                    handle_id: id,
                    usage,
                });
                tracing::debug!(
                    pool = %self.name(),
                    handle_id = id,
                    usage_ms = usage.as_millis() as u64,
                    "Returned handle"
                );
                self.push_idle(handle).await;
            }
            None => self.replenish().await,
        }
    }

    async fn shutdown(&self, ctx: &Context) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!(pool = %self.name(), "Shutting down pool");

        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            let deadline = ctx.deadline_within(Instant::now(), self.config.shutdown_timeout);
            if !scheduler.stop(deadline).await {
                tracing::warn!(
                    pool = %self.name(),
                    "Maintenance tasks did not stop in time and were aborted"
                );
            }
        }

        self.drain_idle().await;

        for (id, entry) in self.active.drain() {
            self.release_slot();
            self.stats.record_destroyed();
            self.events.emit(PoolEvent::Destroyed {
                pool: self.config.name.clone(),
                handle_id: id,
                reason: DestroyReason::Shutdown,
            });
            tracing::warn!(
                pool = %self.name(),
                handle_id = id,
                held_ms = entry.borrowed_at.elapsed().as_millis() as u64,
                "Borrowed handle written off at shutdown"
            );
        }

        tracing::info!(pool = %self.name(), "Pool shut down");
        Ok(())
    }

    fn snapshot(&self) -> PoolStats {
        self.stats.snapshot(
            self.total.load(Ordering::Acquire),
            self.idle.len(),
            self.active.len(),
            self.idle.waiting(),
        )
    }
}

impl<F, V> Recycle<F::Raw> for Shared<F, V>
where
    F: Factory,
    V: Validator<F::Raw>,
{
    fn release(&self, handle: PooledHandle<F::Raw>) -> BoxFuture<'_, ()> {
        Box::pin(self.give_back(handle))
    }

    fn discard(&self, handle: PooledHandle<F::Raw>) {
        if self.active.remove(handle.id).is_some() {
            tracing::warn!(
                pool = %self.name(),
                handle_id = handle.id,
                "Handle dropped outside a runtime; discarding without close"
            );
            self.forget(handle, DestroyReason::Abandoned);
        }
    }

    fn is_borrowed(&self, id: HandleId) -> bool {
        self.active.contains(id)
    }
}

enum Outcome<R> {
    Woken(Option<Wakeup<R>>),
    Cancelled,
    TimedOut,
}

// ---------------------------------------------------------------------------
// Drop guards
// ---------------------------------------------------------------------------

/// A reserved slot. Dropped without [`commit`](Self::commit), the slot is
/// given back.
struct Reservation<'a, F: Factory, V: Validator<F::Raw>> {
    shared: &'a Shared<F, V>,
    armed: bool,
}

impl<F: Factory, V: Validator<F::Raw>> Reservation<'_, F, V> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl<F: Factory, V: Validator<F::Raw>> Drop for Reservation<'_, F, V> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_slot();
        }
    }
}

/// A handle taken out of both sets while it is being probed. Dropped
/// without [`into_inner`](Self::into_inner), it goes back to the idle set.
struct Parked<'a, F: Factory, V: Validator<F::Raw>> {
    shared: &'a Shared<F, V>,
    handle: Option<PooledHandle<F::Raw>>,
}

impl<'a, F: Factory, V: Validator<F::Raw>> Parked<'a, F, V> {
    fn new(shared: &'a Shared<F, V>, handle: PooledHandle<F::Raw>) -> Self {
        Self {
            shared,
            handle: Some(handle),
        }
    }

    fn raw(&self) -> Option<&F::Raw> {
        self.handle.as_ref().map(|h| &h.raw)
    }

    fn into_inner(mut self) -> Option<PooledHandle<F::Raw>> {
        self.handle.take()
    }
}

impl<F: Factory, V: Validator<F::Raw>> Drop for Parked<'_, F, V> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shared.restore(handle);
        }
    }
}

/// A registered waiter. Dropped for any reason, it stops waiting and passes
/// on whatever raced into its channel.
struct Waiting<'a, F: Factory, V: Validator<F::Raw>> {
    shared: &'a Shared<F, V>,
    waiter: Option<Waiter<F::Raw>>,
}

impl<'a, F: Factory, V: Validator<F::Raw>> Waiting<'a, F, V> {
    fn new(shared: &'a Shared<F, V>, waiter: Waiter<F::Raw>) -> Self {
        Self {
            shared,
            waiter: Some(waiter),
        }
    }

    async fn recv(&mut self) -> Option<Wakeup<F::Raw>> {
        match self.waiter.as_mut() {
            Some(waiter) => waiter.recv().await,
            None => None,
        }
    }
}

impl<F: Factory, V: Validator<F::Raw>> Drop for Waiting<'_, F, V> {
    fn drop(&mut self) {
        let Some(waiter) = self.waiter.take() else {
            return;
        };
        match self.shared.idle.abandon(waiter) {
            Some(Wakeup::Handle(handle)) => self.shared.restore(handle),
            Some(Wakeup::Capacity) => self.shared.idle.notify_capacity(),
            None => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// A bounded, self-healing pool of reusable handles.
///
/// Cheap to clone; clones share one pool. Maintenance runs on three Tokio
/// tasks started by [`Pool::new`] and stopped by [`Pool::shutdown`] or when
/// the last clone and the last outstanding handle are gone.
///
/// ```rust,ignore
/// let config = PoolConfig::named("orders-db");
/// let pool = Pool::start(config, PgFactory::new(url), PingValidator).await?;
/// let mut conn = pool.borrow(&Context::new()).await?;
/// conn.execute("SELECT 1").await?;
/// conn.close().await?;
/// ```
pub struct Pool<F: Factory, V: Validator<F::Raw> = AlwaysValid> {
    shared: Arc<Shared<F, V>>,
}

impl<F: Factory, V: Validator<F::Raw>> Clone for Pool<F, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: Factory, V: Validator<F::Raw>> std::fmt::Debug for Pool<F, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.config.name)
            .field("closed", &self.shared.is_closed())
            .field("stats", &self.shared.snapshot())
            .finish()
    }
}

impl<F: Factory> Pool<F, AlwaysValid> {
    /// Create a pool that never probes its handles.
    ///
    /// # Errors
    /// See [`Pool::new`].
    pub fn without_validation(config: PoolConfig, factory: F) -> Result<Self> {
        Self::new(config, factory, AlwaysValid)
    }
}

impl<F: Factory, V: Validator<F::Raw>> Pool<F, V> {
    /// Create an empty pool and start its maintenance tasks.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if `config` is invalid or no Tokio
    /// runtime is running.
    pub fn new(config: PoolConfig, factory: F, validator: V) -> Result<Self> {
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::configuration(
                "Pool::new must be called from within a Tokio runtime",
            ));
        }

        let shared = Arc::new(Shared {
            idle: IdleSet::with_capacity(config.max_size),
            active: ActiveSet::new(),
            total: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            stats: StatsRecorder::default(),
            events: EventBus::new(config.event_buffer),
            scheduler: Mutex::new(None),
            factory,
            validator,
            config,
        });
        let scheduler = MaintenanceScheduler::start(Arc::downgrade(&shared), &shared.config);
        *shared.scheduler.lock() = Some(scheduler);

        tracing::debug!(
            pool = %shared.config.name,
            core_size = shared.config.core_size,
            max_size = shared.config.max_size,
            "Created pool"
        );
        Ok(Self { shared })
    }

    /// Create a pool and fill it to `core_size`.
    ///
    /// # Errors
    /// Configuration errors as for [`Pool::new`]; a factory failure during
    /// warm-up shuts the partial pool down and is returned.
    pub async fn start(config: PoolConfig, factory: F, validator: V) -> Result<Self> {
        let pool = Self::new(config, factory, validator)?;
        if let Err(e) = pool.warm_up().await {
            pool.shutdown(&Context::new()).await?;
            return Err(e);
        }
        Ok(pool)
    }

    /// Open handles until the pool holds `core_size` of them.
    ///
    /// # Errors
    /// Returns the first factory failure, or [`Error::Closed`].
    pub async fn warm_up(&self) -> Result<()> {
        let shared = &self.shared;
        while let Some(reservation) = shared.reserve(shared.config.core_size) {
            if shared.is_closed() {
                return Err(Error::closed(shared.config.name.clone()));
            }
            let handle = shared.create(reservation).await?;
            shared.push_idle(handle).await;
        }
        tracing::debug!(
            pool = %shared.config.name,
            total = shared.total.load(Ordering::Acquire),
            "Warmed up pool"
        );
        Ok(())
    }

    /// Borrow a handle, waiting up to `max_wait` or the context deadline,
    /// whichever comes first.
    ///
    /// # Errors
    /// - [`Error::Timeout`] if nothing became available in time
    /// - [`Error::Cancelled`] if the context's token fired
    /// - [`Error::Creation`] if the pool tried to grow and the factory failed
    /// - [`Error::Closed`] after [`shutdown`](Self::shutdown)
    #[track_caller]
    pub fn borrow<'a>(
        &'a self,
        ctx: &'a Context,
    ) -> impl Future<Output = Result<Handle<F::Raw>>> + Send + 'a {
        let location = Location::caller();
        async move {
            let handle = self.shared.borrow(ctx, location).await?;
            Ok(self.wrap(handle))
        }
    }

    /// Borrow without waiting: an idle handle, or a new one if there is
    /// room. `Ok(None)` when the pool is at capacity with nothing idle.
    ///
    /// # Errors
    /// [`Error::Creation`] or [`Error::Closed`].
    #[track_caller]
    pub fn try_borrow<'a>(
        &'a self,
        ctx: &'a Context,
    ) -> impl Future<Output = Result<Option<Handle<F::Raw>>>> + Send + 'a {
        let location = Location::caller();
        async move {
            let handle = self.shared.try_borrow(ctx, location).await?;
            Ok(handle.map(|h| self.wrap(h)))
        }
    }

    fn wrap(&self, handle: PooledHandle<F::Raw>) -> Handle<F::Raw> {
        let recycle: Arc<dyn Recycle<F::Raw>> = self.shared.clone();
        Handle::new(handle, recycle)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.shared.snapshot()
    }

    /// Close the pool. Idempotent.
    ///
    /// Stops maintenance (waiting at most until the context deadline or
    /// `shutdown_timeout`), closes every idle handle and writes off every
    /// borrowed one: its slot is freed now and its raw resource is closed
    /// when the caller releases it.
    ///
    /// # Errors
    /// Currently infallible; a maintenance task that had to be aborted is
    /// only logged.
    pub async fn shutdown(&self, ctx: &Context) -> Result<()> {
        self.shared.shutdown(ctx).await
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// The pool's configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Subscribe to lifecycle events emitted after this call.
    #[must_use]
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// Run every enabled maintenance sweep once, now.
    pub async fn run_maintenance(&self) {
        maintenance::run_all(&self.shared).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockFactory, ToggleValidator};
    use pretty_assertions::assert_eq;

    fn config(core_size: usize, max_size: usize) -> PoolConfig {
        PoolConfig {
            name: "test".to_string(),
            core_size,
            max_size,
            max_wait: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn borrow_reuses_released_handle() {
        let factory = MockFactory::new();
        let pool = Pool::without_validation(config(0, 2), factory.clone()).unwrap();
        let ctx = Context::new();

        let mut first = pool.borrow(&ctx).await.unwrap();
        let id = first.id();
        first.close().await.unwrap();

        let second = pool.borrow(&ctx).await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn warm_up_fills_to_core() {
        let factory = MockFactory::new();
        let pool = Pool::start(config(3, 5), factory.clone(), AlwaysValid)
            .await
            .unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.idle, 3);
        assert_eq!(factory.created(), 3);
    }

    #[tokio::test]
    async fn failed_warm_up_closes_pool() {
        let factory = MockFactory::new();
        factory.fail_creates(true);
        let err = Pool::start(config(2, 2), factory, AlwaysValid).await.unwrap_err();
        assert!(matches!(err, Error::Creation { .. }));
    }

    #[tokio::test]
    async fn creation_failure_releases_slot() {
        let factory = MockFactory::new();
        let pool = Pool::without_validation(config(0, 1), factory.clone()).unwrap();
        let ctx = Context::new();

        factory.fail_creates(true);
        let err = pool.borrow(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::Creation { .. }));
        assert_eq!(pool.stats().total, 0);

        factory.fail_creates(false);
        let handle = pool.borrow(&ctx).await.unwrap();
        assert_eq!(pool.stats().total, 1);
        drop(handle);
    }

    #[tokio::test]
    async fn try_borrow_returns_none_at_capacity() {
        let pool = Pool::without_validation(config(0, 1), MockFactory::new()).unwrap();
        let ctx = Context::new();

        let held = pool.try_borrow(&ctx).await.unwrap();
        assert!(held.is_some());
        assert!(pool.try_borrow(&ctx).await.unwrap().is_none());
        assert_eq!(pool.stats().borrow_requests, 2);
        assert_eq!(pool.stats().borrow_successes, 1);
    }

    #[tokio::test]
    async fn invalid_handle_is_replaced_on_release() {
        let factory = MockFactory::new();
        let validator = ToggleValidator::new();
        let pool = Pool::start(config(1, 2), factory.clone(), validator.clone())
            .await
            .unwrap();
        let ctx = Context::new();

        let mut handle = pool.borrow(&ctx).await.unwrap();
        let old = handle.id();
        validator.set_valid(false);
        handle.close().await.unwrap();
        validator.set_valid(true);

        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.validation_failures, 1);
        assert_eq!(factory.created(), 2);
        assert_eq!(factory.closed(), 1);

        let handle = pool.borrow(&ctx).await.unwrap();
        assert_ne!(handle.id(), old);
    }

    #[tokio::test]
    async fn borrow_after_shutdown_fails() {
        let pool = Pool::start(config(1, 1), MockFactory::new(), AlwaysValid)
            .await
            .unwrap();
        pool.shutdown(&Context::new()).await.unwrap();
        assert!(pool.is_closed());

        let err = pool.borrow(&Context::new()).await.unwrap_err();
        assert!(matches!(err, Error::Closed { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_borrows_leave_no_queued_waiters() {
        let pool = Pool::start(
            PoolConfig {
                max_wait: Duration::from_millis(1),
                ..config(1, 1)
            },
            MockFactory::new(),
            AlwaysValid,
        )
        .await
        .unwrap();
        let ctx = Context::new();
        let mut held = pool.borrow(&ctx).await.unwrap();

        for _ in 0..10_000 {
            let err = pool.borrow(&ctx).await.unwrap_err();
            assert!(matches!(err, Error::Timeout { .. }));
        }
        assert_eq!(pool.stats().waiting, 0);
        assert_eq!(pool.shared.idle.queued(), 0);

        held.close().await.unwrap();
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn new_outside_runtime_is_rejected() {
        let err = Pool::without_validation(config(0, 1), MockFactory::new()).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
