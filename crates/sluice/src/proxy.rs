//! Caller-facing handle proxy.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::entry::{HandleId, PooledHandle};
use crate::error::Result;

/// The pool side of a [`Handle`]: where a borrowed handle goes back to.
pub(crate) trait Recycle<R>: Send + Sync {
    /// Validate the handle and return it to the idle set, or destroy it.
    fn release(&self, handle: PooledHandle<R>) -> BoxFuture<'_, ()>;

    /// Synchronous last resort when no runtime is available to release on:
    /// forget the borrow and drop the raw handle without closing it.
    fn discard(&self, handle: PooledHandle<R>);

    /// Whether the pool still records `id` as borrowed.
    fn is_borrowed(&self, id: HandleId) -> bool;
}

/// A borrowed handle.
///
/// Dereferences to the raw resource, so every operation on the raw type is
/// available directly. Closing is intercepted: the first
/// [`close`](Self::close) returns the handle to its pool and later calls do
/// nothing. A handle dropped without being closed is returned on a spawned
/// Tokio task.
///
/// # Shutdown
/// [`Pool::shutdown`](crate::Pool::shutdown) revokes every outstanding
/// handle: the pool stops counting it, but the raw resource stays usable so
/// in-flight work is not torn down underneath the caller. Long-running
/// borrowers should check [`is_revoked`](Self::is_revoked) and stop; closing
/// a revoked handle closes the raw resource through the factory.
pub struct Handle<R: Send + Sync + 'static> {
    id: HandleId,
    borrowed_at: Instant,
    entry: Option<PooledHandle<R>>,
    pool: Arc<dyn Recycle<R>>,
}

impl<R: Send + Sync + 'static> Handle<R> {
    pub(crate) fn new(entry: PooledHandle<R>, pool: Arc<dyn Recycle<R>>) -> Self {
        Self {
            id: entry.id,
            borrowed_at: entry.borrowed_at.unwrap_or_else(Instant::now),
            entry: Some(entry),
            pool,
        }
    }

    /// Pool-unique id of the underlying handle.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// How long this handle has been borrowed.
    pub fn borrowed_for(&self) -> Duration {
        self.borrowed_at.elapsed()
    }

    /// Whether [`close`](Self::close) already ran.
    pub fn is_closed(&self) -> bool {
        self.entry.is_none()
    }

    /// Whether the pool wrote this borrow off during shutdown. The raw
    /// resource stays usable until the handle is closed, at which point it
    /// is closed through the factory instead of being pooled again.
    pub fn is_revoked(&self) -> bool {
        self.entry.is_some() && !self.pool.is_borrowed(self.id)
    }

    /// Return the handle to its pool. Idempotent: only the first call
    /// releases.
    ///
    /// # Panics
    /// Afterwards the handle no longer owns the raw resource, and
    /// dereferencing it panics. Check [`is_closed`](Self::is_closed) if in
    /// doubt.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(entry) = self.entry.take() {
            self.pool.release(entry).await;
        }
        Ok(())
    }
}

impl<R: Send + Sync + 'static> std::ops::Deref for Handle<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.entry.as_ref().expect("handle used after close").raw
    }
}

impl<R: Send + Sync + 'static> std::ops::DerefMut for Handle<R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.entry.as_mut().expect("handle used after close").raw
    }
}

impl<R: Send + Sync + 'static> Drop for Handle<R> {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pool = Arc::clone(&self.pool);
                drop(runtime.spawn(async move { pool.release(entry).await }));
            }
            Err(_) => self.pool.discard(entry),
        }
    }
}

impl<R: Send + Sync + std::fmt::Debug + 'static> std::fmt::Debug for Handle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("raw", &self.entry.as_ref().map(|e| &e.raw))
            .field("closed", &self.entry.is_none())
            .finish()
    }
}
