//! Idle set: handles available for borrowing, plus the queue of borrowers
//! waiting for one.
//!
//! Both queues live behind one short-held lock so that "is anything idle?"
//! and "register me as a waiter" happen atomically. A returned handle is
//! handed straight to the oldest live waiter through a one-shot channel; only
//! when nobody is waiting does it go onto the idle deque. Waiters are woken,
//! never polled.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::entry::{HandleId, PooledHandle};

/// What a waiting borrower is woken with.
pub(crate) enum Wakeup<R> {
    /// A handle was returned and is now owned by the waiter.
    Handle(PooledHandle<R>),
    /// A slot was freed; the waiter may try to grow the pool.
    Capacity,
}

/// Outcome of [`IdleSet::checkout`].
pub(crate) enum Checkout<R> {
    /// An idle handle was available.
    Ready(PooledHandle<R>),
    /// Nothing idle, but capacity freed up since the caller last looked.
    Retry,
    /// Registered as a waiter.
    Wait(Waiter<R>),
}

/// A registered waiter. Must be resolved with [`Waiter::recv`] or
/// [`IdleSet::abandon`]; dropping it without abandoning can lose a handle
/// that raced into the channel and leaves its sender queued.
pub(crate) struct Waiter<R> {
    rx: oneshot::Receiver<Wakeup<R>>,
}

impl<R> Waiter<R> {
    /// Wait for a wakeup. `None` means the idle set dropped every waiter
    /// (pool shutdown).
    pub(crate) async fn recv(&mut self) -> Option<Wakeup<R>> {
        (&mut self.rx).await.ok()
    }

}

struct Inner<R> {
    handles: VecDeque<PooledHandle<R>>,
    waiters: VecDeque<oneshot::Sender<Wakeup<R>>>,
}

/// FIFO idle deque with a FIFO waiter queue.
pub(crate) struct IdleSet<R> {
    inner: Mutex<Inner<R>>,
}

impl<R> IdleSet<R> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                handles: VecDeque::with_capacity(capacity),
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Pop the oldest idle handle without waiting.
    pub(crate) fn pop(&self) -> Option<PooledHandle<R>> {
        self.inner.lock().handles.pop_front()
    }

    /// Pop an idle handle, or register as a waiter.
    ///
    /// `has_capacity` is evaluated under the idle lock, after the deque was
    /// found empty. Slot releases notify under the same lock, so a borrower
    /// either sees the freed slot here or is already queued when the
    /// notification goes out.
    pub(crate) fn checkout(&self, has_capacity: impl FnOnce() -> bool) -> Checkout<R> {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.handles.pop_front() {
            return Checkout::Ready(handle);
        }
        if has_capacity() {
            return Checkout::Retry;
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.push_back(tx);
        Checkout::Wait(Waiter { rx })
    }

    /// Return a handle: give it to the oldest live waiter, or queue it.
    pub(crate) fn push(&self, handle: PooledHandle<R>) {
        let mut inner = self.inner.lock();
        if let Some(Wakeup::Handle(handle)) =
            hand_off(&mut inner.waiters, Wakeup::Handle(handle))
        {
            inner.handles.push_back(handle);
        }
    }

    /// Stop waiting and drop every closed sender from the queue. Returns
    /// whatever was sent before the channel closed so the caller can pass it
    /// on.
    pub(crate) fn abandon(&self, mut waiter: Waiter<R>) -> Option<Wakeup<R>> {
        let mut inner = self.inner.lock();
        waiter.rx.close();
        let raced = waiter.rx.try_recv().ok();
        inner.waiters.retain(|tx| !tx.is_closed());
        raced
    }

    /// Tell the oldest live waiter that a slot was freed.
    pub(crate) fn notify_capacity(&self) {
        let mut inner = self.inner.lock();
        let _ = hand_off(&mut inner.waiters, Wakeup::Capacity);
    }

    /// Remove a specific idle handle.
    pub(crate) fn take(&self, id: HandleId) -> Option<PooledHandle<R>> {
        let mut inner = self.inner.lock();
        let pos = inner.handles.iter().position(|h| h.id == id)?;
        inner.handles.remove(pos)
    }

    /// Ids of idle handles matching `pred`, oldest first.
    pub(crate) fn ids_where(&self, pred: impl Fn(&PooledHandle<R>) -> bool) -> Vec<HandleId> {
        self.inner
            .lock()
            .handles
            .iter()
            .filter(|h| pred(h))
            .map(|h| h.id)
            .collect()
    }

    /// Remove every idle handle for which `evict` returns `true`, keeping the
    /// order of the rest. `evict` runs under the idle lock.
    pub(crate) fn evict(
        &self,
        mut evict: impl FnMut(&PooledHandle<R>) -> bool,
    ) -> Vec<PooledHandle<R>> {
        let mut inner = self.inner.lock();
        let mut evicted = Vec::new();
        let mut kept = VecDeque::with_capacity(inner.handles.len());
        while let Some(handle) = inner.handles.pop_front() {
            if evict(&handle) {
                evicted.push(handle);
            } else {
                kept.push_back(handle);
            }
        }
        inner.handles = kept;
        evicted
    }

    /// Take every idle handle and release every waiter.
    pub(crate) fn drain(&self) -> Vec<PooledHandle<R>> {
        let mut inner = self.inner.lock();
        inner.waiters.clear();
        inner.handles.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().handles.len()
    }

    /// Senders still queued, closed or not.
    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Number of borrowers currently waiting.
    pub(crate) fn waiting(&self) -> usize {
        self.inner
            .lock()
            .waiters
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

/// Deliver `wakeup` to the first waiter still listening. Returns it if
/// nobody took it.
fn hand_off<R>(
    waiters: &mut VecDeque<oneshot::Sender<Wakeup<R>>>,
    mut wakeup: Wakeup<R>,
) -> Option<Wakeup<R>> {
    while let Some(tx) = waiters.pop_front() {
        match tx.send(wakeup) {
            Ok(()) => return None,
            Err(returned) => wakeup = returned,
        }
    }
    Some(wakeup)
}
