//! Event broadcasting for pool lifecycle observability.
//!
//! Provides [`PoolEvent`] variants emitted during handle lifecycle
//! operations and an [`EventBus`] backed by `tokio::sync::broadcast`.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::entry::{BorrowSite, HandleId};

// ---------------------------------------------------------------------------
// PoolEvent
// ---------------------------------------------------------------------------

/// Events emitted during handle lifecycle operations.
///
/// All variants carry the name of the pool that emitted them. Subscribers
/// receive cloned copies via [`EventBus::subscribe`].
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A new raw handle was opened.
    Created {
        /// The pool name.
        pool: String,
        /// The new handle.
        handle_id: HandleId,
    },
    /// A handle was lent to a caller.
    Borrowed {
        /// The pool name.
        pool: String,
        /// The borrowed handle.
        handle_id: HandleId,
        /// How long the caller waited for it.
        wait: Duration,
    },
    /// A handle came back and passed validation.
    Returned {
        /// The pool name.
        pool: String,
        /// The returned handle.
        handle_id: HandleId,
        /// How long the caller held it.
        usage: Duration,
    },
    /// A handle was closed and removed from the pool.
    Destroyed {
        /// The pool name.
        pool: String,
        /// The destroyed handle.
        handle_id: HandleId,
        /// Why it was destroyed.
        reason: DestroyReason,
    },
    /// A borrow outlived the leak threshold.
    LeakDetected {
        /// The pool name.
        pool: String,
        /// The leaked handle.
        handle_id: HandleId,
        /// How long it had been borrowed when detected.
        held_for: Duration,
        /// Where it was borrowed.
        site: Option<BorrowSite>,
    },
    /// A borrow gave up at its deadline.
    BorrowTimedOut {
        /// The pool name.
        pool: String,
        /// How long the caller waited.
        waited: Duration,
    },
}

// ---------------------------------------------------------------------------
// DestroyReason
// ---------------------------------------------------------------------------

/// Reason a handle was permanently removed from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// A validation probe failed or timed out.
    ValidationFailed,
    /// The handle sat idle longer than `max_idle_time` above `core_size`.
    IdleTimeout,
    /// The pool is shutting down.
    Shutdown,
    /// The borrowed handle was dropped where no runtime could return it.
    Abandoned,
}

impl std::fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ValidationFailed => "validation_failed",
            Self::IdleTimeout => "idle_timeout",
            Self::Shutdown => "shutdown",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast-based event bus for pool lifecycle events.
///
/// Emission is fire-and-forget: if no subscribers are listening or the
/// channel is full, events are silently dropped (no backpressure on the
/// emitter).
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer size.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: PoolEvent) {
        // No active receivers is not an error.
        let _ = self.sender.send(event);
    }

    /// Subscribe to events emitted after this call.
    ///
    /// A subscriber that falls behind by more than the buffer size receives
    /// a `Lagged` error and skips to the latest events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.emit(PoolEvent::Created {
            pool: "test".to_string(),
            handle_id: 1,
        });
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(PoolEvent::Destroyed {
            pool: "db".to_string(),
            handle_id: 3,
            reason: DestroyReason::IdleTimeout,
        });

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert!(matches!(
            e1,
            PoolEvent::Destroyed {
                reason: DestroyReason::IdleTimeout,
                ..
            }
        ));
        assert!(matches!(e2, PoolEvent::Destroyed { handle_id: 3, .. }));
    }

    #[test]
    fn destroy_reason_display() {
        assert_eq!(DestroyReason::ValidationFailed.to_string(), "validation_failed");
        assert_eq!(DestroyReason::Shutdown.to_string(), "shutdown");
    }
}
