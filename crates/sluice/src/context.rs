//! Caller context with cancellation and deadline support

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Context for pool operations.
///
/// Carries an optional deadline, a cancellation token, a caller label that
/// ends up in leak diagnostics, and arbitrary metadata. Passed to
/// [`Pool::borrow`](crate::Pool::borrow) and
/// [`Pool::shutdown`](crate::Pool::shutdown).
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Human-readable identifier of the borrower (e.g. a request id).
    pub label: Option<String>,
    /// Absolute deadline. A borrow gives up at the earlier of this and the
    /// pool's `max_wait`.
    pub deadline: Option<Instant>,
    /// Cooperative cancellation token. A cancelled borrow fails with
    /// [`Error::Cancelled`](crate::Error::Cancelled).
    pub cancellation: CancellationToken,
    /// Arbitrary key-value pairs copied into the borrow site, and so into
    /// leak reports, while leak detection is enabled.
    pub metadata: HashMap<String, String>,
}

impl Context {
    /// Create an empty context: no label, no deadline, never cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the caller label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Replace the default cancellation token with the provided one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Add a key-value metadata pair to the context.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The earlier of the context deadline and `now + limit`.
    pub(crate) fn deadline_within(&self, now: Instant, limit: Duration) -> Instant {
        let bound = now + limit;
        match self.deadline {
            Some(deadline) if deadline < bound => deadline,
            _ => bound,
        }
    }
}
