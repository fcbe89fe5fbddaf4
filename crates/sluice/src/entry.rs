//! Pooled handle bookkeeping.

use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::context::Context;

/// Pool-unique handle identifier.
pub type HandleId = u64;

/// Where and by whom a handle was borrowed.
///
/// Captured only while leak detection is enabled. The caller location comes
/// from `#[track_caller]` and is always cheap; the backtrace is materialized
/// only when [`PoolConfig::capture_backtrace`](crate::PoolConfig) is set.
#[derive(Debug, Clone)]
pub struct BorrowSite {
    /// Source location of the `borrow` call.
    pub location: &'static Location<'static>,
    /// Label from the borrowing [`Context`].
    pub label: Option<String>,
    /// Metadata from the borrowing [`Context`], ordered by key.
    pub metadata: BTreeMap<String, String>,
    /// Name (or id) of the thread that issued the borrow.
    pub thread: String,
    /// Wall-clock time of the borrow, for humans reading logs.
    pub at: DateTime<Utc>,
    /// Full backtrace, if requested.
    pub backtrace: Option<Arc<Backtrace>>,
}

impl BorrowSite {
    pub(crate) fn capture(
        location: &'static Location<'static>,
        ctx: &Context,
        with_backtrace: bool,
    ) -> Self {
        let current = std::thread::current();
        let thread = current
            .name()
            .map_or_else(|| format!("{:?}", current.id()), str::to_string);
        Self {
            location,
            label: ctx.label.clone(),
            metadata: ctx
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            thread,
            at: Utc::now(),
            backtrace: with_backtrace.then(|| Arc::new(Backtrace::force_capture())),
        }
    }
}

impl fmt::Display for BorrowSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on thread '{}' at {}", self.location, self.thread, self.at)?;
        if let Some(label) = &self.label {
            write!(f, " (label: {label})")?;
        }
        if !self.metadata.is_empty() {
            f.write_str(" [")?;
            for (i, (key, value)) in self.metadata.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

/// A raw handle plus the timestamps the pool needs to manage it.
pub(crate) struct PooledHandle<R> {
    pub(crate) id: HandleId,
    pub(crate) raw: R,
    pub(crate) created_at: Instant,
    pub(crate) last_access_at: Instant,
    pub(crate) last_validated_at: Instant,
    /// `Some` exactly while the handle is recorded in the active set.
    pub(crate) borrowed_at: Option<Instant>,
    pub(crate) borrow_site: Option<BorrowSite>,
}

impl<R> PooledHandle<R> {
    pub(crate) fn new(id: HandleId, raw: R) -> Self {
        let now = Instant::now();
        Self {
            id,
            raw,
            created_at: now,
            last_access_at: now,
            last_validated_at: now,
            borrowed_at: None,
            borrow_site: None,
        }
    }

    pub(crate) fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access_at)
    }

    /// The last successful probe is older than `interval`.
    pub(crate) fn validation_is_stale(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last_validated_at) > interval
    }

    pub(crate) fn mark_validated(&mut self, now: Instant) {
        self.last_validated_at = now;
    }

    pub(crate) fn mark_borrowed(&mut self, now: Instant, site: Option<BorrowSite>) {
        self.borrowed_at = Some(now);
        self.borrow_site = site;
        self.last_access_at = now;
    }

    pub(crate) fn mark_returned(&mut self, now: Instant) {
        self.borrowed_at = None;
        self.borrow_site = None;
        self.last_access_at = now;
    }
}

impl<R> fmt::Debug for PooledHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("last_access_at", &self.last_access_at)
            .field("borrowed_at", &self.borrowed_at)
            .finish()
    }
}
