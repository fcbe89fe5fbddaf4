//! Active set: records of handles currently lent out.
//!
//! The raw resource travels with the caller's [`Handle`](crate::Handle); the
//! active set keeps what the pool needs to find leaks and to write borrowed
//! handles off at shutdown.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::entry::{BorrowSite, HandleId};

/// Bookkeeping for one borrowed handle.
#[derive(Debug, Clone)]
pub(crate) struct ActiveEntry {
    pub(crate) borrowed_at: Instant,
    pub(crate) site: Option<BorrowSite>,
    pub(crate) leak_reported: bool,
}

/// A borrow that outlived the leak threshold.
#[derive(Debug, Clone)]
pub(crate) struct LeakReport {
    /// Id of the leaked handle.
    pub(crate) handle_id: HandleId,
    /// How long the handle has been borrowed.
    pub(crate) held_for: Duration,
    /// Where it was borrowed, if captured.
    pub(crate) site: Option<BorrowSite>,
}

#[derive(Debug, Default)]
pub(crate) struct ActiveSet {
    entries: DashMap<HandleId, ActiveEntry>,
}

impl ActiveSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, id: HandleId, borrowed_at: Instant, site: Option<BorrowSite>) {
        self.entries.insert(
            id,
            ActiveEntry {
                borrowed_at,
                site,
                leak_reported: false,
            },
        );
    }

    /// Remove a borrow record. `None` if it was never there or was already
    /// written off.
    pub(crate) fn remove(&self, id: HandleId) -> Option<ActiveEntry> {
        self.entries.remove(&id).map(|(_, entry)| entry)
    }

    pub(crate) fn contains(&self, id: HandleId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Report every borrow older than `threshold` that has not been reported
    /// before. Each borrow is reported at most once.
    pub(crate) fn scan_leaks(&self, now: Instant, threshold: Duration) -> Vec<LeakReport> {
        let mut leaks = Vec::new();
        for mut entry in self.entries.iter_mut() {
            let held_for = now.saturating_duration_since(entry.borrowed_at);
            if held_for > threshold && !entry.leak_reported {
                entry.leak_reported = true;
                leaks.push(LeakReport {
                    handle_id: *entry.key(),
                    held_for,
                    site: entry.site.clone(),
                });
            }
        }
        leaks
    }

    /// Remove and return every borrow record.
    pub(crate) fn drain(&self) -> Vec<(HandleId, ActiveEntry)> {
        let ids: Vec<HandleId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn leak_is_reported_once() {
        let active = ActiveSet::new();
        active.insert(1, Instant::now(), None);
        active.insert(2, Instant::now() + Duration::from_secs(5), None);

        tokio::time::advance(Duration::from_secs(4)).await;
        let leaks = active.scan_leaks(Instant::now(), Duration::from_secs(3));
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].handle_id, 1);
        assert_eq!(leaks[0].held_for, Duration::from_secs(4));

        tokio::time::advance(Duration::from_secs(10)).await;
        let leaks = active.scan_leaks(Instant::now(), Duration::from_secs(3));
        assert_eq!(
            leaks.iter().map(|l| l.handle_id).collect::<Vec<_>>(),
            vec![2],
            "handle 1 was already reported"
        );
    }

    #[tokio::test]
    async fn remove_and_drain() {
        let active = ActiveSet::new();
        for id in 0..3 {
            active.insert(id, Instant::now(), None);
        }
        assert!(active.remove(1).is_some());
        assert!(active.remove(1).is_none());
        assert!(!active.contains(1));

        let drained = active.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(active.len(), 0);
    }
}
