//! Test doubles for exercising a [`Pool`](crate::Pool).
//!
//! [`MockFactory`] opens [`MockConn`]s and counts every create and close;
//! creates can be delayed or made to fail. [`MockConn::session`] asserts
//! that no two borrowers use the same connection at once. [`ToggleValidator`]
//! is a probe whose verdict, latency and panics are switched from the test.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::factory::{Factory, Validator};

/// Error returned by [`MockFactory`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("mock factory: {0}")]
pub struct MockError(pub String);

#[derive(Default)]
struct MockState {
    created: AtomicU64,
    closed: AtomicU64,
    create_failures: AtomicU64,
    fail_creates: AtomicBool,
    fail_closes: AtomicBool,
    create_delay: Mutex<Duration>,
    closed_ids: Mutex<Vec<u64>>,
    in_use: Mutex<HashSet<u64>>,
    peak_in_use: AtomicUsize,
}

/// Factory of [`MockConn`]s. Clones share counters and switches.
#[derive(Clone, Default)]
pub struct MockFactory {
    state: Arc<MockState>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following create fail (or succeed again).
    pub fn fail_creates(&self, fail: bool) {
        self.state.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make every following close report an error. The connection is still
    /// counted as closed.
    pub fn fail_closes(&self, fail: bool) {
        self.state.fail_closes.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long inside every create.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.state.create_delay.lock() = delay;
    }

    fn create_delay(&self) -> Duration {
        *self.state.create_delay.lock()
    }

    /// Connections opened so far.
    pub fn created(&self) -> u64 {
        self.state.created.load(Ordering::SeqCst)
    }

    /// Connections closed so far.
    pub fn closed(&self) -> u64 {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Creates refused because of [`fail_creates`](Self::fail_creates).
    pub fn create_failures(&self) -> u64 {
        self.state.create_failures.load(Ordering::SeqCst)
    }

    /// Opened and not yet closed through the factory.
    pub fn open(&self) -> u64 {
        self.created() - self.closed()
    }

    /// Ids of closed connections, in close order.
    pub fn closed_ids(&self) -> Vec<u64> {
        self.state.closed_ids.lock().clone()
    }

    /// Most connections ever inside a [`Session`] at the same time.
    pub fn peak_in_use(&self) -> usize {
        self.state.peak_in_use.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MockFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockFactory")
            .field("created", &self.created())
            .field("closed", &self.closed())
            .finish()
    }
}

impl Factory for MockFactory {
    type Raw = MockConn;
    type Error = MockError;

    async fn create(&self) -> Result<MockConn, MockError> {
        let delay = self.create_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_creates.load(Ordering::SeqCst) {
            self.state.create_failures.fetch_add(1, Ordering::SeqCst);
            return Err(MockError("connection refused".to_string()));
        }
        let id = self.state.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockConn {
            id,
            state: Arc::clone(&self.state),
        })
    }

    async fn close(&self, conn: MockConn) -> Result<(), MockError> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        self.state.closed_ids.lock().push(conn.id);
        if self.state.fail_closes.load(Ordering::SeqCst) {
            return Err(MockError(format!("failed to close connection {}", conn.id)));
        }
        Ok(())
    }
}

/// A fake connection.
pub struct MockConn {
    id: u64,
    state: Arc<MockState>,
}

impl MockConn {
    /// Factory-assigned id, starting at 1.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Start using the connection.
    ///
    /// # Panics
    /// If another session on the same connection is still open.
    pub fn session(&self) -> Session<'_> {
        let mut in_use = self.state.in_use.lock();
        assert!(
            in_use.insert(self.id),
            "connection {} used by two borrowers at once",
            self.id
        );
        self.state.peak_in_use.fetch_max(in_use.len(), Ordering::SeqCst);
        Session { conn: self }
    }
}

impl std::fmt::Debug for MockConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConn").field("id", &self.id).finish()
    }
}

/// Marks a [`MockConn`] as in use until dropped.
#[derive(Debug)]
pub struct Session<'a> {
    conn: &'a MockConn,
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.conn.state.in_use.lock().remove(&self.conn.id);
    }
}

#[derive(Default)]
struct ToggleState {
    invalid: AtomicBool,
    panics: AtomicBool,
    delay: Mutex<Duration>,
    probes: AtomicU64,
}

/// Validator switched from the test. Valid by default.
#[derive(Clone, Default)]
pub struct ToggleValidator {
    state: Arc<ToggleState>,
}

impl ToggleValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_valid(&self, valid: bool) {
        self.state.invalid.store(!valid, Ordering::SeqCst);
    }

    /// Make every probe panic.
    pub fn set_panics(&self, panics: bool) {
        self.state.panics.store(panics, Ordering::SeqCst);
    }

    /// Sleep this long inside every probe.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    fn delay(&self) -> Duration {
        *self.state.delay.lock()
    }

    /// Probes run so far.
    pub fn probes(&self) -> u64 {
        self.state.probes.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ToggleValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToggleValidator")
            .field("valid", &!self.state.invalid.load(Ordering::SeqCst))
            .field("probes", &self.probes())
            .finish()
    }
}

impl<R: Sync> Validator<R> for ToggleValidator {
    async fn validate(&self, _raw: &R) -> bool {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        assert!(
            !self.state.panics.load(Ordering::SeqCst),
            "validator configured to panic"
        );
        !self.state.invalid.load(Ordering::SeqCst)
    }
}
