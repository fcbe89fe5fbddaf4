//! # Sluice
//!
//! A bounded, self-healing async pool for expensive reusable handles such as
//! database connections.
//!
//! - Borrowers get a validated handle within a bounded wait, or an error.
//! - At most `max_size` handles are ever alive; the factory is never asked
//!   for more.
//! - Stale handles are probed and replaced, idle ones above `core_size` are
//!   reaped, and handles held past a threshold are reported as leaks.
//! - A borrowed [`Handle`] dereferences to the raw resource; closing (or
//!   dropping) it returns it to the pool.

mod active;
pub mod config;
pub mod context;
pub mod entry;
pub mod error;
pub mod events;
pub mod factory;
mod idle;
mod maintenance;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod pool;
pub mod proxy;
pub mod stats;
pub mod testing;

pub use config::PoolConfig;
pub use context::Context;
pub use entry::{BorrowSite, HandleId};
pub use error::{BoxError, Error, Result};
pub use events::{DestroyReason, EventBus, PoolEvent};
pub use factory::{AlwaysValid, Factory, FnValidator, Validator, validator_fn};
pub use pool::Pool;
pub use proxy::Handle;
pub use stats::PoolStats;

#[cfg(feature = "metrics")]
pub use crate::metrics::{MetricsCollector, spawn_metrics_collector};
