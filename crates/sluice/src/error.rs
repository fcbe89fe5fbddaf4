//! Error types for pool operations
use std::time::Duration;

use thiserror::Error;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed source error carried by [`Error::Creation`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced to callers of the pool.
///
/// Validation failures never appear here: a handle that fails its probe is
/// destroyed and the borrow retries until it succeeds or its deadline runs
/// out, in which case the caller sees [`Error::Timeout`].
#[derive(Error, Debug)]
pub enum Error {
    /// Pool configuration is invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },

    /// No handle became available before the borrow deadline
    #[error("Timed out after {}ms waiting for a handle from pool '{pool}'", .waited.as_millis())]
    Timeout {
        /// The pool name
        pool: String,
        /// How long the caller waited
        waited: Duration,
        /// Handles alive when the borrow gave up
        total: usize,
        /// Configured capacity
        max_size: usize,
    },

    /// The factory failed while the pool was growing
    #[error("Failed to create a handle for pool '{pool}': {source}")]
    Creation {
        /// The pool name
        pool: String,
        /// The factory error
        #[source]
        source: BoxError,
    },

    /// The caller's cancellation token fired while it was waiting
    #[error("Borrow from pool '{pool}' was cancelled after {}ms", .waited.as_millis())]
    Cancelled {
        /// The pool name
        pool: String,
        /// How long the caller waited before cancelling
        waited: Duration,
    },

    /// The pool has been shut down
    #[error("Pool '{pool}' is closed")]
    Closed {
        /// The pool name
        pool: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a closed-pool error
    pub fn closed<S: Into<String>>(pool: S) -> Self {
        Self::Closed { pool: pool.into() }
    }

    /// Wrap a factory failure
    pub fn creation<S, E>(pool: S, source: E) -> Self
    where
        S: Into<String>,
        E: Into<BoxError>,
    {
        Self::Creation {
            pool: pool.into(),
            source: source.into(),
        }
    }

    /// Check if the caller may retry the operation
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Creation { .. } | Self::Cancelled { .. } => true,
            Self::Configuration { .. } | Self::Closed { .. } => false,
        }
    }

    /// Get the pool name associated with this error (if any)
    #[must_use]
    pub fn pool_name(&self) -> Option<&str> {
        match self {
            Self::Configuration { .. } => None,
            Self::Timeout { pool, .. }
            | Self::Creation { pool, .. }
            | Self::Cancelled { pool, .. }
            | Self::Closed { pool } => Some(pool),
        }
    }
}
