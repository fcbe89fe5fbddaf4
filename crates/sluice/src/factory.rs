//! Collaborator traits: how raw handles are opened, closed and probed.
//!
//! The pool never inspects a raw handle itself. It asks a [`Factory`] to open
//! and close them and a [`Validator`] whether one is still usable.

use std::future::Future;

/// Opens and closes raw handles (e.g. database connections).
///
/// ```rust,ignore
/// struct PgFactory { url: String }
///
/// impl Factory for PgFactory {
///     type Raw = PgConnection;
///     type Error = PgError;
///
///     async fn create(&self) -> Result<PgConnection, PgError> {
///         PgConnection::connect(&self.url).await
///     }
///
///     async fn close(&self, conn: PgConnection) -> Result<(), PgError> {
///         conn.close().await
///     }
/// }
/// ```
pub trait Factory: Send + Sync + 'static {
    /// The raw handle type.
    type Raw: Send + Sync + 'static;

    /// Error returned when opening or closing a handle fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open one raw handle.
    fn create(&self) -> impl Future<Output = Result<Self::Raw, Self::Error>> + Send;

    /// Close one raw handle. The default implementation drops it.
    fn close(&self, raw: Self::Raw) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move {
            drop(raw);
            Ok(())
        }
    }
}

/// Cheap liveness probe for a raw handle.
///
/// The pool bounds every probe by
/// [`PoolConfig::validation_timeout`](crate::PoolConfig::validation_timeout);
/// a probe that does not answer in time counts as a failure.
pub trait Validator<R>: Send + Sync + 'static {
    /// Return `true` if the handle can still be used.
    fn validate(&self, raw: &R) -> impl Future<Output = bool> + Send;
}

/// Validator that accepts every handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysValid;

impl<R: Sync> Validator<R> for AlwaysValid {
    async fn validate(&self, _raw: &R) -> bool {
        true
    }
}

/// Validator backed by a synchronous predicate.
///
/// Useful when the liveness check is a flag or a non-blocking socket poll.
#[derive(Debug, Clone, Copy)]
pub struct FnValidator<P>(P);

/// Build a [`Validator`] from a synchronous predicate.
pub fn validator_fn<R, P>(probe: P) -> FnValidator<P>
where
    P: Fn(&R) -> bool + Send + Sync + 'static,
{
    FnValidator(probe)
}

impl<R, P> Validator<R> for FnValidator<P>
where
    R: Sync,
    P: Fn(&R) -> bool + Send + Sync + 'static,
{
    async fn validate(&self, raw: &R) -> bool {
        (self.0)(raw)
    }
}
