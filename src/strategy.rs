//! Worker strategies and the deferred result they resolve.
//!
//! A strategy is called once per job with a [`Deferred`] and the job's
//! params. It returns immediately; the work finishes whenever the deferred
//! is resolved, possibly from another task. Resolution consumes the deferred,
//! so a job is resolved at most once. Dropping it unresolved counts as a
//! retryable failure.
//!
//! If the job times out first, the deferred's [`Deferred::timeout`] token is
//! cancelled so the strategy can tear down its own timers and tasks; a late
//! resolution is ignored.

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::model::{Failure, StrategyResult};
use crate::policy::{ExceptionHandler, StrategyPanic};

/// Single-use handle through which a strategy reports its outcome.
pub struct Deferred {
    sender: oneshot::Sender<StrategyResult>,
    timeout: CancellationToken,
    exceptions: Arc<dyn ExceptionHandler>,
    context: String,
}

impl Deferred {
    pub(crate) fn new(
        timeout: CancellationToken,
        exceptions: Arc<dyn ExceptionHandler>,
        context: String,
    ) -> (Self, oneshot::Receiver<StrategyResult>) {
        let (sender, receiver) = oneshot::channel();
        let deferred = Self {
            sender,
            timeout,
            exceptions,
            context,
        };
        (deferred, receiver)
    }

    pub fn succeed(self) {
        self.resolve(Ok(()));
    }

    /// Fail; the job is released and retried later.
    pub fn fail(self, reason: impl Into<String>) {
        self.resolve(Err(Failure::retry(reason)));
    }

    /// Fail permanently; the job is deleted.
    pub fn fail_no_retry(self, reason: impl Into<String>) {
        self.resolve(Err(Failure::no_retry(reason)));
    }

    pub fn resolve(self, result: StrategyResult) {
        // The receiver is gone once the job timed out.
        let _ = self.sender.send(result);
    }

    /// Report an error to the process exception handler, then fail retryably.
    pub fn raise(self, error: &(dyn std::error::Error + Send + Sync + 'static)) {
        self.exceptions.handle(error, &self.context);
        self.resolve(Err(Failure::retry(error.to_string())));
    }

    /// Cancelled when the job times out.
    pub fn timeout(&self) -> CancellationToken {
        self.timeout.clone()
    }

    pub fn is_timed_out(&self) -> bool {
        self.timeout.is_cancelled()
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("context", &self.context)
            .field("timed_out", &self.is_timed_out())
            .finish_non_exhaustive()
    }
}

/// Handles one job. Must not block; long work belongs on another task.
pub trait Strategy<P>: Send + Sync + 'static {
    fn call(&self, deferred: Deferred, params: P);
}

impl<P, F> Strategy<P> for F
where
    F: Fn(Deferred, P) + Send + Sync + 'static,
{
    fn call(&self, deferred: Deferred, params: P) {
        self(deferred, params)
    }
}

/// Strategy built from an async function; see [`from_async`].
pub struct AsyncStrategy<F, P> {
    f: F,
    _params: PhantomData<fn(P)>,
}

/// Adapt `async fn(params, timeout) -> StrategyResult` into a [`Strategy`].
///
/// Each call spawns the future on the current tokio runtime. A panic inside
/// it goes to the exception handler and fails the job retryably.
pub fn from_async<P, F, Fut>(f: F) -> AsyncStrategy<F, P>
where
    P: Send + 'static,
    F: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StrategyResult> + Send + 'static,
{
    AsyncStrategy {
        f,
        _params: PhantomData,
    }
}

impl<P, F, Fut> Strategy<P> for AsyncStrategy<F, P>
where
    P: Send + 'static,
    F: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StrategyResult> + Send + 'static,
{
    fn call(&self, deferred: Deferred, params: P) {
        let work = (self.f)(params, deferred.timeout());
        tokio::spawn(async move {
            match AssertUnwindSafe(work).catch_unwind().await {
                Ok(result) => deferred.resolve(result),
                Err(payload) => deferred.raise(&StrategyPanic::from_payload(payload)),
            }
        });
    }
}
