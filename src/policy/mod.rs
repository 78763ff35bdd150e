//! Process-wide policies applied to every job: how failures decay and where
//! strategy errors are reported.

pub mod backoff;
pub mod exception;

use std::sync::Arc;

pub use backoff::{Backoff, Decay, Decision};
pub use exception::{ExceptionHandler, LogExceptions, StrategyPanic};

/// The policies a JobRunner consults, shared by every runner in the process.
#[derive(Clone)]
pub struct Policies {
    pub backoff: Arc<dyn Backoff>,
    pub exceptions: Arc<dyn ExceptionHandler>,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            backoff: Arc::new(Decay::default()),
            exceptions: Arc::new(LogExceptions),
        }
    }
}

impl std::fmt::Debug for Policies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policies").finish_non_exhaustive()
    }
}
