//! Hook for errors raised by strategy code.
//!
//! A strategy that panics, or that hands an error to
//! [`Deferred::raise`](crate::strategy::Deferred::raise), is reported here
//! before its job is treated as an ordinary retryable failure.

use std::any::Any;
use std::error::Error as StdError;

use thiserror::Error;
use tracing::error;

/// Receives errors raised by strategies.
pub trait ExceptionHandler: Send + Sync + 'static {
    /// `context` names where the error surfaced, e.g. `"job 12: calling strategy"`.
    fn handle(&self, error: &(dyn StdError + Send + Sync + 'static), context: &str);
}

impl<F> ExceptionHandler for F
where
    F: Fn(&(dyn StdError + Send + Sync + 'static), &str) + Send + Sync + 'static,
{
    fn handle(&self, error: &(dyn StdError + Send + Sync + 'static), context: &str) {
        self(error, context)
    }
}

/// Default handler: log and carry on.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogExceptions;

impl ExceptionHandler for LogExceptions {
    fn handle(&self, error: &(dyn StdError + Send + Sync + 'static), context: &str) {
        error!(context, error = %error, "exception in strategy");
    }
}

/// A panic caught while running strategy code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("strategy panicked: {message}")]
pub struct StrategyPanic {
    pub message: String,
}

impl StrategyPanic {
    /// Extract the panic message from a `catch_unwind` payload.
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&'static str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn panic_payload_messages() {
        let caught = std::panic::catch_unwind(|| panic!("FAIL")).unwrap_err();
        assert_eq!(StrategyPanic::from_payload(caught).message, "FAIL");

        let caught = std::panic::catch_unwind(|| panic!("job {} broke", 3)).unwrap_err();
        assert_eq!(StrategyPanic::from_payload(caught).message, "job 3 broke");

        let caught = std::panic::catch_unwind(|| std::panic::panic_any(42_u8)).unwrap_err();
        assert_eq!(
            StrategyPanic::from_payload(caught).message,
            "unknown panic payload"
        );
    }

    #[test]
    fn closures_are_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |e: &(dyn StdError + Send + Sync + 'static), ctx: &str| {
            sink.lock().unwrap().push(format!("{ctx}: {e}"));
        };

        let panic = StrategyPanic {
            message: "FAIL".into(),
        };
        handler.handle(&panic, "job 1");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["job 1: strategy panicked: FAIL".to_string()]
        );
    }
}
