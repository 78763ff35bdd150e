//! Error types for juggler.

use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::queue::QueueError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("state {0} is not declared by this machine")]
    UndeclaredState(String),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("configuration error: {0}")]
    Config(String),

    /// Shutdown grace period elapsed while runners still had live jobs.
    #[error("shutdown grace {grace:?} exceeded; still running: {stuck:?}")]
    GraceExceeded { grace: Duration, stuck: Vec<String> },

    #[error("payload {0:?} is reserved for internal use")]
    ReservedPayload(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
