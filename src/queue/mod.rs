//! Queue client contract.
//!
//! The transport to a beanstalk-style server sits behind [`QueueClient`]. A
//! [`Connector`] hands out one client per logical connection; each Runner owns
//! its connection exclusively, the producer side shares one.
//!
//! [`memory`] provides an in-process server with the same semantics.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::model::{Job, JobId, JobStats, PutOptions};

/// Connection lifecycle as reported by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Why a reservation did not yield a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReserveError {
    /// A job reserved on this connection is within the server's safety
    /// margin of its time-to-run.
    #[error("deadline soon")]
    DeadlineSoon,

    #[error("disconnected")]
    Disconnected,

    #[error("reserve failed: {0}")]
    Other(String),
}

impl ReserveError {
    /// Short stable label for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ReserveError::DeadlineSoon => "deadline_soon",
            ReserveError::Disconnected => "disconnected",
            ReserveError::Other(_) => "other",
        }
    }
}

/// Failure of any other queue command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("disconnected")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One connection to the queue server.
#[async_trait]
pub trait QueueClient: Send + Sync + 'static {
    /// Subscribe to connection state changes.
    fn connection(&self) -> watch::Receiver<ConnectionState>;

    /// Establish the connection. State changes are published on
    /// [`QueueClient::connection`].
    async fn connect(&self) -> Result<(), QueueError>;

    /// Add `tube` to the set of tubes reservations pull from.
    async fn watch(&self, tube: &str) -> Result<(), QueueError>;

    /// Block until a job is available in a watched tube.
    async fn reserve(&self) -> Result<Job, ReserveError>;

    async fn put(&self, tube: &str, body: Vec<u8>, options: PutOptions) -> Result<JobId, QueueError>;

    async fn delete(&self, id: JobId) -> Result<(), QueueError>;

    /// Return a reserved job to its tube, reservable after `delay` seconds.
    async fn release(&self, id: JobId, delay: u32) -> Result<(), QueueError>;

    async fn bury(&self, id: JobId, priority: u32) -> Result<(), QueueError>;

    async fn stats(&self, id: JobId) -> Result<JobStats, QueueError>;
}

/// Opens connections to one queue server.
pub trait Connector: Send + Sync + 'static {
    fn open(&self) -> Arc<dyn QueueClient>;
}
