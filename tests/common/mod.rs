//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use juggler::model::{Job, JobId, JobStats, PutOptions};
use juggler::policy::{ExceptionHandler, Policies};
use juggler::queue::memory::MemoryServer;
use juggler::queue::{ConnectionState, Connector, QueueClient, QueueError, ReserveError};
use juggler::{Config, Juggler};
use tokio::sync::watch;
use tokio::time::Instant;

/// A queue command observed by [`MockQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Stats(JobId),
    Delete(JobId),
    Release(JobId, u32),
    Bury(JobId, u32),
    Put(String, Vec<u8>),
}

/// Queue client that records every command and answers `stats` from a
/// fixture. `reserve` answers from a script, then blocks forever.
pub struct MockQueue {
    calls: Mutex<Vec<Call>>,
    stats: Mutex<Option<JobStats>>,
    fail_dispositions: bool,
    connection: watch::Sender<ConnectionState>,
    reserves: Mutex<VecDeque<Result<Job, ReserveError>>>,
    reserved_at: Mutex<Vec<Instant>>,
}

impl MockQueue {
    /// Stats report `time_left` seconds and a previous release `delay`.
    pub fn with_stats(time_left: u64, delay: u32) -> Arc<Self> {
        Arc::new(Self::build(Some(stats(JobId(1), time_left, delay)), false))
    }

    /// `stats` always fails.
    pub fn without_stats() -> Arc<Self> {
        Arc::new(Self::build(None, false))
    }

    /// Stats succeed, but delete/release/bury fail.
    pub fn failing_dispositions(time_left: u64) -> Arc<Self> {
        Arc::new(Self::build(Some(stats(JobId(1), time_left, 0)), true))
    }

    /// Stats report `time_left` seconds; reservations answer `script` in
    /// order.
    pub fn scripted(
        time_left: u64,
        script: impl IntoIterator<Item = Result<Job, ReserveError>>,
    ) -> Arc<Self> {
        let queue = Self::build(Some(stats(JobId(1), time_left, 0)), false);
        queue.reserves.lock().unwrap().extend(script);
        Arc::new(queue)
    }

    fn build(stats: Option<JobStats>, fail_dispositions: bool) -> Self {
        let (connection, _) = watch::channel(ConnectionState::Connected);
        Self {
            calls: Mutex::new(Vec::new()),
            stats: Mutex::new(stats),
            fail_dispositions,
            connection,
            reserves: Mutex::new(VecDeque::new()),
            reserved_at: Mutex::new(Vec::new()),
        }
    }

    /// When each `reserve` call was made.
    pub fn reserved_at(&self) -> Vec<Instant> {
        self.reserved_at.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls other than `Stats`.
    pub fn dispositions(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::Stats(_)))
            .collect()
    }

    fn record(&self, call: Call) -> Result<(), QueueError> {
        let disposition = !matches!(call, Call::Stats(_) | Call::Put(..));
        self.calls.lock().unwrap().push(call);
        if disposition && self.fail_dispositions {
            Err(QueueError::Protocol("INTERNAL_ERROR".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QueueClient for MockQueue {
    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    async fn connect(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn watch(&self, _tube: &str) -> Result<(), QueueError> {
        Ok(())
    }

    async fn reserve(&self) -> Result<Job, ReserveError> {
        self.reserved_at.lock().unwrap().push(Instant::now());
        let next = self.reserves.lock().unwrap().pop_front();
        match next {
            Some(answer) => answer,
            None => std::future::pending().await,
        }
    }

    async fn put(&self, tube: &str, body: Vec<u8>, _options: PutOptions) -> Result<JobId, QueueError> {
        self.record(Call::Put(tube.to_string(), body))?;
        Ok(JobId(99))
    }

    async fn delete(&self, id: JobId) -> Result<(), QueueError> {
        self.record(Call::Delete(id))
    }

    async fn release(&self, id: JobId, delay: u32) -> Result<(), QueueError> {
        self.record(Call::Release(id, delay))
    }

    async fn bury(&self, id: JobId, priority: u32) -> Result<(), QueueError> {
        self.record(Call::Bury(id, priority))
    }

    async fn stats(&self, id: JobId) -> Result<JobStats, QueueError> {
        self.record(Call::Stats(id))?;
        self.stats
            .lock()
            .unwrap()
            .clone()
            .map(|s| JobStats { id, ..s })
            .ok_or(QueueError::NotFound(id))
    }
}

pub fn stats(id: JobId, time_left: u64, delay: u32) -> JobStats {
    JobStats {
        id,
        tube: "test".to_string(),
        state: "reserved".to_string(),
        pri: 50,
        age: 0,
        delay,
        ttr: 62,
        time_left,
        reserves: 1,
        timeouts: 0,
        releases: 0,
        buries: 0,
    }
}

pub fn job(id: u64) -> Job {
    Job {
        id: JobId(id),
        body: br#""params""#.to_vec(),
    }
}

/// Exception handler that records `"{context}: {error}"` for every call.
pub fn recording_handler() -> (Arc<Mutex<Vec<String>>>, impl ExceptionHandler) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = move |e: &(dyn StdError + Send + Sync + 'static), ctx: &str| {
        sink.lock().unwrap().push(format!("{ctx}: {e}"));
    };
    (seen, handler)
}

pub fn policies_with(handler: impl ExceptionHandler) -> Policies {
    Policies {
        exceptions: Arc::new(handler),
        ..Policies::default()
    }
}

/// Config with short shutdown timings for tests.
pub fn test_config() -> Config {
    Config {
        shutdown_grace: Duration::from_secs(2),
        shutdown_poll_interval: Duration::from_millis(100),
        timeout_poll_interval: Duration::from_millis(500),
        reserve_retry_delay: Duration::from_secs(1),
        ..Config::default()
    }
}

/// A context wired to a fresh in-memory server.
pub fn memory_juggler() -> (MemoryServer, Juggler) {
    memory_juggler_with(test_config())
}

pub fn memory_juggler_with(config: Config) -> (MemoryServer, Juggler) {
    let server = MemoryServer::default();
    let juggler = Juggler::builder()
        .config(config)
        .connector(server.clone())
        .build()
        .unwrap();
    (server, juggler)
}

/// Hands out [`MemoryServer`] clients whose first `watch` across all of them
/// fails with a protocol error.
#[derive(Clone)]
pub struct FirstWatchFails {
    pub server: MemoryServer,
    pub watches: Arc<AtomicUsize>,
}

impl FirstWatchFails {
    pub fn new(server: MemoryServer) -> Self {
        Self {
            server,
            watches: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Connector for FirstWatchFails {
    fn open(&self) -> Arc<dyn QueueClient> {
        Arc::new(FlakyWatchClient {
            inner: self.server.client(),
            watches: Arc::clone(&self.watches),
        })
    }
}

struct FlakyWatchClient {
    inner: Arc<dyn QueueClient>,
    watches: Arc<AtomicUsize>,
}

#[async_trait]
impl QueueClient for FlakyWatchClient {
    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection()
    }

    async fn connect(&self) -> Result<(), QueueError> {
        self.inner.connect().await
    }

    async fn watch(&self, tube: &str) -> Result<(), QueueError> {
        if self.watches.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(QueueError::Protocol("BAD_FORMAT".to_string()));
        }
        self.inner.watch(tube).await
    }

    async fn reserve(&self) -> Result<Job, ReserveError> {
        self.inner.reserve().await
    }

    async fn put(&self, tube: &str, body: Vec<u8>, options: PutOptions) -> Result<JobId, QueueError> {
        self.inner.put(tube, body, options).await
    }

    async fn delete(&self, id: JobId) -> Result<(), QueueError> {
        self.inner.delete(id).await
    }

    async fn release(&self, id: JobId, delay: u32) -> Result<(), QueueError> {
        self.inner.release(id, delay).await
    }

    async fn bury(&self, id: JobId, priority: u32) -> Result<(), QueueError> {
        self.inner.bury(id, priority).await
    }

    async fn stats(&self, id: JobId) -> Result<JobStats, QueueError> {
        self.inner.stats(id).await
    }
}
