//! In-process queue server with beanstalk semantics.
//!
//! Tubes hold jobs ordered by priority (lower first), then by id. A reserved
//! job belongs to the connection that reserved it until it is deleted,
//! released or buried, or until its time-to-run elapses and the server puts it
//! back. A blocked reservation answers DEADLINE_SOON when one of the
//! connection's own jobs is within [`SAFETY_MARGIN`] of its deadline.
//!
//! Time comes from `tokio::time`, so tests can pause and advance the clock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, watch};
use tokio::time::{self, Instant};
use tracing::debug;

use super::{ConnectionState, Connector, QueueClient, QueueError, ReserveError};
use crate::model::{Job, JobId, JobStats, PutOptions};

/// Window before a reservation's deadline in which DEADLINE_SOON is reported.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(1);

/// Tube every connection watches initially.
pub const DEFAULT_TUBE: &str = "default";

/// Where a job currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Ready,
    Delayed,
    Reserved,
    Buried,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Ready => "ready",
            JobStatus::Delayed => "delayed",
            JobStatus::Reserved => "reserved",
            JobStatus::Buried => "buried",
        }
    }
}

/// Server-wide command counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub puts: u64,
    pub reserves: u64,
    pub deletes: u64,
    pub releases: u64,
    pub buries: u64,
    /// Reservations reclaimed because their time-to-run elapsed.
    pub timeouts: u64,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Ready,
    Delayed { until: Instant },
    Reserved { by: u64, deadline: Instant },
    Buried,
}

impl Slot {
    fn status(self) -> JobStatus {
        match self {
            Slot::Ready => JobStatus::Ready,
            Slot::Delayed { .. } => JobStatus::Delayed,
            Slot::Reserved { .. } => JobStatus::Reserved,
            Slot::Buried => JobStatus::Buried,
        }
    }

    fn reserved_by(self, client: u64) -> bool {
        matches!(self, Slot::Reserved { by, .. } if by == client)
    }

    fn after_delay(delay: u32, now: Instant) -> Self {
        if delay == 0 {
            Slot::Ready
        } else {
            Slot::Delayed {
                until: now + Duration::from_secs(delay.into()),
            }
        }
    }
}

#[derive(Debug)]
struct Entry {
    tube: String,
    priority: u32,
    body: Vec<u8>,
    ttr: u32,
    delay: u32,
    slot: Slot,
    created: Instant,
    reserves: u32,
    timeouts: u32,
    releases: u32,
    buries: u32,
}

#[derive(Debug, Default)]
struct State {
    next_job: u64,
    jobs: BTreeMap<JobId, Entry>,
    counters: ServerStats,
}

impl State {
    /// Promote due delayed jobs and reclaim expired reservations.
    fn maintain(&mut self, now: Instant) {
        for (id, entry) in self.jobs.iter_mut() {
            match entry.slot {
                Slot::Delayed { until } if until <= now => entry.slot = Slot::Ready,
                Slot::Reserved { deadline, .. } if deadline <= now => {
                    debug!(job = %id, "reservation expired, job back to ready");
                    entry.slot = Slot::Ready;
                    entry.timeouts += 1;
                    self.counters.timeouts += 1;
                }
                _ => {}
            }
        }
    }

    fn take_ready(&mut self, watched: &[String], client: u64, now: Instant) -> Option<Job> {
        let id = self
            .jobs
            .iter()
            .filter(|(_, e)| matches!(e.slot, Slot::Ready) && watched.contains(&e.tube))
            .min_by_key(|(id, e)| (e.priority, **id))
            .map(|(id, _)| *id)?;

        let entry = self.jobs.get_mut(&id)?;
        entry.slot = Slot::Reserved {
            by: client,
            deadline: now + Duration::from_secs(entry.ttr.max(1).into()),
        };
        entry.reserves += 1;
        self.counters.reserves += 1;

        Some(Job {
            id,
            body: entry.body.clone(),
        })
    }

    fn deadline_soon(&self, client: u64, now: Instant) -> bool {
        self.jobs.values().any(|e| match e.slot {
            Slot::Reserved { by, deadline } => {
                by == client && deadline.saturating_duration_since(now) <= SAFETY_MARGIN
            }
            _ => false,
        })
    }

    /// Earliest instant at which a blocked reservation could change outcome.
    fn next_wake(&self, client: u64) -> Option<Instant> {
        self.jobs
            .values()
            .filter_map(|e| match e.slot {
                Slot::Delayed { until } => Some(until),
                Slot::Reserved { by, deadline } if by == client => {
                    Some(deadline.checked_sub(SAFETY_MARGIN).unwrap_or(deadline))
                }
                Slot::Reserved { deadline, .. } => Some(deadline),
                _ => None,
            })
            .min()
    }

    /// Return every job reserved by `client` to ready.
    fn abandon(&mut self, client: Option<u64>) {
        for entry in self.jobs.values_mut() {
            if let Slot::Reserved { by, .. } = entry.slot {
                if client.is_none_or(|c| c == by) {
                    entry.slot = Slot::Ready;
                }
            }
        }
    }

    fn stats(&self, id: JobId, now: Instant) -> Option<JobStats> {
        let entry = self.jobs.get(&id)?;
        let time_left = match entry.slot {
            Slot::Reserved { deadline, .. } => deadline.saturating_duration_since(now),
            Slot::Delayed { until } => until.saturating_duration_since(now),
            _ => Duration::ZERO,
        };

        Some(JobStats {
            id,
            tube: entry.tube.clone(),
            state: entry.slot.status().as_str().to_string(),
            pri: entry.priority,
            age: now.saturating_duration_since(entry.created).as_secs(),
            delay: entry.delay,
            ttr: entry.ttr,
            time_left: time_left.as_secs(),
            reserves: entry.reserves,
            timeouts: entry.timeouts,
            releases: entry.releases,
            buries: entry.buries,
        })
    }
}

#[derive(Debug)]
struct Link {
    id: u64,
    connection: watch::Sender<ConnectionState>,
    watched: Mutex<Vec<String>>,
}

#[derive(Debug)]
struct Shared {
    address: String,
    state: Mutex<State>,
    changed: Notify,
    reachable: AtomicBool,
    next_client: AtomicU64,
    links: Mutex<Vec<Weak<Link>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_links(&self) -> Vec<Arc<Link>> {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        links.retain(|l| l.strong_count() > 0);
        links.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Handle to an in-process queue server. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MemoryServer {
    shared: Arc<Shared>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryServer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                address: address.into(),
                state: Mutex::new(State::default()),
                changed: Notify::new(),
                reachable: AtomicBool::new(true),
                next_client: AtomicU64::new(1),
                links: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Open a new connection. It starts in [`ConnectionState::Connecting`].
    pub fn client(&self) -> Arc<MemoryClient> {
        let (connection, _) = watch::channel(ConnectionState::Connecting);
        let link = Arc::new(Link {
            id: self.shared.next_client.fetch_add(1, Ordering::Relaxed),
            connection,
            watched: Mutex::new(vec![DEFAULT_TUBE.to_string()]),
        });
        self.shared
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&link));

        Arc::new(MemoryClient {
            shared: Arc::clone(&self.shared),
            link,
        })
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.lock().counters
    }

    /// `stats-job` without a connection.
    pub fn job(&self, id: JobId) -> Option<JobStats> {
        let now = Instant::now();
        let mut state = self.shared.lock();
        state.maintain(now);
        state.stats(id, now)
    }

    /// Number of jobs in `status`, across all tubes.
    pub fn count(&self, status: JobStatus) -> usize {
        let mut state = self.shared.lock();
        state.maintain(Instant::now());
        state
            .jobs
            .values()
            .filter(|e| e.slot.status() == status)
            .count()
    }

    /// True when no job is ready, delayed or reserved. Buried jobs remain.
    pub fn is_drained(&self) -> bool {
        let mut state = self.shared.lock();
        state.maintain(Instant::now());
        state
            .jobs
            .values()
            .all(|e| matches!(e.slot, Slot::Buried))
    }

    /// Drop every connection. Reserved jobs go back to ready, and further
    /// connects fail until [`MemoryServer::restore_connections`].
    pub fn sever_connections(&self) {
        self.shared.reachable.store(false, Ordering::SeqCst);
        self.shared.lock().abandon(None);
        for link in self.shared.live_links() {
            link.connection.send_replace(ConnectionState::Disconnected);
        }
        self.shared.changed.notify_waiters();
    }

    /// Accept connections again and reconnect every dropped client.
    pub fn restore_connections(&self) {
        self.shared.reachable.store(true, Ordering::SeqCst);
        for link in self.shared.live_links() {
            if *link.connection.borrow() == ConnectionState::Disconnected {
                link.connection.send_replace(ConnectionState::Connected);
            }
        }
        self.shared.changed.notify_waiters();
    }
}

impl Connector for MemoryServer {
    fn open(&self) -> Arc<dyn QueueClient> {
        self.client()
    }
}

/// One connection to a [`MemoryServer`].
#[derive(Debug)]
pub struct MemoryClient {
    shared: Arc<Shared>,
    link: Arc<Link>,
}

impl MemoryClient {
    fn ensure_connected(&self) -> Result<(), QueueError> {
        if *self.link.connection.borrow() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(QueueError::Disconnected)
        }
    }

    fn watched(&self) -> Vec<String> {
        self.link
            .watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `f` to a job this connection holds in reservation.
    fn with_reserved<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Entry, &mut ServerStats, Instant) -> T,
    ) -> Result<T, QueueError> {
        self.ensure_connected()?;
        let now = Instant::now();
        let result = {
            let mut state = self.shared.lock();
            state.maintain(now);
            let State { jobs, counters, .. } = &mut *state;
            match jobs.get_mut(&id) {
                Some(entry) if entry.slot.reserved_by(self.link.id) => f(entry, counters, now),
                _ => return Err(QueueError::NotFound(id)),
            }
        };
        self.shared.changed.notify_waiters();
        Ok(result)
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.shared.lock().abandon(Some(self.link.id));
        self.shared.changed.notify_waiters();
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl QueueClient for MemoryClient {
    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.link.connection.subscribe()
    }

    async fn connect(&self) -> Result<(), QueueError> {
        if self.shared.reachable.load(Ordering::SeqCst) {
            self.link.connection.send_replace(ConnectionState::Connected);
            Ok(())
        } else {
            self.link
                .connection
                .send_replace(ConnectionState::Disconnected);
            Err(QueueError::Disconnected)
        }
    }

    async fn watch(&self, tube: &str) -> Result<(), QueueError> {
        self.ensure_connected()?;
        let mut watched = self
            .link
            .watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !watched.iter().any(|t| t == tube) {
            watched.push(tube.to_string());
        }
        Ok(())
    }

    async fn reserve(&self) -> Result<Job, ReserveError> {
        let mut connection = self.link.connection.subscribe();

        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if *connection.borrow_and_update() != ConnectionState::Connected {
                return Err(ReserveError::Disconnected);
            }

            let watched = self.watched();
            let wake = {
                let now = Instant::now();
                let mut state = self.shared.lock();
                state.maintain(now);
                if let Some(job) = state.take_ready(&watched, self.link.id, now) {
                    return Ok(job);
                }
                if state.deadline_soon(self.link.id, now) {
                    return Err(ReserveError::DeadlineSoon);
                }
                state.next_wake(self.link.id)
            };

            tokio::select! {
                () = &mut notified => {}
                _ = connection.changed() => {}
                () = sleep_until(wake) => {}
            }
        }
    }

    async fn put(&self, tube: &str, body: Vec<u8>, options: PutOptions) -> Result<JobId, QueueError> {
        self.ensure_connected()?;
        let now = Instant::now();
        let id = {
            let mut state = self.shared.lock();
            state.next_job += 1;
            let id = JobId(state.next_job);
            state.jobs.insert(
                id,
                Entry {
                    tube: tube.to_string(),
                    priority: options.priority,
                    body,
                    ttr: options.ttr.max(1),
                    delay: options.delay,
                    slot: Slot::after_delay(options.delay, now),
                    created: now,
                    reserves: 0,
                    timeouts: 0,
                    releases: 0,
                    buries: 0,
                },
            );
            state.counters.puts += 1;
            id
        };
        self.shared.changed.notify_waiters();
        Ok(id)
    }

    async fn delete(&self, id: JobId) -> Result<(), QueueError> {
        self.ensure_connected()?;
        {
            let mut state = self.shared.lock();
            match state.jobs.get(&id) {
                Some(entry) => match entry.slot {
                    Slot::Reserved { by, .. } if by != self.link.id => {
                        return Err(QueueError::NotFound(id));
                    }
                    _ => {}
                },
                None => return Err(QueueError::NotFound(id)),
            }
            state.jobs.remove(&id);
            state.counters.deletes += 1;
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn release(&self, id: JobId, delay: u32) -> Result<(), QueueError> {
        self.with_reserved(id, |entry, counters, now| {
            entry.delay = delay;
            entry.slot = Slot::after_delay(delay, now);
            entry.releases += 1;
            counters.releases += 1;
        })
    }

    async fn bury(&self, id: JobId, priority: u32) -> Result<(), QueueError> {
        self.with_reserved(id, |entry, counters, _| {
            entry.priority = priority;
            entry.slot = Slot::Buried;
            entry.buries += 1;
            counters.buries += 1;
        })
    }

    async fn stats(&self, id: JobId) -> Result<JobStats, QueueError> {
        self.ensure_connected()?;
        let now = Instant::now();
        let mut state = self.shared.lock();
        state.maintain(now);
        state.stats(id, now).ok_or(QueueError::NotFound(id))
    }
}
