//! Reservation loop and bounded worker pool for one tube.
//!
//! A Runner is a single tokio task that owns its running set and flags.
//! Everything that touches them arrives as a `Message` on its mailbox:
//! reservation results, JobRunner state changes, retry timers and `stop`.
//! Queue round-trips run on helper tasks that post their result back, so at
//! most one reservation is ever in flight and the running set is never
//! shared.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, mpsc};
use tokio::time::{self, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::job_runner::JobRunner;
use crate::codec::{Codec, is_stop_sentinel, stop_sentinel};
use crate::model::{Job, JobId, JobState, PutOptions};
use crate::policy::Policies;
use crate::queue::{ConnectionState, QueueClient, ReserveError};
use crate::strategy::Strategy;
use crate::telemetry::metrics;

/// Immutable settings of one Runner.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub tube: String,
    /// Upper bound on simultaneously live JobRunners. A Runner with 0 never
    /// reserves.
    pub concurrency: usize,
    /// How often every running job's deadline is re-checked.
    pub timeout_poll_interval: Duration,
    /// Pause before reserving again after an unexpected reservation error or
    /// DEADLINE_SOON.
    pub reserve_retry_delay: Duration,
}

/// Collaborators a Runner needs besides its own connection.
#[derive(Clone)]
pub struct RunnerDeps {
    pub codec: Arc<dyn Codec>,
    pub policies: Policies,
    /// Connection the stop sentinel is put through. Must not be the Runner's
    /// own connection, which is blocked in `reserve`.
    pub producer: Arc<dyn QueueClient>,
}

impl std::fmt::Debug for RunnerDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerDeps").finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum Message {
    /// Connected and watching the tube.
    Subscribed,
    /// Connect or watch failed without the client reporting a disconnect.
    SubscribeFailed,
    /// Subscribe retry delay elapsed.
    Resubscribe,
    Reserved(Result<Job, ReserveError>),
    /// Retry delay elapsed.
    Retry,
    JobRunning(JobId),
    JobDone(JobId),
    Stop,
}

/// Cheap, cloneable handle to a spawned Runner.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    tube: Arc<str>,
    mailbox: mpsc::UnboundedSender<Message>,
    live: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
}

impl RunnerHandle {
    pub fn tube(&self) -> &str {
        &self.tube
    }

    /// Stop reserving. In-flight jobs run to completion. Safe to call more
    /// than once.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        // The runner may already have exited, in which case there is nothing
        // left to stop.
        let _ = self.mailbox.send(Message::Stop);
    }

    /// True while at least one JobRunner is live.
    pub fn is_running(&self) -> bool {
        self.live.load(Ordering::SeqCst) > 0
    }

    pub fn running_jobs(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// The actor. Created and consumed by [`spawn`].
struct Runner<P> {
    settings: RunnerSettings,
    strategy: Arc<dyn Strategy<P>>,
    client: Arc<dyn QueueClient>,
    deps: RunnerDeps,
    mailbox: mpsc::UnboundedSender<Message>,

    on: bool,
    connected: bool,
    subscribing: bool,
    reserving: bool,
    backing_off: bool,
    sentinel_sent: bool,
    running: HashMap<JobId, Arc<Notify>>,
    /// Mirrors `running.len()` for handles.
    live: Arc<AtomicUsize>,
}

/// Start a Runner for `settings.tube` on `client`, which becomes exclusive to
/// it. Reservation begins as soon as the client is connected.
pub fn spawn<P>(
    settings: RunnerSettings,
    strategy: Arc<dyn Strategy<P>>,
    client: Arc<dyn QueueClient>,
    deps: RunnerDeps,
) -> RunnerHandle
where
    P: DeserializeOwned + Send + 'static,
{
    let (mailbox, inbox) = mpsc::unbounded_channel();
    let live = Arc::new(AtomicUsize::new(0));
    let handle = RunnerHandle {
        tube: Arc::from(settings.tube.as_str()),
        mailbox: mailbox.clone(),
        live: Arc::clone(&live),
        stopping: Arc::new(AtomicBool::new(false)),
    };

    let span = info_span!("runner", tube = %settings.tube);
    let runner = Runner {
        settings,
        strategy,
        client,
        deps,
        mailbox,
        on: true,
        connected: false,
        subscribing: false,
        reserving: false,
        backing_off: false,
        sentinel_sent: false,
        running: HashMap::new(),
        live,
    };
    tokio::spawn(runner.run(inbox).instrument(span));

    handle
}

impl<P> Runner<P>
where
    P: DeserializeOwned + Send + 'static,
{
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Message>) {
        info!(concurrency = self.settings.concurrency, "runner started");

        let mut connection = self.client.connection();
        self.subscribe();

        let mut sweep = time::interval(self.settings.timeout_poll_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.finished() {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                changed = connection.changed() => {
                    if changed.is_err() {
                        warn!("connection dropped for good");
                        break;
                    }
                    let state = *connection.borrow_and_update();
                    self.on_connection(state);
                }
                _ = sweep.tick() => self.check_all_reserved_jobs(),
            }
        }

        info!("runner stopped");
    }

    /// Stopped with nothing left in flight.
    fn finished(&self) -> bool {
        !self.on && !self.reserving && self.running.is_empty()
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Subscribed => {
                self.subscribing = false;
                self.connected = true;
                self.reserve_if_necessary();
            }
            Message::SubscribeFailed => {
                self.subscribing = false;
                if self.on {
                    self.send_after(Message::Resubscribe);
                }
            }
            Message::Resubscribe => {
                if self.on && !self.connected && !self.subscribing {
                    self.subscribe();
                }
            }
            Message::Reserved(Ok(job)) => {
                self.reserving = false;
                self.accept(job);
                self.reserve_if_necessary();
            }
            Message::Reserved(Err(e)) => {
                self.reserving = false;
                self.on_reserve_error(e);
            }
            Message::Retry => {
                self.backing_off = false;
                self.reserve_if_necessary();
            }
            Message::JobRunning(_) => self.reserve_if_necessary(),
            Message::JobDone(id) => {
                if self.running.remove(&id).is_some() {
                    self.live.fetch_sub(1, Ordering::SeqCst);
                    debug!(job = %id, running = self.running.len(), "slot freed");
                }
                self.reserve_if_necessary();
            }
            Message::Stop => self.stop(),
        }
    }

    fn on_connection(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected if !self.connected && !self.subscribing => {
                info!("reconnected");
                self.subscribe();
            }
            ConnectionState::Disconnected => {
                if self.connected {
                    warn!("disconnected, reservations paused");
                }
                self.connected = false;
                self.subscribing = false;
            }
            _ => {}
        }
    }

    /// Connect if needed and watch the tube, then report `Subscribed`. On
    /// failure report `SubscribeFailed` so the attempt is repeated after
    /// `reserve_retry_delay`.
    fn subscribe(&mut self) {
        self.subscribing = true;
        let client = Arc::clone(&self.client);
        let tube = self.settings.tube.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(
            async move {
                let state = *client.connection().borrow();
                if state != ConnectionState::Connected {
                    if let Err(e) = client.connect().await {
                        warn!(error = %e, "connect failed, retrying");
                        let _ = mailbox.send(Message::SubscribeFailed);
                        return;
                    }
                }
                let message = match client.watch(&tube).await {
                    Ok(()) => Message::Subscribed,
                    Err(e) => {
                        warn!(error = %e, "watch failed, retrying");
                        Message::SubscribeFailed
                    }
                };
                let _ = mailbox.send(message);
            }
            .in_current_span(),
        );
    }

    /// Reserve iff on, connected, not already reserving and below the
    /// concurrency limit.
    fn reserve_if_necessary(&mut self) {
        if !self.on
            || !self.connected
            || self.reserving
            || self.backing_off
            || self.running.len() >= self.settings.concurrency
        {
            return;
        }

        debug!(running = self.running.len(), "reserving");
        self.reserving = true;
        let client = Arc::clone(&self.client);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = client.reserve().await;
            let _ = mailbox.send(Message::Reserved(result));
        });
    }

    fn on_reserve_error(&mut self, error: ReserveError) {
        metrics::reserve_errors().add(
            1,
            &[
                KeyValue::new("tube", self.settings.tube.clone()),
                KeyValue::new("error", error.as_label()),
            ],
        );

        match error {
            ReserveError::DeadlineSoon => {
                // Usually a finished job waiting on the blocked reserve, not a
                // stuck one. Reserving again at once would hit the same answer.
                debug!("reserve terminated (deadline soon)");
                self.check_all_reserved_jobs();
                self.retry_later();
            }
            ReserveError::Disconnected => {
                warn!("reserve terminated (disconnected)");
                self.connected = false;
                // Already back up: the watch update may have been coalesced.
                if *self.client.connection().borrow() == ConnectionState::Connected
                    && !self.subscribing
                {
                    self.subscribe();
                }
            }
            ReserveError::Other(reason) => {
                error!(error = %reason, "unexpected reserve error");
                self.retry_later();
            }
        }
    }

    fn retry_later(&mut self) {
        self.backing_off = true;
        self.send_after(Message::Retry);
    }

    /// Post `message` to this Runner once `reserve_retry_delay` has elapsed.
    fn send_after(&self, message: Message) {
        let mailbox = self.mailbox.clone();
        let delay = self.settings.reserve_retry_delay;
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = mailbox.send(message);
        });
    }

    /// Ask every running job to compare its cached deadline with the clock.
    fn check_all_reserved_jobs(&self) {
        for probe in self.running.values() {
            probe.notify_one();
        }
    }

    fn accept(&mut self, job: Job) {
        let value = match self.deps.codec.decode(&job.body) {
            Ok(value) => value,
            Err(e) => return self.discard_poison(job.id, &e),
        };

        if is_stop_sentinel(&value) {
            debug!(job = %job.id, "stop sentinel reserved");
            self.delete_quietly(job.id);
            return;
        }

        let params: P = match serde_json::from_value(value) {
            Ok(params) => params,
            Err(e) => return self.discard_poison(job.id, &e),
        };

        self.start(job, params);
    }

    /// An undecodable job can never succeed, so it is deleted, not retried.
    fn discard_poison(&self, id: JobId, error: &dyn std::error::Error) {
        error!(job = %id, error = %error, "undecodable payload, deleting");
        metrics::poison_payloads().add(1, &[KeyValue::new("tube", self.settings.tube.clone())]);
        self.delete_quietly(id);
    }

    fn delete_quietly(&self, id: JobId) {
        let client = Arc::clone(&self.client);
        tokio::spawn(
            async move {
                if let Err(e) = client.delete(id).await {
                    warn!(job = %id, error = %e, "delete failed");
                }
            }
            .in_current_span(),
        );
    }

    fn start(&mut self, job: Job, params: P) {
        let id = job.id;
        let mut job_runner = JobRunner::new(
            job,
            &self.settings.tube,
            params,
            Arc::clone(&self.strategy),
            Arc::clone(&self.client),
            self.deps.policies.clone(),
        );

        let mailbox = self.mailbox.clone();
        job_runner.bind(JobState::Running, move |r| {
            let _ = mailbox.send(Message::JobRunning(r.id()));
        });
        let mailbox = self.mailbox.clone();
        job_runner.bind(JobState::Done, move |r| {
            let _ = mailbox.send(Message::JobDone(r.id()));
        });

        let probe = Arc::new(Notify::new());
        self.running.insert(id, Arc::clone(&probe));
        self.live.fetch_add(1, Ordering::SeqCst);
        metrics::jobs_reserved().add(1, &[KeyValue::new("tube", self.settings.tube.clone())]);
        debug!(job = %id, running = self.running.len(), "executing");

        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            match job_runner.drive(probe).await {
                Ok(JobState::Done) => {}
                Ok(state) => {
                    warn!(job = %id, %state, "job runner stopped before done");
                    let _ = mailbox.send(Message::JobDone(id));
                }
                Err(e) => {
                    error!(job = %id, error = %e, "job runner failed");
                    let _ = mailbox.send(Message::JobDone(id));
                }
            }
        });
    }

    /// Stop reserving. A blocked reservation on this Runner's connection has
    /// no cancel, so a sentinel job is put on the tube to answer it.
    fn stop(&mut self) {
        self.on = false;
        info!(running = self.running.len(), "stopping");

        if !self.reserving || self.sentinel_sent {
            return;
        }
        self.sentinel_sent = true;

        let body = match self.deps.codec.encode(&stop_sentinel()) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "cannot encode stop sentinel");
                return;
            }
        };
        let producer = Arc::clone(&self.deps.producer);
        let tube = self.settings.tube.clone();
        tokio::spawn(
            async move {
                match producer.put(&tube, body, PutOptions::default()).await {
                    Ok(id) => debug!(job = %id, "stop sentinel put"),
                    Err(e) => error!(error = %e, "failed to put stop sentinel"),
                }
            }
            .in_current_span(),
        );
    }
}
