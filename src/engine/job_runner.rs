//! Per-job lifecycle: one reserved job from `new` to `done`.
//!
//! ```text
//! new ──run()──► running ──resolved Ok──────────► succeeded ─► done   (delete)
//!  │                │ ───resolved Err(NoRetry)──► failed ────► done   (delete)
//!  │                │ ───resolved Err(Retry)────► failed ────► done   (release | bury)
//!  │                └──check_for_timeout()──────► timed_out ─► done   (release | bury)
//!  └──stats unavailable──────────────────────────► failed ────► done   (release | bury)
//! ```
//!
//! Each terminal path issues exactly one queue command. The command's own
//! failure is logged and the job still reaches `done`; the server reclaims
//! anything left reserved once its time-to-run lapses.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::machine::{Hooks, StateMachine, Stateful, Transition, change_state};
use crate::model::{DEFAULT_PRIORITY, Failure, Job, JobId, JobState, JobStats, StrategyResult};
use crate::policy::{Decision, Policies, StrategyPanic};
use crate::queue::QueueClient;
use crate::strategy::{Deferred, Strategy};
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

/// A running job times out once less than this remains before its deadline.
pub const TIMEOUT_MARGIN: Duration = Duration::from_secs(1);

/// Drives a single reserved job through its state machine.
pub struct JobRunner<P: Send + 'static> {
    machine: StateMachine<Self>,
    job: Job,
    tube: String,
    params: Option<P>,
    strategy: Arc<dyn Strategy<P>>,
    queue: Arc<dyn QueueClient>,
    policies: Policies,
    stats: Option<JobStats>,
    deadline: Option<Instant>,
    pending: Option<oneshot::Receiver<StrategyResult>>,
    timeout: CancellationToken,
    failure: Option<Failure>,
    started: Instant,
    span: Span,
}

enum Wake {
    Settled(std::result::Result<StrategyResult, oneshot::error::RecvError>),
    Probe,
}

impl<P: Send + 'static> JobRunner<P> {
    pub fn new(
        job: Job,
        tube: &str,
        params: P,
        strategy: Arc<dyn Strategy<P>>,
        queue: Arc<dyn QueueClient>,
        policies: Policies,
    ) -> Self {
        let span = start_job_span(tube, job.id);
        Self {
            machine: StateMachine::new(JobState::New),
            job,
            tube: tube.to_string(),
            params: Some(params),
            strategy,
            queue,
            policies,
            stats: None,
            deadline: None,
            pending: None,
            timeout: CancellationToken::new(),
            failure: None,
            started: Instant::now(),
            span,
        }
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn tube(&self) -> &str {
        &self.tube
    }

    pub fn state(&self) -> JobState {
        self.machine.state()
    }

    /// Stats fetched on entry to `running`.
    pub fn stats(&self) -> Option<&JobStats> {
        self.stats.as_ref()
    }

    /// Why the job failed, once it has.
    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Run `listener` every time `state` is entered.
    pub fn bind(&mut self, state: JobState, listener: impl FnMut(&Self) + Send + 'static) {
        self.machine.bind(state, listener);
    }

    /// Fetch stats and start the strategy.
    ///
    /// Returns [`Transition::Vetoed`] if the stats could not be fetched; the
    /// job is then still in `new`.
    pub async fn run(&mut self) -> Result<Transition> {
        change_state(self, JobState::Running).await
    }

    /// Time the job out if its deadline is within [`TIMEOUT_MARGIN`].
    ///
    /// Compares against the deadline cached on entry to `running`, so this is
    /// cheap enough to call on every sweep. A no-op in any other state.
    pub async fn check_for_timeout(&mut self) -> Result<Transition> {
        if self.state() != JobState::Running {
            return Ok(Transition::Unchanged);
        }
        let Some(deadline) = self.deadline else {
            return Ok(Transition::Unchanged);
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        debug!(job = %self.job.id, remaining_ms = remaining.as_millis() as u64, "checking for timeout");
        if remaining >= TIMEOUT_MARGIN {
            return Ok(Transition::Unchanged);
        }

        change_state(self, JobState::TimedOut).await
    }

    /// Move to the state matching the strategy's outcome.
    pub async fn settle(
        &mut self,
        outcome: std::result::Result<StrategyResult, oneshot::error::RecvError>,
    ) -> Result<Transition> {
        self.pending = None;
        let target = match outcome {
            Ok(Ok(())) => JobState::Succeeded,
            Ok(Err(Failure::TimedOut)) => {
                self.failure = Some(Failure::TimedOut);
                JobState::TimedOut
            }
            Ok(Err(failure)) => {
                self.failure = Some(failure);
                JobState::Failed
            }
            Err(_) => {
                self.failure = Some(Failure::retry("deferred dropped without being resolved"));
                JobState::Failed
            }
        };
        change_state(self, target).await
    }

    /// Run the job to completion on the current task.
    ///
    /// Waits for the strategy to resolve, re-checking the deadline whenever
    /// `probe` is notified. Returns the final state, which is `done` unless
    /// the machine itself rejected a transition.
    pub async fn drive(mut self, probe: Arc<Notify>) -> Result<JobState> {
        let span = self.span.clone();
        async move {
            if self.run().await? == Transition::Vetoed {
                self.failure = Some(Failure::retry("job stats unavailable"));
                change_state(&mut self, JobState::Failed).await?;
            }

            while self.state() == JobState::Running {
                let wake = {
                    let Some(pending) = self.pending.as_mut() else {
                        return Err(Error::Other(format!(
                            "job {} running without a pending strategy",
                            self.job.id
                        )));
                    };
                    tokio::select! {
                        outcome = pending => Wake::Settled(outcome),
                        () = probe.notified() => Wake::Probe,
                    }
                };

                match wake {
                    Wake::Settled(outcome) => {
                        self.settle(outcome).await?;
                    }
                    Wake::Probe => {
                        self.check_for_timeout().await?;
                    }
                }
            }

            Ok(self.state())
        }
        .instrument(span)
        .await
    }

    // -- hooks ---------------------------------------------------------------

    fn fetch_stats(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let stats = self.queue.stats(self.job.id).await?;
            self.deadline = Some(Instant::now() + Duration::from_secs(stats.time_left));
            debug!(job = %self.job.id, time_left = stats.time_left, delay = stats.delay, "fetched stats");
            self.stats = Some(stats);
            Ok(())
        })
    }

    fn start_strategy(&mut self) -> BoxFuture<'_, Option<JobState>> {
        Box::pin(async move {
            let Some(params) = self.params.take() else {
                self.failure = Some(Failure::retry("strategy already started"));
                return Some(JobState::Failed);
            };

            info!(job = %self.job.id, "running");
            let context = format!("job {}: calling strategy", self.job.id);
            let (deferred, receiver) = Deferred::new(
                self.timeout.clone(),
                Arc::clone(&self.policies.exceptions),
                context.clone(),
            );
            self.pending = Some(receiver);

            let strategy = Arc::clone(&self.strategy);
            let called =
                std::panic::catch_unwind(AssertUnwindSafe(move || strategy.call(deferred, params)));
            if let Err(payload) = called {
                let panic = StrategyPanic::from_payload(payload);
                self.policies.exceptions.handle(&panic, &context);
                self.pending = None;
                self.failure = Some(Failure::retry(panic.to_string()));
                return Some(JobState::Failed);
            }
            None
        })
    }

    fn delete_succeeded(&mut self) -> BoxFuture<'_, Option<JobState>> {
        Box::pin(async move {
            info!(job = %self.job.id, "succeeded");
            self.record_outcome("succeeded");
            self.delete().await;
            Some(JobState::Done)
        })
    }

    fn expire(&mut self) -> BoxFuture<'_, Option<JobState>> {
        Box::pin(async move {
            warn!(job = %self.job.id, "timed out");
            // Tells the strategy to stop; its late resolution goes nowhere.
            self.timeout.cancel();
            self.pending = None;
            self.failure = Some(Failure::TimedOut);
            self.record_outcome("timed_out");
            self.decay().await;
            Some(JobState::Done)
        })
    }

    fn dispose_failure(&mut self) -> BoxFuture<'_, Option<JobState>> {
        Box::pin(async move {
            let failure = self.failure.clone().unwrap_or(Failure::Retry { reason: None });
            warn!(job = %self.job.id, kind = failure.as_label(), reason = failure.reason(), "failed");
            self.record_outcome("failed");
            match failure {
                Failure::NoRetry { .. } => self.delete().await,
                _ => self.decay().await,
            }
            Some(JobState::Done)
        })
    }

    fn finish(&mut self) -> BoxFuture<'_, Option<JobState>> {
        Box::pin(async move {
            let elapsed = self.started.elapsed().as_secs_f64() * 1000.0;
            metrics::job_duration_ms().record(elapsed, &[KeyValue::new("tube", self.tube.clone())]);
            debug!(job = %self.job.id, elapsed_ms = elapsed, "done");
            None
        })
    }

    // -- queue dispositions --------------------------------------------------

    async fn delete(&mut self) {
        let result = self.queue.delete(self.job.id).await;
        self.record_disposition("delete", result.is_ok());
        match result {
            Ok(()) => debug!(job = %self.job.id, "deleted"),
            Err(e) => error!(job = %self.job.id, error = %e, "delete failed"),
        }
    }

    /// Release with a longer delay, or bury once the delay passes the ceiling.
    async fn decay(&mut self) {
        let previous = self.stats.as_ref().map_or(0, |s| s.delay);
        let priority = self.stats.as_ref().map_or(DEFAULT_PRIORITY, |s| s.pri);

        match self.policies.backoff.next(previous) {
            Decision::Release { delay } => {
                let result = self.queue.release(self.job.id, delay).await;
                self.record_disposition("release", result.is_ok());
                match result {
                    Ok(()) => info!(job = %self.job.id, delay, "released for retry"),
                    Err(e) => error!(job = %self.job.id, delay, error = %e, "release failed"),
                }
            }
            Decision::Bury => {
                let result = self.queue.bury(self.job.id, priority).await;
                self.record_disposition("bury", result.is_ok());
                match result {
                    Ok(()) => warn!(job = %self.job.id, previous, "buried, giving up"),
                    Err(e) => error!(job = %self.job.id, error = %e, "bury failed"),
                }
            }
        }
    }

    fn record_outcome(&self, outcome: &'static str) {
        metrics::job_outcomes().add(
            1,
            &[
                KeyValue::new("tube", self.tube.clone()),
                KeyValue::new("outcome", outcome),
            ],
        );
    }

    fn record_disposition(&self, operation: &'static str, ok: bool) {
        metrics::queue_dispositions().add(
            1,
            &[
                KeyValue::new("tube", self.tube.clone()),
                KeyValue::new("operation", operation),
                KeyValue::new("result", if ok { "ok" } else { "error" }),
            ],
        );
    }
}

impl<P: Send + 'static> Stateful for JobRunner<P> {
    type State = JobState;

    fn machine(&self) -> &StateMachine<Self> {
        &self.machine
    }

    fn machine_mut(&mut self) -> &mut StateMachine<Self> {
        &mut self.machine
    }

    fn hooks(state: JobState) -> Option<Hooks<Self>> {
        let hooks = match state {
            JobState::New => Hooks::none(),
            JobState::Running => Hooks::none()
                .pre(Self::fetch_stats)
                .enter(Self::start_strategy),
            JobState::Succeeded => Hooks::none().enter(Self::delete_succeeded),
            JobState::TimedOut => Hooks::none().enter(Self::expire),
            JobState::Failed => Hooks::none().enter(Self::dispose_failure),
            JobState::Done => Hooks::none().enter(Self::finish),
        };
        Some(hooks)
    }

    fn permits(from: JobState, to: JobState) -> bool {
        from.can_transition_to(to)
    }

    fn on_transition(&mut self, from: JobState, to: JobState) {
        let (from, to) = (from.to_string(), to.to_string());
        record_state_transition(&self.span, &from, &to);
        metrics::job_state_transitions().add(
            1,
            &[KeyValue::new("from", from), KeyValue::new("to", to)],
        );
    }
}

impl<P: Send + 'static> std::fmt::Debug for JobRunner<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("job", &self.job.id)
            .field("tube", &self.tube)
            .field("state", &self.machine.state())
            .finish_non_exhaustive()
    }
}
