//! Process-wide shutdown: stop every Runner, then wait for their jobs.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time;
use tracing::{info, warn};

use super::runner::RunnerHandle;
use crate::error::{Error, Result};

/// Registry of started Runners.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    runners: Arc<Mutex<Vec<RunnerHandle>>>,
    grace: Duration,
    poll_interval: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration, poll_interval: Duration) -> Self {
        Self {
            runners: Arc::new(Mutex::new(Vec::new())),
            grace,
            poll_interval,
        }
    }

    pub fn register(&self, runner: RunnerHandle) {
        self.lock().push(runner);
    }

    pub fn runners(&self) -> Vec<RunnerHandle> {
        self.lock().clone()
    }

    /// True while any registered Runner still has a live job.
    pub fn is_running(&self) -> bool {
        self.lock().iter().any(RunnerHandle::is_running)
    }

    /// Stop every Runner and wait for in-flight jobs to finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GraceExceeded`] if jobs are still running once the
    /// grace period has elapsed. The caller decides whether to exit anyway.
    pub async fn stop(&self) -> Result<()> {
        let runners = self.runners();
        for runner in &runners {
            runner.stop();
        }

        info!(
            runners = runners.len(),
            grace_ms = self.grace.as_millis() as u64,
            "giving runners a grace period to exit"
        );

        let drained = time::timeout(self.grace, async {
            let mut tick = time::interval(self.poll_interval);
            loop {
                tick.tick().await;
                if !runners.iter().any(RunnerHandle::is_running) {
                    break;
                }
            }
        })
        .await;

        if drained.is_ok() {
            info!("exited cleanly");
            return Ok(());
        }

        let stuck: Vec<String> = runners
            .iter()
            .filter(|r| r.is_running())
            .map(|r| format!("{} ({} running)", r.tube(), r.running_jobs()))
            .collect();
        warn!(?stuck, "grace period elapsed with jobs still running");
        Err(Error::GraceExceeded {
            grace: self.grace,
            stuck,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RunnerHandle>> {
        self.runners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
