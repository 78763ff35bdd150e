//! Job execution engine: per-job lifecycle, per-tube worker pools and
//! process-wide shutdown.

pub mod job_runner;
pub mod runner;
pub mod shutdown;

pub use job_runner::{JobRunner, TIMEOUT_MARGIN};
pub use runner::{RunnerDeps, RunnerHandle, RunnerSettings};
pub use shutdown::ShutdownCoordinator;
