//! # juggler
//!
//! Client-side job runner for beanstalk-style work queues.
//!
//! Producers [`enqueue`](Juggler::enqueue) jobs onto named tubes. Consumers
//! [`register_worker`](Juggler::register_worker) a strategy per tube; a
//! Runner reserves jobs up to the worker's concurrency and drives each one
//! through a JobRunner that deletes it on success and releases it with a
//! decaying delay (or buries it) on failure or timeout. Shutdown stops
//! reserving, lets in-flight jobs finish within a grace period, and reports
//! any that did not.

pub mod codec;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod machine;
pub mod model;
pub mod os_signals;
pub mod policy;
pub mod queue;
pub mod strategy;
pub mod telemetry;

pub use config::Config;
pub use context::{Juggler, JugglerBuilder};
pub use error::{Error, Result};
pub use model::{EnqueueOptions, Failure, JobId, JobState, StrategyResult};
pub use strategy::{Deferred, Strategy, from_async};
