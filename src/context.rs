//! The process context: configuration and collaborators, built once.
//!
//! ```no_run
//! use juggler::queue::memory::MemoryServer;
//! use juggler::{Config, Deferred, EnqueueOptions, Juggler};
//!
//! # async fn demo() -> juggler::Result<()> {
//! let juggler = Juggler::builder()
//!     .config(Config::from_env()?)
//!     .connector(MemoryServer::default())
//!     .build()?;
//!
//! juggler
//!     .register_worker("emails", 4, |deferred: Deferred, to: String| {
//!         tracing::info!(%to, "sending");
//!         deferred.succeed();
//!     })
//!     .await?;
//!
//! juggler.enqueue("emails", &"a@example.com", EnqueueOptions::default()).await?;
//! juggler.run_until_signal().await
//! # }
//! ```

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::codec::{Codec, CodecError, JsonCodec, is_stop_sentinel};
use crate::config::Config;
use crate::engine::runner::{self, RunnerDeps, RunnerHandle, RunnerSettings};
use crate::engine::shutdown::ShutdownCoordinator;
use crate::error::{Error, Result};
use crate::model::{EnqueueOptions, JobId};
use crate::os_signals;
use crate::policy::{Backoff, ExceptionHandler, Policies};
use crate::queue::{Connector, QueueClient};
use crate::strategy::Strategy;

/// Producer and consumer entry point. Cheap to clone.
#[derive(Clone)]
pub struct Juggler {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn Codec>,
    policies: Policies,
    shutdown: ShutdownCoordinator,
    producer: OnceCell<Arc<dyn QueueClient>>,
}

impl Juggler {
    pub fn builder() -> JugglerBuilder {
        JugglerBuilder::default()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.inner.shutdown
    }

    /// Serialize `params` and put it on `tube`.
    ///
    /// # Errors
    ///
    /// [`Error::ReservedPayload`] if `params` serializes to the stop sentinel,
    /// [`Error::Codec`] if it cannot be serialized, and [`Error::Queue`] if
    /// the put fails.
    pub async fn enqueue<T>(&self, tube: &str, params: &T, options: EnqueueOptions) -> Result<JobId>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(params).map_err(CodecError::from)?;
        if is_stop_sentinel(&value) {
            return Err(Error::ReservedPayload(value.to_string()));
        }
        let body = self.inner.codec.encode(&value)?;

        let producer = self.producer().await?;
        let id = producer.put(tube, body, options.to_put()).await?;
        debug!(tube, job = %id, "enqueued");
        Ok(id)
    }

    /// Start a Runner that feeds jobs from `tube` to `strategy`, at most
    /// `concurrency` at a time. It gets its own connection.
    pub async fn register_worker<P, S>(
        &self,
        tube: &str,
        concurrency: usize,
        strategy: S,
    ) -> Result<RunnerHandle>
    where
        P: DeserializeOwned + Send + 'static,
        S: Strategy<P>,
    {
        if concurrency == 0 {
            return Err(Error::Config(format!(
                "worker for {tube} needs a concurrency of at least 1"
            )));
        }

        let settings = RunnerSettings {
            tube: tube.to_string(),
            concurrency,
            timeout_poll_interval: self.inner.config.timeout_poll_interval,
            reserve_retry_delay: self.inner.config.reserve_retry_delay,
        };
        let deps = RunnerDeps {
            codec: Arc::clone(&self.inner.codec),
            policies: self.inner.policies.clone(),
            producer: self.producer().await?,
        };
        let strategy: Arc<dyn Strategy<P>> = Arc::new(strategy);

        let handle = runner::spawn(settings, strategy, self.inner.connector.open(), deps);
        self.inner.shutdown.register(handle.clone());
        info!(tube, concurrency, server = %self.inner.config.server, "worker registered");
        Ok(handle)
    }

    /// Stop every Runner and wait up to the shutdown grace for their jobs.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.stop().await
    }

    /// Block until a termination signal, then shut down once.
    pub async fn run_until_signal(&self) -> Result<()> {
        os_signals::wait_for_shutdown_signal().await?;
        self.shutdown().await
    }

    /// The shared producer connection, opened on first use.
    async fn producer(&self) -> Result<Arc<dyn QueueClient>> {
        let inner = &self.inner;
        let producer = inner
            .producer
            .get_or_try_init(|| async {
                let client = inner.connector.open();
                client.connect().await?;
                Ok::<_, Error>(client)
            })
            .await?;
        Ok(Arc::clone(producer))
    }
}

impl std::fmt::Debug for Juggler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Juggler")
            .field("config", &self.inner.config)
            .field("shutdown", &self.inner.shutdown)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Juggler`]. Only the connector is required.
#[derive(Default)]
pub struct JugglerBuilder {
    config: Config,
    connector: Option<Arc<dyn Connector>>,
    codec: Option<Arc<dyn Codec>>,
    backoff: Option<Arc<dyn Backoff>>,
    exceptions: Option<Arc<dyn ExceptionHandler>>,
}

impl JugglerBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Where queue connections come from.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Payload serializer. Defaults to [`JsonCodec`].
    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    /// Release-delay policy. Defaults to [`Decay`](crate::policy::Decay).
    pub fn backoff(mut self, backoff: impl Backoff) -> Self {
        self.backoff = Some(Arc::new(backoff));
        self
    }

    /// Where strategy errors are reported. Defaults to logging them.
    pub fn exception_handler(mut self, handler: impl ExceptionHandler) -> Self {
        self.exceptions = Some(Arc::new(handler));
        self
    }

    /// # Errors
    ///
    /// [`Error::Config`] if no connector was set.
    pub fn build(self) -> Result<Juggler> {
        let connector = self
            .connector
            .ok_or_else(|| Error::Config("no queue connector configured".to_string()))?;

        let defaults = Policies::default();
        let policies = Policies {
            backoff: self.backoff.unwrap_or(defaults.backoff),
            exceptions: self.exceptions.unwrap_or(defaults.exceptions),
        };
        let shutdown = ShutdownCoordinator::new(
            self.config.shutdown_grace,
            self.config.shutdown_poll_interval,
        );

        Ok(Juggler {
            inner: Arc::new(Inner {
                config: self.config,
                connector,
                codec: self.codec.unwrap_or_else(|| Arc::new(JsonCodec)),
                policies,
                shutdown,
                producer: OnceCell::new(),
            }),
        })
    }
}
