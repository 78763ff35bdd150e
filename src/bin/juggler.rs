//! juggler CLI: demo worker pool and backoff inspection.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::{Parser, Subcommand};
use juggler::policy::{Backoff, Decay, Decision};
use juggler::queue::memory::{JobStatus, MemoryServer};
use juggler::telemetry::{TelemetryConfig, init_telemetry};
use juggler::{Config, EnqueueOptions, Failure, Juggler, from_async};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "juggler", about = "Job runner for beanstalk-style queues")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a producer and a worker pool against an in-process queue
    Demo {
        /// Tube to use
        #[arg(long, default_value = "demo")]
        tube: String,
        /// Number of jobs to enqueue
        #[arg(long, default_value_t = 20)]
        jobs: u32,
        /// Maximum concurrent jobs
        #[arg(long, default_value_t = 3)]
        concurrency: usize,
        /// Simulated work per job, in milliseconds
        #[arg(long, default_value_t = 300)]
        work_ms: u64,
        /// Fail the first attempt of every Nth job (0 = never)
        #[arg(long, default_value_t = 0)]
        fail_every: u32,
        /// Time-to-run in seconds
        #[arg(long, default_value_t = 60)]
        ttr: u32,
    },
    /// Print the release-delay schedule until a job would be buried
    Backoff {
        /// Delay the job was last released with
        #[arg(long, default_value_t = 0)]
        from: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DemoJob {
    n: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Demo {
            tube,
            jobs,
            concurrency,
            work_ms,
            fail_every,
            ttr,
        } => cmd_demo(tube, jobs, concurrency, work_ms, fail_every, ttr).await,
        Command::Backoff { from } => {
            cmd_backoff(from);
            Ok(())
        }
    }
}

async fn cmd_demo(
    tube: String,
    jobs: u32,
    concurrency: usize,
    work_ms: u64,
    fail_every: u32,
    ttr: u32,
) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "juggler".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let server = MemoryServer::new(config.server.clone());
    let juggler = Juggler::builder()
        .config(config)
        .connector(server.clone())
        .build()?;

    let failed_once = Arc::new(Mutex::new(HashSet::new()));
    let work = Duration::from_millis(work_ms);
    juggler
        .register_worker(
            &tube,
            concurrency,
            from_async(move |job: DemoJob, timeout: CancellationToken| {
                let failed_once = Arc::clone(&failed_once);
                async move {
                    tokio::select! {
                        () = tokio::time::sleep(work) => {}
                        () = timeout.cancelled() => return Err(Failure::TimedOut),
                    }
                    let fail = fail_every > 0
                        && job.n % fail_every == 0
                        && failed_once
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(job.n);
                    if fail {
                        return Err(Failure::retry(format!("job {} failed its first attempt", job.n)));
                    }
                    info!(n = job.n, "job finished");
                    Ok(())
                }
            }),
        )
        .await?;

    let options = EnqueueOptions::default().ttr(ttr);
    for n in 0..jobs {
        juggler.enqueue(&tube, &DemoJob { n }, options).await?;
    }
    info!(jobs, concurrency, "enqueued");

    let mut tick = tokio::time::interval(Duration::from_millis(200));
    tokio::select! {
        result = juggler::os_signals::wait_for_shutdown_signal() => result?,
        () = async {
            loop {
                tick.tick().await;
                if server.is_drained() {
                    break;
                }
            }
        } => info!("queue drained"),
    }

    juggler.shutdown().await?;

    let stats = server.stats();
    println!(
        "puts {}  reserves {}  deletes {}  releases {}  buries {}  timeouts {}",
        stats.puts, stats.reserves, stats.deletes, stats.releases, stats.buries, stats.timeouts
    );
    println!("buried jobs left: {}", server.count(JobStatus::Buried));
    Ok(())
}

fn cmd_backoff(from: u32) {
    let decay = Decay::default();
    let mut delay = from;
    let mut attempt = 1;
    let mut total: u64 = 0;

    loop {
        match decay.next(delay) {
            Decision::Release { delay: next } => {
                total += u64::from(next);
                println!("{attempt:>3}  release after {next:>6}s  (total {total}s)");
                delay = next;
                attempt += 1;
            }
            Decision::Bury => {
                println!("{attempt:>3}  bury");
                break;
            }
        }
    }
}
