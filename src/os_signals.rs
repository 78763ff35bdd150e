//! Process termination signals.
//!
//! [`wait_for_shutdown_signal`] completes on the first SIGINT, SIGTERM or
//! SIGQUIT on unix, or on Ctrl-C elsewhere. [`Juggler::run_until_signal`]
//! uses it to start shutdown exactly once.
//!
//! [`Juggler::run_until_signal`]: crate::Juggler::run_until_signal

use tracing::info;

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    info!(signal = name, "shutdown signal received");
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "shutdown signal received");
    Ok(())
}
