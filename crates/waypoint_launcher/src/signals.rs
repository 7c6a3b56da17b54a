//! Shutdown signal handling.

use anyhow::{Context, Result};
use std::fmt;
use tokio::signal;

/// The signal that ended the launcher's tick loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            #[cfg(not(unix))]
            ShutdownSignal::Interrupt => f.write_str("Ctrl+C"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Resolves with the first of SIGINT or SIGTERM (Ctrl+C elsewhere).
#[cfg(unix)]
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    use signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    Ok(tokio::select! {
        _ = sigint.recv() => ShutdownSignal::Interrupt,
        _ = sigterm.recv() => ShutdownSignal::Terminate,
    })
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    signal::ctrl_c().await.context("listening for Ctrl+C")?;
    Ok(ShutdownSignal::Interrupt)
}
