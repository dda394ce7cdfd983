//! Shutdown signal handling.

use snafu::{ResultExt, Snafu};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
#[snafu(display("failed to install the signal handler"))]
pub struct SignalError {
    source: std::io::Error,
}

/// Cancels `token` on the first `SIGTERM` or `SIGINT`. The listener runs on
/// its own task; every service sharing the token observes the shutdown.
pub fn watch_shutdown_signals(token: CancellationToken) -> Result<(), SignalError> {
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;
    let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu)?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            _ = sigint.recv() => tracing::info!("received SIGINT"),
        }
        token.cancel();
    });

    Ok(())
}
