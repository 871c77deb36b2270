//! Root cancellation scope tied to process signals

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;

/// Cancel `token` on the first SIGINT or SIGTERM.
///
/// The returned task can be aborted once the command finishes on its own.
pub fn install_signal_handler(token: CancellationToken) -> Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("SIGINT received, shutting down"),
                Err(e) => {
                    warn!(error = %e, "failed to listen for SIGINT");
                    return;
                }
            },
            _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    }))
}
