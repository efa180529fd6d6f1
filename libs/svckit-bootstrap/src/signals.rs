use std::fmt;

use anyhow::{Context, Result};
use tokio::signal;

/// The OS signal that ended [`wait_for_shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM, whichever comes first.
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    let interrupt = async {
        signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        let mut handler = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        handler.recv().await;
        Ok::<(), anyhow::Error>(())
    };

    // No SIGTERM outside unix; only Ctrl+C can end the wait.
    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    let received = tokio::select! {
        result = interrupt => {
            result.inspect_err(|e| tracing::error!(error = %e, "Error handling Ctrl+C signal"))?;
            tracing::info!("Received Ctrl+C signal");
            ShutdownSignal::Interrupt
        },
        result = terminate => {
            result.inspect_err(|e| tracing::error!(error = %e, "Error handling SIGTERM signal"))?;
            tracing::info!("Received SIGTERM signal");
            ShutdownSignal::Terminate
        },
    };

    tracing::info!(signal = %received, "Shutdown signal received, stopping composition");
    Ok(received)
}
