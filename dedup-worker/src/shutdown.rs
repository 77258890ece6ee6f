//! Process signals that ask the worker to stop.
use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::info;

/// Waits for SIGINT or SIGTERM. The SIGTERM handler is installed on construction, so the
/// default disposition no longer applies from then on.
pub struct ShutdownSignal {
    terminate: Signal,
}

impl ShutdownSignal {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Resolve with the name of the first shutdown signal received.
    pub async fn recv(mut self) -> &'static str {
        let received = tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        };

        info!(signal = received, "received shutdown signal");
        received
    }
}
