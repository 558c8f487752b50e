use futures::stream::StreamExt;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_tokio::{Handle, Signals};
use std::io;
use tracing::info;

pub const SHUTDOWN_SIGNALS: [i32; 3] = [SIGINT, SIGTERM, SIGHUP];

/// Listens for the signals that ask the supervisor itself to shut down.
pub struct ShutdownSignals {
    signals: Signals,
    handle: Handle,
}

impl ShutdownSignals {
    pub fn register() -> io::Result<Self> {
        let signals = Signals::new(SHUTDOWN_SIGNALS)?;
        let handle = signals.handle();
        Ok(ShutdownSignals { signals, handle })
    }

    /// Resolves with the first shutdown signal received.
    pub async fn recv(&mut self) -> Option<i32> {
        let signal = self.signals.next().await;
        if let Some(signal) = signal {
            info!(signal, "Received shutdown signal");
        }
        signal
    }
}

impl Drop for ShutdownSignals {
    fn drop(&mut self) {
        self.handle.close();
    }
}
