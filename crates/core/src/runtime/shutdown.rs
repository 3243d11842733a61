use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Owns the process-wide cancellation token.
/// SIGTERM or Ctrl-C cancels it.
#[derive(Debug)]
pub struct ShutdownGuard {
    token: CancellationToken,
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// The cancellation token the scheduler monitors.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a background task that waits for the first shutdown signal.
    pub fn spawn_signal_listener(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            token.cancel();
        });
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler, using Ctrl+C only");
            let _ = signal::ctrl_c().await;
            tracing::info!("received Ctrl+C, initiating shutdown");
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM, initiating shutdown"),
        _ = signal::ctrl_c() => tracing::info!("received Ctrl+C, initiating shutdown"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("received Ctrl+C, initiating shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_share_cancellation() {
        let guard = ShutdownGuard::new();
        let a = guard.token();
        let b = guard.token();
        a.cancel();
        assert!(b.is_cancelled());
    }
}
