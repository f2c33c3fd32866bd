use tracing::{debug, error};

#[cfg(unix)]
async fn wait_for_stop_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut terminate, mut interrupt) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(t), Ok(i)) => (t, i),
            (Err(e), _) | (_, Err(e)) => {
                error!("failed to install signal handlers: {}", e);
                return std::future::pending().await;
            }
        };

    tokio::select! {
        _ = terminate.recv() => "SIGTERM",
        _ = interrupt.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "CTRL_C",
        Err(e) => {
            error!("failed to listen for ctrl-c: {}", e);
            std::future::pending().await
        }
    }
}

/// Resolves once the process is asked to stop (SIGTERM, SIGINT or Ctrl-C)
pub async fn shutdown_signal() {
    let name = wait_for_stop_signal().await;
    debug!("Received signal: {}", name);
}
