// Signal handling
// Ctrl-C and SIGTERM cancel the run; a second Ctrl-C exits immediately

use tokio_util::sync::CancellationToken;

/// Exit status after an interrupt
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Cancel `token` on the first interrupt or terminate signal
pub fn install(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("interrupt received, cancelling run");
        crate::output::warning("Cancelling run, waiting for running steps to stop");
        token.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            crate::output::error("Interrupted again, exiting");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
