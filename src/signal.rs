//! Turning termination signals into a stop request.
//!
//! Both binaries are thread based; a small current-thread tokio runtime on its own thread
//! waits for the signal and then calls the handler once.

use anyhow::Context;
use tracing::{error, info};

/// Calls `handler` on the first SIGINT, SIGTERM or SIGQUIT (Ctrl-C elsewhere).
pub fn on_termination<F>(handler: F) -> anyhow::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("could not build the signal runtime")?;
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || match runtime.block_on(wait_for_signal()) {
            Ok(signal) => {
                info!(signal, "Shutdown signal received");
                handler();
            }
            Err(e) => error!("Could not listen for signals: {e}"),
        })
        .context("could not spawn the signal thread")?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
        _ = quit.recv() => Ok("SIGQUIT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "Ctrl-C")
}
