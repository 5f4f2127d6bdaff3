//! Tokio runtime for the long-running commands and the shutdown token they share.
//!
//! A command receives a [`CancellationToken`] that is cancelled on ctrl-c or
//! SIGTERM, and again once the command returns. Blocking work left behind
//! gets [`SHUTDOWN_GRACE`] before the runtime is dropped.

use std::{future::Future, io, time::Duration};

use color_eyre::eyre;
use tokio::runtime::{Builder as RtBuilder, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;

pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub fn build_runtime(cfg: RuntimeConfig) -> io::Result<Runtime> {
    let mut builder = match cfg {
        RuntimeConfig::SingleThreaded => RtBuilder::new_current_thread(),
        RuntimeConfig::MultiThreaded { worker_threads } => {
            let mut builder = RtBuilder::new_multi_thread();
            if worker_threads > 0 {
                builder.worker_threads(worker_threads);
            }
            builder
        }
    };

    builder.thread_name("hivenet").enable_all().build()
}

/// Runs `command` on a runtime built from `cfg` until it returns; a shutdown
/// signal cancels the token handed to it.
pub fn run_until_signal<F, Fut, T>(cfg: RuntimeConfig, command: F) -> eyre::Result<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = eyre::Result<T>>,
{
    let rt = build_runtime(cfg)?;
    run_until(rt, shutdown_signal(), command)
}

/// Like [`run_until_signal`] with `shutdown` as the trigger.
pub fn run_until<S, F, Fut, T>(rt: Runtime, shutdown: S, command: F) -> eyre::Result<T>
where
    S: Future<Output = io::Result<()>> + Send + 'static,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = eyre::Result<T>>,
{
    let cancel = CancellationToken::new();
    let result = rt.block_on(async {
        let trigger = cancel.clone();
        let listener = tokio::spawn(async move {
            match shutdown.await {
                Ok(()) => info!("Shutdown requested, cancelling"),
                Err(e) => warn!("Failed to listen for shutdown signals, cancelling: {e}"),
            }
            trigger.cancel();
        });
        let result = command(cancel.clone()).await;
        listener.abort();
        result
    });
    cancel.cancel();
    debug!(grace = ?SHUTDOWN_GRACE, "Shutting down runtime");
    rt.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

/// Resolves on ctrl-c, or on SIGTERM where there is one.
pub async fn shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
