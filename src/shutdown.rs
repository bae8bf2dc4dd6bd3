//! Waiting for the signal that ends `run_wait`.
use std::{future, sync::Arc};

use tokio::sync::Notify;
use tracing::{error, info};

/// What ended a blocking run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// [`ShutdownHandle::request`].
    Requested,
}

/// Cloneable trigger that ends a blocking run from another thread.
///
/// A request made before anyone waits is remembered.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    /// Ask the blocked run to stop.
    pub fn request(&self) {
        self.notify.notify_one();
    }
}

async fn interrupt() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "cannot listen for ctrl+c");
        future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => {
            error!(%err, "cannot listen for SIGTERM");
            future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    future::pending::<()>().await;
}

/// Resolve on the first of ctrl+c, SIGTERM or a request through `handle`.
pub(crate) async fn wait(handle: &ShutdownHandle) -> ShutdownReason {
    let reason = tokio::select! {
        _ = interrupt() => ShutdownReason::Interrupt,
        _ = terminate() => ShutdownReason::Terminate,
        _ = handle.notify.notified() => ShutdownReason::Requested,
    };
    info!(?reason, "shutdown signal received");
    reason
}
