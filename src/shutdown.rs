//! Group-wide shutdown signalling.
//!
//! The barrier pair is the only cancellation primitive in procrack: the
//! graceful barrier asks every replica to stop, the urgent barrier turns any
//! stop still in progress into an immediate kill. Both are broadcast and
//! one-way.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::output::OutputRouter;

/// Cloneable handle to the graceful/urgent barrier pair.
#[derive(Debug, Clone, Default)]
pub struct ShutdownBarrier {
    graceful: CancellationToken,
    urgent: CancellationToken,
}

impl ShutdownBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the graceful barrier. Repeated or concurrent calls are no-ops.
    pub fn signal_shutdown(&self) {
        self.graceful.cancel();
    }

    /// Trips both barriers.
    pub fn escalate(&self) {
        self.graceful.cancel();
        self.urgent.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.graceful.is_cancelled()
    }

    pub fn is_urgent(&self) -> bool {
        self.urgent.is_cancelled()
    }

    /// Resolves once the graceful barrier has tripped.
    pub async fn graceful(&self) {
        self.graceful.cancelled().await
    }

    /// Resolves once the urgent barrier has tripped.
    pub async fn urgent(&self) {
        self.urgent.cancelled().await
    }
}

/// Why the interrupt monitor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Every sender of interrupt notifications went away.
    InterruptSourceClosed,
}

/// Turns interrupt notifications into barrier trips: the first one stops the
/// group gracefully, every later one escalates.
///
/// Runs for as long as `interrupts` stays open.
pub async fn monitor_interrupts(
    barrier: ShutdownBarrier,
    router: Arc<OutputRouter>,
    mut interrupts: mpsc::Receiver<()>,
) -> MonitorExit {
    let mut first = true;
    while interrupts.recv().await.is_some() {
        router.system("ctrl-c detected");
        if first {
            barrier.signal_shutdown();
            first = false;
        } else {
            tracing::debug!("repeated interrupt, escalating to kill");
            barrier.escalate();
        }
    }
    MonitorExit::InterruptSourceClosed
}

/// Forwards Ctrl-C (and SIGTERM on unix) into `tx` for as long as the process
/// lives. Handlers are installed before this returns; dropping `tx` on failure
/// lets the monitor notice.
#[cfg(unix)]
pub fn spawn_signal_listener(tx: mpsc::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};
    let handlers = signal(SignalKind::interrupt())
        .and_then(|sigint| Ok((sigint, signal(SignalKind::terminate())?)));
    let (mut sigint, mut sigterm) = match handlers {
        Ok(handlers) => handlers,
        Err(err) => {
            tracing::warn!(error = %err, "failed to install signal handlers");
            return;
        }
    };
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                received = sigint.recv() => received,
                received = sigterm.recv() => received,
            };
            if received.is_none() || tx.send(()).await.is_err() {
                return;
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_signal_listener(tx: mpsc::Sender<()>) {
    tokio::spawn(async move {
        loop {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to listen for ctrl-c");
                return;
            }
            if tx.send(()).await.is_err() {
                return;
            }
        }
    });
}
