//! # Background Timers
//!
//! Shutdown plumbing shared by the processor and reconciliation loops.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  main                                 spawned loop                      │
//! │  ────                                 ────────────                      │
//! │  let (handle, rx) = TimerHandle::new();                                 │
//! │  tokio::spawn(job.run(rx)); ───────►  select! {                         │
//! │                                         tick   => run guarded cycle    │
//! │  handle.shutdown().await ──────────►    rx     => break                │
//! │                                       }                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A cycle already running when shutdown is requested finishes first: the
//! loop only looks at the channel between ticks.

use tokio::sync::mpsc;

use crate::error::{SyncError, SyncResult};

/// Handle for stopping a spawned timer loop.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl TimerHandle {
    /// Creates a handle and the receiver the loop listens on.
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (TimerHandle { shutdown_tx }, shutdown_rx)
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::Internal("timer loop already stopped".into()))
    }
}
