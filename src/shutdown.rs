//! Bounded-time teardown of one open document.
//!
//! Three steps, each with its own deadline:
//!
//! 1. **Graceful wait**: up to the grace period for in-flight mutating calls
//!    to finish. Skipped by forced shutdowns.
//! 2. **Clean engine shutdown**: ask the engine to finish up and exit, up to
//!    the shutdown-item timeout. A pending time update is given the same
//!    deadline and abandoned after it.
//! 3. **Forced termination**: if step 2 did not succeed, wait the kill delay
//!    and kill the engine. Calls still waiting on it fail with a pipe-closed
//!    error.
//!
//! The worst case is `grace + item timeout + kill delay` and does not depend
//! on the engine answering anything.

use std::sync::Arc;
use std::time::Instant;

use crate::document::active::ActiveDocument;
use crate::document::time_updater::PeriodicTimeUpdater;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Let in-flight mutating calls finish first
    Graceful,
    /// Skip the graceful wait
    Forced,
}

impl std::fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownMode::Graceful => write!(f, "graceful"),
            ShutdownMode::Forced => write!(f, "forced"),
        }
    }
}

/// Runs the shutdown steps for a document that has just entered
/// `ShuttingDown`. Only the caller that made that transition gets one.
pub(crate) struct ShutdownSequencer {
    doc: Arc<ActiveDocument>,
    mode: ShutdownMode,
    time_updater: Option<PeriodicTimeUpdater>,
}

impl ShutdownSequencer {
    pub(crate) fn new(
        doc: Arc<ActiveDocument>,
        mode: ShutdownMode,
        time_updater: Option<PeriodicTimeUpdater>,
    ) -> Self {
        Self {
            doc,
            mode,
            time_updater,
        }
    }

    pub(crate) async fn run(mut self) {
        let started = Instant::now();
        tracing::info!(doc_id = %self.doc.doc_id(), mode = %self.mode, "Shutting down document");

        self.graceful_wait().await;
        let clean = self.clean_shutdown().await;
        if !clean {
            self.force_terminate().await;
        }

        self.doc.mark_closed();
        tracing::info!(
            doc_id = %self.doc.doc_id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            forced_kill = !clean,
            "Document closed"
        );
    }

    async fn graceful_wait(&self) {
        let skip = self.doc.skip_grace_token();
        if skip.is_cancelled() {
            tracing::debug!(doc_id = %self.doc.doc_id(), "Skipping graceful wait");
            return;
        }

        let grace = self.doc.config().grace_period();
        let mut pending = self.doc.subscribe_pending_mutations();
        let drained = tokio::select! {
            result = tokio::time::timeout(grace, pending.wait_for(|n| *n == 0)) => {
                matches!(result, Ok(Ok(_)))
            }
            _ = skip.cancelled() => false,
        };

        if !drained {
            let remaining = *pending.borrow();
            tracing::warn!(
                doc_id = %self.doc.doc_id(),
                pending = remaining,
                grace_ms = self.doc.config().grace_period_ms,
                "Graceful wait ended with mutating calls still in flight"
            );
        }
    }

    /// Returns true if the engine shut down on request.
    async fn clean_shutdown(&mut self) -> bool {
        let Some(engine) = self.doc.engine_handle() else {
            return true;
        };
        let limit = self.doc.config().shutdown_item_timeout();
        let updater = self.time_updater.take();

        let (updater_done, engine_result) = tokio::join!(
            async move {
                match updater {
                    Some(updater) => updater.finish(limit).await,
                    None => true,
                }
            },
            tokio::time::timeout(limit, engine.request_shutdown()),
        );

        if !updater_done {
            tracing::warn!(
                doc_id = %self.doc.doc_id(),
                "Time update did not finish in time, abandoned as failed"
            );
        }

        match engine_result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(doc_id = %self.doc.doc_id(), error = %e, "Engine shutdown failed");
                false
            }
            Err(_) => {
                tracing::warn!(
                    doc_id = %self.doc.doc_id(),
                    timeout_ms = self.doc.config().shutdown_item_timeout_ms,
                    "Engine did not shut down in time, treating as hung"
                );
                false
            }
        }
    }

    async fn force_terminate(&self) {
        let Some(engine) = self.doc.engine_handle() else {
            return;
        };
        tokio::time::sleep(self.doc.config().kill_delay()).await;
        engine.kill();
    }
}
