use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::document::active::ActiveDocument;
use crate::engine::CalcEngine;

/// A background timer task owned by one document.
///
/// Stored in an `Option` on the document and taken when cancelled, so each
/// handle is cancelled at most once.
pub(crate) struct TimerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Spawn `body` with a fresh cancellation token. Returns `None` outside a
    /// tokio runtime.
    pub(crate) fn spawn<F, Fut>(body: F) -> Option<Self>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let token = CancellationToken::new();
        let task = runtime.spawn(body(token.clone()));
        Some(Self { token, task })
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait up to `limit` for the task to end, aborting it otherwise. Returns
    /// whether it ended on its own.
    pub(crate) async fn join(self, limit: Duration) -> bool {
        let mut task = self.task;
        match tokio::time::timeout(limit, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                task.abort();
                false
            }
        }
    }
}

/// Arm the inactivity timer. When it fires it hands control back to the
/// document, which decides whether `generation` is still current.
pub(crate) fn arm_inactivity(
    doc: Weak<ActiveDocument>,
    timeout: Duration,
    generation: u64,
) -> Option<TimerHandle> {
    TimerHandle::spawn(move |token| async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                if let Some(doc) = doc.upgrade() {
                    doc.on_inactivity_timeout(generation).await;
                }
            }
        }
    })
}

/// Watch for the engine going away. An exit the document did not ask for is
/// reported back to it.
pub(crate) fn watch_engine_exit(
    doc: Weak<ActiveDocument>,
    engine: Arc<dyn CalcEngine>,
) -> Option<TimerHandle> {
    TimerHandle::spawn(move |token| async move {
        tokio::select! {
            _ = token.cancelled() => {}
            exit = engine.wait_exit() => {
                if let Some(doc) = doc.upgrade() {
                    doc.on_engine_exit(exit).await;
                }
            }
        }
    })
}
