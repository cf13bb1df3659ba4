use std::sync::Weak;
use std::time::Duration;

use rand::Rng;

use crate::config::TimeUpdateConfig;
use crate::document::active::ActiveDocument;
use crate::document::timers::TimerHandle;

/// Pushes the current time into a document's engine on an interval so that
/// formulas depending on "now" stay current.
///
/// Holds only a weak reference to the document and is not counted as
/// activity, so it never keeps an idle document open.
pub(crate) struct PeriodicTimeUpdater {
    timer: TimerHandle,
}

impl PeriodicTimeUpdater {
    pub(crate) fn start(doc: Weak<ActiveDocument>, doc_id: String, config: TimeUpdateConfig) -> Option<Self> {
        let timer = TimerHandle::spawn(move |token| async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(next_delay(&config)) => {}
                }
                let Some(doc) = doc.upgrade() else {
                    break;
                };
                match doc.push_current_time().await {
                    Ok(()) => tracing::trace!(doc_id = %doc_id, "Updated current time"),
                    Err(e) => tracing::warn!(doc_id = %doc_id, error = %e, "Failed to update current time"),
                }
            }
        })?;
        Some(Self { timer })
    }

    /// Stop scheduling further updates. An update already in flight continues.
    pub(crate) fn cancel(&self) {
        self.timer.cancel();
    }

    /// Wait up to `limit` for an in-flight update, abandoning it after that.
    /// Returns false if an update had to be abandoned.
    pub(crate) async fn finish(self, limit: Duration) -> bool {
        self.timer.cancel();
        self.timer.join(limit).await
    }
}

fn next_delay(config: &TimeUpdateConfig) -> Duration {
    let jitter = if config.variance_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=config.variance_ms)
    };
    Duration::from_millis(config.delay_ms + jitter)
}
