use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::DocHostConfig;
use crate::document::session::{Authorizer, ClientConnection, ClientSession};
use crate::document::state::DocState;
use crate::document::time_updater::PeriodicTimeUpdater;
use crate::document::timers::{arm_inactivity, watch_engine_exit, TimerHandle};
use crate::engine::{
    ActionResult, CalcEngine, EngineError, EngineExit, EngineFactory, TableSnapshot, UserAction,
};
use crate::error::{DocHostError, Result};
use crate::registry::DocTable;
use crate::shutdown::{ShutdownMode, ShutdownSequencer};

struct DocInner {
    sessions: HashMap<Uuid, ClientConnection>,
    /// Reading and mutating calls currently running
    in_flight: usize,
    last_activity: DateTime<Utc>,
    inactivity_timer: Option<TimerHandle>,
    timer_generation: u64,
    time_updater: Option<PeriodicTimeUpdater>,
    exit_watch: Option<TimerHandle>,
}

/// One open document and its calculation engine.
///
/// # State machine
///
/// `Loading -> Open -> ShuttingDown -> Closed`, never backwards. A failed
/// or abandoned load goes straight from `Loading` to `Closed`, and an engine
/// that exits on its own while `Open` triggers a forced shutdown. Every transition happens
/// while holding the inner lock, so checks made under that lock see a
/// stable state.
///
/// # Concurrency
///
/// - Mutating calls (`apply_user_actions`, `import_rows`) are serialized by
///   `action_lock`; reads go straight to the engine.
/// - The inactivity timer is armed only while `Open` with no sessions and no
///   calls in flight, and is disarmed as soon as either appears.
/// - Shutdown is started at most once, by whoever wins the
///   `Open -> ShuttingDown` transition.
pub struct ActiveDocument {
    doc_id: String,
    config: Arc<DocHostConfig>,
    state: watch::Sender<DocState>,
    inner: Mutex<DocInner>,
    pending_mutations: watch::Sender<usize>,
    action_lock: tokio::sync::Mutex<()>,
    engine: OnceLock<Arc<dyn CalcEngine>>,
    load_error: OnceLock<String>,
    skip_grace: CancellationToken,
    abort_load: CancellationToken,
    table: Weak<DocTable>,
}

impl ActiveDocument {
    pub(crate) fn new(doc_id: &str, config: Arc<DocHostConfig>, table: Weak<DocTable>) -> Arc<Self> {
        let (state, _) = watch::channel(DocState::Loading);
        let (pending_mutations, _) = watch::channel(0);
        Arc::new(Self {
            doc_id: doc_id.to_string(),
            config,
            state,
            inner: Mutex::new(DocInner {
                sessions: HashMap::new(),
                in_flight: 0,
                last_activity: Utc::now(),
                inactivity_timer: None,
                timer_generation: 0,
                time_updater: None,
                exit_watch: None,
            }),
            pending_mutations,
            action_lock: tokio::sync::Mutex::new(()),
            engine: OnceLock::new(),
            load_error: OnceLock::new(),
            skip_grace: CancellationToken::new(),
            abort_load: CancellationToken::new(),
            table,
        })
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn state(&self) -> DocState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    pub fn num_clients(&self) -> usize {
        self.lock_inner().sessions.len()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.lock_inner().last_activity
    }

    /// Mutating calls that have started (or are queued) and not yet finished.
    pub fn pending_mutations(&self) -> usize {
        *self.pending_mutations.borrow()
    }

    pub fn is_inactivity_timer_armed(&self) -> bool {
        self.lock_inner().inactivity_timer.is_some()
    }

    pub(crate) fn config(&self) -> &DocHostConfig {
        &self.config
    }

    pub(crate) fn engine_handle(&self) -> Option<Arc<dyn CalcEngine>> {
        self.engine.get().cloned()
    }

    pub(crate) fn skip_grace_token(&self) -> CancellationToken {
        self.skip_grace.clone()
    }

    pub(crate) fn subscribe_pending_mutations(&self) -> watch::Receiver<usize> {
        self.pending_mutations.subscribe()
    }

    fn lock_inner(&self) -> MutexGuard<'_, DocInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn engine(&self) -> Result<&Arc<dyn CalcEngine>> {
        self.engine
            .get()
            .ok_or_else(|| DocHostError::DocClosed(self.doc_id.clone()))
    }

    /// Move to `next` if it is later than the current state.
    fn advance(&self, next: DocState) -> bool {
        self.state.send_if_modified(|state| {
            if state.can_advance_to(next) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Start the engine and open the document. Runs once, right after the
    /// registry creates the document. A shutdown requested meanwhile abandons
    /// the load, and an engine that arrives after that is killed.
    pub(crate) async fn load(self: Arc<Self>, factory: Arc<dyn EngineFactory>) {
        let started = Instant::now();
        let start = tokio::time::timeout(self.config.load_timeout(), factory.start(&self.doc_id));
        let result = tokio::select! {
            _ = self.abort_load.cancelled() => {
                tracing::info!(doc_id = %self.doc_id, "Shut down while loading, load abandoned");
                self.mark_closed();
                return;
            }
            result = start => match result {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout),
            },
        };

        let engine = match result {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!(doc_id = %self.doc_id, error = %e, "Failed to load document");
                let _ = self.load_error.set(e.to_string());
                self.mark_closed();
                return;
            }
        };

        let mut inner = self.lock_inner();
        if self.abort_load.is_cancelled() {
            drop(inner);
            tracing::info!(doc_id = %self.doc_id, "Shut down while loading, stopping engine");
            engine.kill();
            self.mark_closed();
            return;
        }
        if self.engine.set(engine.clone()).is_err() {
            drop(inner);
            tracing::error!(doc_id = %self.doc_id, "Document loaded twice");
            engine.kill();
            return;
        }
        if !self.advance(DocState::Open) {
            return;
        }
        if self.config.time_update.enabled {
            inner.time_updater = PeriodicTimeUpdater::start(
                Arc::downgrade(&self),
                self.doc_id.clone(),
                self.config.time_update.clone(),
            );
        }
        inner.exit_watch = watch_engine_exit(Arc::downgrade(&self), engine);
        self.maybe_arm(&mut inner);
        drop(inner);

        tracing::info!(
            doc_id = %self.doc_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Document opened"
        );
    }

    /// Wait until loading has finished. Fails if the document closed without
    /// ever opening.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|state| *state != DocState::Loading).await {
            Ok(state) => *state,
            Err(_) => DocState::Closed,
        };
        if state != DocState::Closed {
            return Ok(());
        }
        match self.load_error.get() {
            Some(reason) => Err(DocHostError::LoadFailed {
                doc_id: self.doc_id.clone(),
                reason: reason.clone(),
            }),
            None => Err(DocHostError::DocClosed(self.doc_id.clone())),
        }
    }

    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| state.is_closed()).await;
    }

    // =========================================================================
    // Client sessions
    // =========================================================================

    pub async fn add_client(
        self: &Arc<Self>,
        client: ClientConnection,
        authorizer: &dyn Authorizer,
    ) -> Result<ClientSession> {
        self.wait_ready().await?;
        let access = authorizer.authorize(&self.doc_id, &client)?;

        let mut inner = self.lock_inner();
        match self.state() {
            DocState::Open => {}
            DocState::ShuttingDown => return Err(DocHostError::DocShuttingDown(self.doc_id.clone())),
            DocState::Loading | DocState::Closed => {
                return Err(DocHostError::DocClosed(self.doc_id.clone()))
            }
        }

        let session = ClientSession::new(self, client.clone(), access);
        inner.sessions.insert(session.id(), client);
        inner.last_activity = Utc::now();
        self.disarm(&mut inner);

        tracing::info!(
            doc_id = %self.doc_id,
            session_id = %session.id(),
            user = %session.client().user,
            clients = inner.sessions.len(),
            "Client attached"
        );
        Ok(session)
    }

    /// Detach a session. The last session leaving an idle document arms the
    /// inactivity timer.
    ///
    /// # Panics
    ///
    /// Panics if the session was created by a different document.
    pub fn close_doc(self: &Arc<Self>, session: ClientSession) {
        self.assert_owns(&session);

        let mut inner = self.lock_inner();
        if inner.sessions.remove(&session.id()).is_none() {
            tracing::debug!(doc_id = %self.doc_id, session_id = %session.id(), "Session already detached");
            return;
        }
        inner.last_activity = Utc::now();
        tracing::info!(
            doc_id = %self.doc_id,
            session_id = %session.id(),
            clients = inner.sessions.len(),
            "Client detached"
        );
        self.maybe_arm(&mut inner);
    }

    fn assert_owns(&self, session: &ClientSession) {
        if !session.belongs_to(self) {
            panic!(
                "session {} for document {} used with document {}",
                session.id(),
                session.doc_id(),
                self.doc_id
            );
        }
    }

    // =========================================================================
    // Document calls
    // =========================================================================

    fn begin_op(self: &Arc<Self>, session: &ClientSession, mutating: bool) -> Result<OpGuard> {
        self.assert_owns(session);

        let mut inner = self.lock_inner();
        match self.state() {
            DocState::Open => {}
            DocState::ShuttingDown if !mutating => {}
            DocState::ShuttingDown => return Err(DocHostError::DocShuttingDown(self.doc_id.clone())),
            DocState::Loading | DocState::Closed => {
                return Err(DocHostError::DocClosed(self.doc_id.clone()))
            }
        }
        if !inner.sessions.contains_key(&session.id()) {
            return Err(DocHostError::SessionClosed(session.id()));
        }
        if mutating && !session.access().can_edit() {
            return Err(DocHostError::AccessDenied(format!(
                "{} has read-only access to {}",
                session.client().user,
                self.doc_id
            )));
        }

        inner.in_flight += 1;
        inner.last_activity = Utc::now();
        self.disarm(&mut inner);
        if mutating {
            self.pending_mutations.send_modify(|n| *n += 1);
        }

        Ok(OpGuard {
            doc: self.clone(),
            mutating,
        })
    }

    pub async fn apply_user_actions(
        self: &Arc<Self>,
        session: &ClientSession,
        actions: Vec<UserAction>,
    ) -> Result<ActionResult> {
        let _op = self.begin_op(session, true)?;
        let _turn = self.action_lock.lock().await;

        let engine = self.engine()?;
        let result = engine.apply(&actions).await?;
        tracing::debug!(
            doc_id = %self.doc_id,
            session_id = %session.id(),
            actions = actions.len(),
            "Applied user actions"
        );
        Ok(result)
    }

    /// Add rows to a table as a single `BulkAddRecord` action.
    pub async fn import_rows(
        self: &Arc<Self>,
        session: &ClientSession,
        table_id: &str,
        columns: BTreeMap<String, Vec<Value>>,
    ) -> Result<ActionResult> {
        let action = UserAction::bulk_add_record(table_id, &columns);
        let rows = columns.values().map(Vec::len).max().unwrap_or(0);
        let result = self.apply_user_actions(session, vec![action]).await?;
        tracing::info!(doc_id = %self.doc_id, table_id, rows, "Imported rows");
        Ok(result)
    }

    pub async fn fetch_table(
        self: &Arc<Self>,
        session: &ClientSession,
        table_id: &str,
    ) -> Result<TableSnapshot> {
        let _op = self.begin_op(session, false)?;
        let engine = self.engine()?;
        Ok(engine.fetch_table(table_id).await?)
    }

    /// Push wall-clock time into the engine. Not counted as activity.
    pub(crate) async fn push_current_time(&self) -> Result<()> {
        if self.state() != DocState::Open {
            return Ok(());
        }
        let _turn = self.action_lock.lock().await;
        if self.state() != DocState::Open {
            return Ok(());
        }
        let engine = self.engine()?;
        engine.update_current_time(Utc::now()).await?;
        Ok(())
    }

    // =========================================================================
    // Inactivity
    // =========================================================================

    fn maybe_arm(self: &Arc<Self>, inner: &mut DocInner) {
        let idle = self.state() == DocState::Open
            && inner.sessions.is_empty()
            && inner.in_flight == 0
            && inner.inactivity_timer.is_none();
        if !idle {
            return;
        }

        inner.timer_generation += 1;
        inner.inactivity_timer = arm_inactivity(
            Arc::downgrade(self),
            self.config.inactivity_timeout(),
            inner.timer_generation,
        );
        if inner.inactivity_timer.is_some() {
            tracing::debug!(
                doc_id = %self.doc_id,
                timeout_ms = self.config.inactivity_timeout_ms,
                "Inactivity timer armed"
            );
        }
    }

    fn disarm(&self, inner: &mut DocInner) {
        if let Some(timer) = inner.inactivity_timer.take() {
            inner.timer_generation += 1;
            timer.cancel();
            tracing::debug!(doc_id = %self.doc_id, "Inactivity timer disarmed");
        }
    }

    /// Shuts the document down if the timer that fired is still the current
    /// one. The idle check and the move to `ShuttingDown` happen under one
    /// lock, so a client attaching meanwhile always wins.
    pub(crate) async fn on_inactivity_timeout(self: Arc<Self>, generation: u64) {
        let Some(sequencer) = self.begin_shutdown(ShutdownMode::Graceful, Some(generation)) else {
            tracing::debug!(doc_id = %self.doc_id, "Stale inactivity timer ignored");
            return;
        };
        tracing::info!(
            doc_id = %self.doc_id,
            timeout_ms = self.config.inactivity_timeout_ms,
            "Document inactive, shutting down"
        );
        sequencer.run().await;
    }

    pub(crate) async fn on_engine_exit(self: Arc<Self>, exit: EngineExit) {
        if self.state() != DocState::Open {
            return;
        }
        tracing::warn!(
            doc_id = %self.doc_id,
            code = ?exit.code,
            "Engine exited while document was open, closing document"
        );
        self.shutdown(ShutdownMode::Forced).await;
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Shut the document down and wait until it is closed.
    ///
    /// A forced shutdown skips the graceful wait, including one already in
    /// progress. Completes within [`DocHostConfig::max_shutdown_time`] of the
    /// shutdown starting, whatever the engine is doing. A document still
    /// loading is abandoned rather than waited for.
    pub async fn shutdown(self: &Arc<Self>, mode: ShutdownMode) {
        self.abort_load.cancel();
        if mode == ShutdownMode::Forced {
            self.skip_grace.cancel();
        }
        if let Some(sequencer) = self.begin_shutdown(mode, None) {
            tokio::spawn(sequencer.run());
        }
        self.wait_closed().await;
    }

    /// Drop the in-memory document so the next open starts a fresh engine.
    /// Does not wait for in-flight calls.
    pub async fn reload_doc(self: &Arc<Self>) {
        tracing::info!(doc_id = %self.doc_id, "Reloading document");
        self.shutdown(ShutdownMode::Forced).await;
    }

    /// Move `Open -> ShuttingDown` and hand back the sequencer. With
    /// `idle_generation` set, only while that inactivity timer is still armed
    /// and the document is still idle.
    fn begin_shutdown(
        self: &Arc<Self>,
        mode: ShutdownMode,
        idle_generation: Option<u64>,
    ) -> Option<ShutdownSequencer> {
        let mut inner = self.lock_inner();
        if let Some(generation) = idle_generation {
            let still_idle = inner.timer_generation == generation
                && inner.inactivity_timer.is_some()
                && inner.sessions.is_empty()
                && inner.in_flight == 0;
            if !still_idle {
                return None;
            }
        }
        if self.state() != DocState::Open || !self.advance(DocState::ShuttingDown) {
            return None;
        }
        self.disarm(&mut inner);
        let time_updater = inner.time_updater.take();
        if let Some(updater) = &time_updater {
            updater.cancel();
        }
        Some(ShutdownSequencer::new(self.clone(), mode, time_updater))
    }

    /// Final transition: drop sessions and timers, leave the registry.
    pub(crate) fn mark_closed(&self) {
        {
            let mut inner = self.lock_inner();
            self.disarm(&mut inner);
            if let Some(updater) = inner.time_updater.take() {
                updater.cancel();
            }
            if let Some(watcher) = inner.exit_watch.take() {
                watcher.cancel();
            }
            inner.sessions.clear();
            self.advance(DocState::Closed);
        }

        if let Some(table) = self.table.upgrade() {
            let mut docs = table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let is_current = docs
                .get(&self.doc_id)
                .is_some_and(|doc| std::ptr::eq(Arc::as_ptr(doc), self));
            if is_current {
                docs.remove(&self.doc_id);
            }
        }
    }
}

/// Marks one call as in flight for as long as it lives.
struct OpGuard {
    doc: Arc<ActiveDocument>,
    mutating: bool,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        if self.mutating {
            self.doc
                .pending_mutations
                .send_modify(|n| *n = n.saturating_sub(1));
        }
        let mut inner = self.doc.lock_inner();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.last_activity = Utc::now();
        self.doc.maybe_arm(&mut inner);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::document::session::AllowAll;

    #[derive(Default)]
    struct CountingEngine {
        time_updates: AtomicUsize,
        exited: CancellationToken,
    }

    #[async_trait]
    impl CalcEngine for CountingEngine {
        async fn apply(&self, _actions: &[UserAction]) -> std::result::Result<ActionResult, EngineError> {
            Ok(ActionResult::default())
        }

        async fn fetch_table(&self, table_id: &str) -> std::result::Result<TableSnapshot, EngineError> {
            Ok(TableSnapshot {
                table_id: table_id.to_string(),
                ..Default::default()
            })
        }

        async fn update_current_time(&self, _now: DateTime<Utc>) -> std::result::Result<(), EngineError> {
            self.time_updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn request_shutdown(&self) -> std::result::Result<(), EngineError> {
            self.exited.cancel();
            Ok(())
        }

        fn kill(&self) {
            self.exited.cancel();
        }

        async fn wait_exit(&self) -> EngineExit {
            self.exited.cancelled().await;
            EngineExit::default()
        }
    }

    struct FixedFactory(Arc<CountingEngine>);

    #[async_trait]
    impl EngineFactory for FixedFactory {
        async fn start(&self, _doc_id: &str) -> std::result::Result<Arc<dyn CalcEngine>, EngineError> {
            Ok(self.0.clone())
        }
    }

    /// Timers long enough that nothing fires on its own during a test.
    async fn open_doc() -> (Arc<ActiveDocument>, Arc<CountingEngine>) {
        let mut config = DocHostConfig::for_tests();
        config.inactivity_timeout_ms = 60_000;
        config.time_update.enabled = false;

        let engine = Arc::new(CountingEngine::default());
        let doc = ActiveDocument::new("doc", Arc::new(config), Weak::new());
        doc.clone()
            .load(Arc::new(FixedFactory(engine.clone())))
            .await;
        assert_eq!(doc.state(), DocState::Open);
        (doc, engine)
    }

    fn timer_generation(doc: &ActiveDocument) -> u64 {
        doc.lock_inner().timer_generation
    }

    #[tokio::test]
    async fn current_inactivity_timer_shuts_down() {
        let (doc, engine) = open_doc().await;
        assert!(doc.is_inactivity_timer_armed());

        doc.clone().on_inactivity_timeout(timer_generation(&doc)).await;
        assert_eq!(doc.state(), DocState::Closed);
        assert!(engine.exited.is_cancelled());
    }

    #[tokio::test]
    async fn superseded_inactivity_timer_is_ignored() {
        let (doc, _engine) = open_doc().await;
        let generation = timer_generation(&doc);

        let _session = doc
            .add_client(ClientConnection::new("alice"), &AllowAll)
            .await
            .unwrap();
        doc.clone().on_inactivity_timeout(generation).await;
        assert_eq!(doc.state(), DocState::Open);
    }

    #[tokio::test]
    async fn inactivity_timer_rechecks_idleness_before_shutdown() {
        let (doc, _engine) = open_doc().await;
        let generation = timer_generation(&doc);

        // A session that got in while the timer was still armed.
        doc.lock_inner()
            .sessions
            .insert(Uuid::new_v4(), ClientConnection::new("late"));
        doc.clone().on_inactivity_timeout(generation).await;
        assert_eq!(doc.state(), DocState::Open);

        doc.lock_inner().sessions.clear();
        doc.lock_inner().in_flight = 1;
        doc.clone().on_inactivity_timeout(generation).await;
        assert_eq!(doc.state(), DocState::Open);
        doc.lock_inner().in_flight = 0;
    }

    #[tokio::test]
    async fn queued_time_update_is_dropped_once_shutdown_begins() {
        let (doc, engine) = open_doc().await;

        let turn = doc.action_lock.lock().await;
        let push = {
            let doc = doc.clone();
            tokio::spawn(async move { doc.push_current_time().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sequencer = doc
            .begin_shutdown(ShutdownMode::Forced, None)
            .expect("open document starts shutting down");
        drop(turn);

        push.await.unwrap().unwrap();
        assert_eq!(engine.time_updates.load(Ordering::SeqCst), 0);

        sequencer.run().await;
        assert_eq!(doc.state(), DocState::Closed);
    }

    #[tokio::test]
    async fn unexpected_engine_exit_closes_document() {
        let (doc, engine) = open_doc().await;
        let _session = doc
            .add_client(ClientConnection::new("alice"), &AllowAll)
            .await
            .unwrap();

        engine.kill();
        tokio::time::timeout(Duration::from_secs(1), doc.wait_closed())
            .await
            .expect("document closes after its engine exits");
        assert_eq!(doc.num_clients(), 0);
    }
}
