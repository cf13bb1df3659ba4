use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::engine::{
    ActionResult, CalcEngine, EngineError, EngineExit, EngineFactory, TableSnapshot, UserAction,
};

type Reply = oneshot::Sender<Result<Value, EngineError>>;

#[derive(Default)]
struct PendingCalls {
    closed: bool,
    calls: HashMap<u64, Reply>,
}

type SharedPending = Arc<Mutex<PendingCalls>>;

fn lock(pending: &SharedPending) -> MutexGuard<'_, PendingCalls> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fail every outstanding call and refuse new ones.
fn close_pending(pending: &SharedPending) {
    let calls = {
        let mut guard = lock(pending);
        guard.closed = true;
        std::mem::take(&mut guard.calls)
    };
    for (_, reply) in calls {
        let _ = reply.send(Err(EngineError::PipeClosed));
    }
}

#[derive(Serialize)]
struct EngineRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct EngineResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// A calculation engine running as a child process.
///
/// Requests are newline-delimited JSON written to the child's stdin:
/// `{"id": 1, "method": "apply", "params": {...}}`. The child answers on stdout
/// with `{"id": 1, "result": ...}` or `{"id": 1, "error": "..."}`; answers may
/// arrive in any order. Stderr is forwarded to tracing.
///
/// When the child exits, for any reason, all outstanding calls fail with
/// [`EngineError::PipeClosed`].
pub struct ProcessEngine {
    doc_id: String,
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: SharedPending,
    next_id: AtomicU64,
    kill_token: CancellationToken,
    exit_rx: watch::Receiver<Option<EngineExit>>,
}

impl ProcessEngine {
    /// Spawn the engine process for `doc_id`. The document id is appended to
    /// the configured arguments.
    pub fn spawn(config: &EngineConfig, doc_id: &str) -> Result<Self, EngineError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .arg(doc_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Protocol("engine stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Protocol("engine stdout not captured".to_string()))?;
        let stderr = child.stderr.take();

        let pending: SharedPending = Arc::default();
        let kill_token = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(read_responses(doc_id.to_string(), stdout, pending.clone()));
        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(doc_id.to_string(), stderr));
        }
        tokio::spawn(monitor_exit(
            doc_id.to_string(),
            child,
            kill_token.clone(),
            pending.clone(),
            exit_tx,
        ));

        tracing::info!(doc_id = %doc_id, pid = ?pid, command = %config.command, "Engine started");

        Ok(Self {
            doc_id: doc_id.to_string(),
            pid,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            kill_token,
            exit_rx,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(EngineError::PipeClosed);
            }
            let (tx, rx) = oneshot::channel();
            pending.calls.insert(id, tx);
            rx
        };

        let line = serde_json::to_string(&EngineRequest { id, method, params })
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        if let Err(e) = self.write_line(&line).await {
            lock(&self.pending).calls.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::PipeClosed),
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), EngineError> {
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(EngineError::PipeClosed)?;
        let written = async {
            pipe.write_all(line.as_bytes()).await?;
            pipe.write_all(b"\n").await?;
            pipe.flush().await
        }
        .await;
        written.map_err(|e| {
            tracing::debug!(doc_id = %self.doc_id, error = %e, "Engine write failed");
            EngineError::PipeClosed
        })
    }
}

#[async_trait]
impl CalcEngine for ProcessEngine {
    async fn apply(&self, actions: &[UserAction]) -> Result<ActionResult, EngineError> {
        let value = self
            .call("apply", serde_json::json!({ "actions": actions }))
            .await?;
        serde_json::from_value(value).map_err(|e| EngineError::Protocol(e.to_string()))
    }

    async fn fetch_table(&self, table_id: &str) -> Result<TableSnapshot, EngineError> {
        let value = self
            .call("fetch_table", serde_json::json!({ "table_id": table_id }))
            .await?;
        serde_json::from_value(value).map_err(|e| EngineError::Protocol(e.to_string()))
    }

    async fn update_current_time(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.call(
            "update_current_time",
            serde_json::json!({ "now": now.to_rfc3339() }),
        )
        .await?;
        Ok(())
    }

    async fn request_shutdown(&self) -> Result<(), EngineError> {
        self.call("shutdown", Value::Null).await?;
        // Closing stdin tells the engine no more requests are coming.
        self.stdin.lock().await.take();
        let exit = self.wait_exit().await;
        tracing::debug!(doc_id = %self.doc_id, code = ?exit.code, "Engine exited after shutdown");
        Ok(())
    }

    fn kill(&self) {
        tracing::warn!(doc_id = %self.doc_id, pid = ?self.pid, "Killing engine process");
        self.kill_token.cancel();
    }

    async fn wait_exit(&self) -> EngineExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or_default(),
            Err(_) => EngineExit::default(),
        };
        exit
    }
}

async fn read_responses(doc_id: String, stdout: ChildStdout, pending: SharedPending) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => dispatch_response(&doc_id, &line, &pending),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(doc_id = %doc_id, error = %e, "Failed reading engine output");
                break;
            }
        }
    }
    close_pending(&pending);
}

fn dispatch_response(doc_id: &str, line: &str, pending: &SharedPending) {
    let response: EngineResponse = match serde_json::from_str(line) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(doc_id = %doc_id, error = %e, "Ignoring malformed engine output");
            return;
        }
    };
    let Some(reply) = lock(pending).calls.remove(&response.id) else {
        tracing::warn!(doc_id = %doc_id, id = response.id, "Engine answered unknown request");
        return;
    };
    let result = match response.error {
        Some(message) => Err(EngineError::Failed(message)),
        None => Ok(response.result.unwrap_or(Value::Null)),
    };
    let _ = reply.send(result);
}

async fn forward_stderr(doc_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(doc_id = %doc_id, "engine: {}", line);
    }
}

async fn monitor_exit(
    doc_id: String,
    mut child: Child,
    kill_token: CancellationToken,
    pending: SharedPending,
    exit_tx: watch::Sender<Option<EngineExit>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_token.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(doc_id = %doc_id, error = %e, "Failed to signal engine process");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(doc_id = %doc_id, error = %e, "Failed to collect engine exit status");
            None
        }
    };
    tracing::info!(doc_id = %doc_id, code = ?code, "Engine exited");

    close_pending(&pending);
    let _ = exit_tx.send(Some(EngineExit { code }));
}

/// Starts a [`ProcessEngine`] per document from a fixed command line.
#[derive(Debug, Clone)]
pub struct ProcessEngineFactory {
    config: EngineConfig,
}

impl ProcessEngineFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EngineFactory for ProcessEngineFactory {
    async fn start(&self, doc_id: &str) -> Result<Arc<dyn CalcEngine>, EngineError> {
        let engine = ProcessEngine::spawn(&self.config, doc_id)?;
        Ok(Arc::new(engine))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sh(script: &str) -> EngineConfig {
        EngineConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
        }
    }

    /// Answers every request with a null result, echoing its id.
    fn echo_engine() -> EngineConfig {
        sh(r#"sed -u 's/^{"id":\([0-9]*\),.*$/{"id":\1,"result":null}/'"#)
    }

    #[tokio::test]
    async fn answers_are_routed_by_id() {
        let engine = ProcessEngine::spawn(&echo_engine(), "doc").unwrap();
        assert!(engine.pid().is_some());

        engine.update_current_time(Utc::now()).await.unwrap();
        engine.update_current_time(Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_stdin_and_waits_for_exit() {
        let engine = ProcessEngine::spawn(&echo_engine(), "doc").unwrap();

        tokio::time::timeout(Duration::from_secs(5), engine.request_shutdown())
            .await
            .expect("shutdown should finish")
            .unwrap();

        let exit = engine.wait_exit().await;
        assert_eq!(exit.code, Some(0));
        assert!(matches!(
            engine.update_current_time(Utc::now()).await,
            Err(EngineError::PipeClosed)
        ));
    }

    #[tokio::test]
    async fn kill_fails_pending_calls_with_pipe_closed() {
        // Never reads or answers.
        let engine = Arc::new(ProcessEngine::spawn(&sh("sleep 30"), "doc").unwrap());

        let call = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.apply(&[UserAction::new(Value::Null)]).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!call.is_finished());

        engine.kill();

        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("pending call should fail after kill")
            .unwrap();
        assert!(matches!(result, Err(EngineError::PipeClosed)));

        let exit = engine.wait_exit().await;
        assert_eq!(exit.code, None);
    }

    #[tokio::test]
    async fn engine_error_is_reported() {
        let engine = ProcessEngine::spawn(
            &sh(r#"sed -u 's/^{"id":\([0-9]*\),.*$/{"id":\1,"error":"boom"}/'"#),
            "doc",
        )
        .unwrap();

        match engine.fetch_table("Table1").await {
            Err(EngineError::Failed(message)) => assert_eq!(message, "boom"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn exit_without_answer_fails_call() {
        let engine = ProcessEngine::spawn(&sh("read line; exit 3"), "doc").unwrap();

        let result = engine.apply(&[]).await;
        assert!(matches!(result, Err(EngineError::PipeClosed)));
        assert_eq!(engine.wait_exit().await.code, Some(3));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let config = EngineConfig {
            command: "/nonexistent/engine-binary".to_string(),
            args: Vec::new(),
        };
        assert!(matches!(
            ProcessEngine::spawn(&config, "doc"),
            Err(EngineError::Spawn(_))
        ));
    }
}
