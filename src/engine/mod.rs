//! Calculation engine interface.
//!
//! Every open document owns exactly one calculation engine. The engine is
//! reached only through the [`CalcEngine`] trait so the host does not care
//! whether it is a separate process, a thread, or an in-process evaluator:
//!
//! - [`CalcEngine::apply`] / [`CalcEngine::fetch_table`]: the document's data calls
//! - [`CalcEngine::update_current_time`]: keeps time-dependent formulas current
//! - [`CalcEngine::request_shutdown`]: cooperative stop
//! - [`CalcEngine::kill`]: forced stop, fails every pending call with
//!   [`EngineError::PipeClosed`]
//! - [`CalcEngine::wait_exit`]: resolves once the engine is gone
//!
//! [`process::ProcessEngine`] is the production implementation.

pub mod process;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use process::{ProcessEngine, ProcessEngineFactory};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine pipe closed")]
    PipeClosed,

    #[error("Failed to spawn engine: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Engine protocol error: {0}")]
    Protocol(String),

    #[error("Engine reported failure: {0}")]
    Failed(String),

    #[error("Engine did not respond in time")]
    Timeout,
}

impl EngineError {
    pub fn is_pipe_closed(&self) -> bool {
        matches!(self, EngineError::PipeClosed)
    }
}

/// One user action, passed through to the engine untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserAction(pub Value);

impl UserAction {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// `["BulkAddRecord", table_id, row_ids, columns]`
    pub fn bulk_add_record(table_id: &str, columns: &BTreeMap<String, Vec<Value>>) -> Self {
        let row_count = columns.values().map(Vec::len).max().unwrap_or(0);
        let row_ids: Vec<Value> = (0..row_count).map(|_| Value::Null).collect();
        Self(serde_json::json!(["BulkAddRecord", table_id, row_ids, columns]))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    #[serde(default)]
    pub ret_values: Vec<Value>,
}

/// Column-oriented contents of one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub table_id: String,
    #[serde(default)]
    pub columns: BTreeMap<String, Vec<Value>>,
}

impl TableSnapshot {
    pub fn num_rows(&self) -> usize {
        self.columns.values().map(Vec::len).max().unwrap_or(0)
    }
}

/// How the engine went away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineExit {
    pub code: Option<i32>,
}

#[async_trait]
pub trait CalcEngine: Send + Sync {
    async fn apply(&self, actions: &[UserAction]) -> Result<ActionResult, EngineError>;

    async fn fetch_table(&self, table_id: &str) -> Result<TableSnapshot, EngineError>;

    async fn update_current_time(&self, now: DateTime<Utc>) -> Result<(), EngineError>;

    /// Ask the engine to finish outstanding cleanup and exit. Callers bound
    /// this with a timeout; an engine busy in a long computation may never answer.
    async fn request_shutdown(&self) -> Result<(), EngineError>;

    /// Terminate the engine immediately. Must not wait on the engine itself.
    fn kill(&self);

    async fn wait_exit(&self) -> EngineExit;
}

/// Starts one engine per opened document.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn start(&self, doc_id: &str) -> Result<Arc<dyn CalcEngine>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_add_record_shape() {
        let mut columns = BTreeMap::new();
        columns.insert("name".to_string(), vec![Value::from("a"), Value::from("b")]);
        let action = UserAction::bulk_add_record("People", &columns);
        assert_eq!(
            action.0,
            serde_json::json!(["BulkAddRecord", "People", [null, null], {"name": ["a", "b"]}])
        );
    }

    #[test]
    fn table_snapshot_num_rows() {
        let mut snapshot = TableSnapshot {
            table_id: "T".to_string(),
            columns: BTreeMap::new(),
        };
        assert_eq!(snapshot.num_rows(), 0);
        snapshot
            .columns
            .insert("id".to_string(), vec![Value::from(1), Value::from(2)]);
        assert_eq!(snapshot.num_rows(), 2);
    }

    #[test]
    fn action_result_missing_ret_values() {
        let result: ActionResult = serde_json::from_str("{}").unwrap();
        assert!(result.ret_values.is_empty());
    }
}
