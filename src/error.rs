use thiserror::Error;
use uuid::Uuid;

use crate::engine::EngineError;

#[derive(Error, Debug)]
pub enum DocHostError {
    #[error("Document {0} is shutting down")]
    DocShuttingDown(String),

    #[error("Document {0} is closed")]
    DocClosed(String),

    #[error("Document {doc_id} failed to load: {reason}")]
    LoadFailed { doc_id: String, reason: String },

    #[error("Session {0} is not attached to its document")]
    SessionClosed(Uuid),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Calculation engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid worker load report: {0}")]
    InvalidReport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DocHostError {
    /// True when the error came from a calculation engine whose pipe went away,
    /// either because the process exited or because it was killed.
    pub fn is_pipe_closed(&self) -> bool {
        matches!(self, DocHostError::Engine(e) if e.is_pipe_closed())
    }
}

pub type Result<T> = std::result::Result<T, DocHostError>;
