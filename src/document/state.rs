use serde::Serialize;

/// Lifecycle of an open document. Variants are ordered; a document only ever
/// moves to a later state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DocState {
    Loading,
    Open,
    ShuttingDown,
    Closed,
}

impl DocState {
    pub fn can_advance_to(self, next: DocState) -> bool {
        next > self
    }

    pub fn is_closed(self) -> bool {
        self == DocState::Closed
    }
}

impl std::fmt::Display for DocState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocState::Loading => write!(f, "loading"),
            DocState::Open => write!(f, "open"),
            DocState::ShuttingDown => write!(f, "shutting_down"),
            DocState::Closed => write!(f, "closed"),
        }
    }
}
