//! Runtime objects for open documents.
//!
//! - [`ActiveDocument`]: one open document, its sessions, timers and engine
//! - [`ClientSession`]: one client attached to one document
//! - [`DocState`]: the document lifecycle
//!
//! Idle detection lives in `timers`, and the periodic time push in
//! `time_updater`. Teardown is in [`crate::shutdown`].

pub mod active;
pub mod session;
pub mod state;
pub(crate) mod time_updater;
pub(crate) mod timers;

pub use active::ActiveDocument;
pub use session::{Access, AllowAll, Authorizer, ClientConnection, ClientSession, DenyAll, ViewOnly};
pub use state::DocState;
