pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod placement;
pub mod registry;
pub mod shutdown;

pub use error::{DocHostError, Result};
pub use registry::DocRegistry;
