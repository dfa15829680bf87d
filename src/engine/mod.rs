//! Per-unit execution: discovery builds the inventory, checks evaluate it.

pub mod check;
pub mod context;
pub mod discovery;

pub use check::CheckExecutor;
pub use context::{EvaluationContext, SavedContext};
pub use discovery::{DiscoveryExecutor, Inventory};
