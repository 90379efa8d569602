//! Model lifecycle: discovery, per-file handles, residency.
//!
//! Watches model directories, tracks one handle per file, and decides which
//! weights stay resident in accelerator memory.

mod consumers;
mod handle;
mod registry;
mod stage;
mod watcher;

pub use consumers::{ChatSession, CompletionEngine};
pub use handle::{model_id, HandleStatus, ModelHandle, ModelInfo};
pub use registry::ModelRegistry;
pub use stage::StageStatus;
pub use watcher::{DirectoryWatcher, WatchError, WatchEvent};
