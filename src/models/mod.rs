//! Model lifecycle: failure accounting, the active slot, loading and warm-up.

mod ledger;
mod orchestrator;
mod preload;
mod registry;

pub use ledger::{FailureEntry, FailureLedger};
pub use orchestrator::{LoadError, LoadOrchestrator};
pub use preload::{PreloadErrorLog, PreloadFailure, WarmupPool};
pub use registry::ActiveModelRegistry;
