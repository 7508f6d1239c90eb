//! llama-server process supervision.

mod executable;
mod guard;
mod process;

pub use executable::{resolve_executable, search_path, EXECUTABLE_CANDIDATES};
pub use guard::OrphanGuard;
pub use process::{
    ProcessSupervisor, SupervisorError, SupervisorOptions, SupervisorState, SERVER_OUTPUT_TARGET,
};
