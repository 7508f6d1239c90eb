//! Provider error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::ProviderState;
use crate::supervisor::SupervisorError;

/// Failure to bring a provider to `Ready`.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("Model file not found: {0}")]
    ModelFileMissing(PathBuf),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Initialization failed after {attempts} attempt(s): {last_error}")]
    InitializationFailure { attempts: usize, last_error: String },

    #[error("Server never became healthy after {attempts} probe(s)")]
    ServerStartupTimeout { attempts: u32 },

    #[error("Server supervision failed: {0}")]
    Supervisor(SupervisorError),
}

impl From<SupervisorError> for InitError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::StartupTimeout { attempts } => Self::ServerStartupTimeout { attempts },
            SupervisorError::ExecutableNotFound(what) => {
                Self::BackendUnavailable(format!("llama-server executable not found: {what}"))
            }
            other => Self::Supervisor(other),
        }
    }
}

/// Failure of a single generation call. The provider stays usable.
#[derive(Error, Debug)]
pub enum GenError {
    #[error("Provider is not ready (state: {0})")]
    NotReady(ProviderState),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Backend returned no text")]
    EmptyResponse,
}

impl From<reqwest::Error> for GenError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}
