//! Lifecycle of one llama-server child process.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::executable::resolve_executable;
use super::guard::OrphanGuard;
use crate::config::ServerConfig;

/// Target carrying forwarded child output.
pub const SERVER_OUTPUT_TARGET: &str = "gg_orchestrator::server_output";

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Failed to spawn server: {0}")]
    Spawn(String),

    #[error("Server not healthy after {attempts} probe(s)")]
    StartupTimeout { attempts: u32 },

    #[error("Server exited during startup: {0}")]
    StartupExited(String),

    #[error("Failed to terminate server (pid {pid}): {reason}")]
    TerminationFailed { pid: u32, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Starting,
    HealthCheckPending,
    Ready,
    StartupFailed,
    Terminating,
    Stopped,
    Killed,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::HealthCheckPending => "health_check_pending",
            Self::Ready => "ready",
            Self::StartupFailed => "startup_failed",
            Self::Terminating => "terminating",
            Self::Stopped => "stopped",
            Self::Killed => "killed",
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub health_interval: Duration,
    pub health_attempts: u32,
    pub probe_timeout: Duration,
    pub terminate_timeout: Duration,
}

impl From<&ServerConfig> for SupervisorOptions {
    fn from(c: &ServerConfig) -> Self {
        Self {
            health_interval: c.health_interval,
            health_attempts: c.health_attempts,
            probe_timeout: c.probe_timeout,
            terminate_timeout: c.terminate_timeout,
        }
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

enum Reaped {
    Graceful,
    Killed,
}

/// Owns at most one child at a time on a fixed host and port.
pub struct ProcessSupervisor {
    host: String,
    port: u16,
    options: SupervisorOptions,
    client: reqwest::Client,
    guard: Arc<OrphanGuard>,
    state: RwLock<SupervisorState>,
    child: Mutex<Option<Child>>,
    pid: RwLock<Option<u32>>,
    reused: RwLock<bool>,
    label: String,
}

impl ProcessSupervisor {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        options: SupervisorOptions,
        client: reqwest::Client,
        guard: Arc<OrphanGuard>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            options,
            client,
            guard,
            state: RwLock::new(SupervisorState::NotStarted),
            child: Mutex::new(None),
            pid: RwLock::new(None),
            reused: RwLock::new(false),
            label: String::new(),
        }
    }

    /// Tag forwarded output lines with a model name.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.read()
    }

    /// PID of the most recently spawned child, if any.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.read()
    }

    /// True when `start` adopted a server that was already listening.
    pub fn is_reused(&self) -> bool {
        *self.reused.read()
    }

    fn set_state(&self, next: SupervisorState) {
        let prev = std::mem::replace(&mut *self.state.write(), next);
        if prev != next {
            debug!(port = self.port, from = %prev, to = %next, "Supervisor state");
        }
    }

    /// One health probe: `GET /health` answering 200.
    pub async fn probe(&self) -> bool {
        let url = format!("{}/health", self.base_url());
        match self
            .client
            .get(&url)
            .timeout(self.options.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Bring a healthy server up on the configured port.
    ///
    /// A server already answering health probes is adopted and never
    /// spawned or killed by this supervisor.
    pub async fn start(&self, executable: Option<&Path>, args: &[String]) -> Result<(), SupervisorError> {
        let mut slot = self.child.lock().await;
        if slot.is_some() && self.state() == SupervisorState::Ready {
            return Ok(());
        }

        if self.probe().await {
            info!(addr = %self.base_url(), "Reusing running llama-server");
            *self.reused.write() = true;
            self.set_state(SupervisorState::Ready);
            return Ok(());
        }
        *self.reused.write() = false;

        self.set_state(SupervisorState::Starting);
        let program = match resolve_executable(executable) {
            Some(p) => p,
            None => {
                self.set_state(SupervisorState::StartupFailed);
                let wanted = executable
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "llama-server".to_string());
                return Err(SupervisorError::ExecutableNotFound(wanted));
            }
        };

        let mut child = self.spawn(&program, args).map_err(|e| {
            self.set_state(SupervisorState::StartupFailed);
            e
        })?;
        let pid = child.id();
        *self.pid.write() = pid;
        if let Some(pid) = pid {
            self.guard.register(pid);
        }
        info!(program = %program.display(), pid = ?pid, port = self.port, "llama-server spawned");

        self.set_state(SupervisorState::HealthCheckPending);
        match self.await_healthy(&mut child).await {
            Ok(()) => {
                self.set_state(SupervisorState::Ready);
                *slot = Some(child);
                Ok(())
            }
            Err(e) => {
                warn!(pid = ?pid, error = %e, "llama-server failed to start");
                if let Err(reap) = self.reap(&mut child, pid).await {
                    warn!(error = %reap, "Failed to reap server after startup failure");
                }
                self.set_state(SupervisorState::StartupFailed);
                Err(e)
            }
        }
    }

    fn spawn(&self, program: &Path, args: &[String]) -> Result<Child, SupervisorError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn(format!("{}: {e}", program.display())))?;

        let pid = child.id().unwrap_or(0);
        if let Some(out) = child.stdout.take() {
            forward_output(out, self.label.clone(), "stdout", pid);
        }
        if let Some(err) = child.stderr.take() {
            forward_output(err, self.label.clone(), "stderr", pid);
        }
        Ok(child)
    }

    async fn await_healthy(&self, child: &mut Child) -> Result<(), SupervisorError> {
        for attempt in 1..=self.options.health_attempts {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(SupervisorError::StartupExited(status.to_string()));
            }
            if self.probe().await {
                debug!(attempt, "llama-server healthy");
                return Ok(());
            }
            tokio::time::sleep(self.options.health_interval).await;
        }
        Err(SupervisorError::StartupTimeout {
            attempts: self.options.health_attempts,
        })
    }

    /// Graceful terminate, then force-kill past the timeout.
    async fn reap(&self, child: &mut Child, pid: Option<u32>) -> Result<Reaped, SupervisorError> {
        let timeout = self.options.terminate_timeout;
        let outcome = if let Ok(Some(_)) = child.try_wait() {
            Ok(Reaped::Graceful)
        } else {
            if let Some(pid) = pid {
                send_terminate(child, pid).await;
            }
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(_)) => Ok(Reaped::Graceful),
                _ => {
                    warn!(pid = ?pid, "llama-server ignored terminate, killing");
                    let _ = child.start_kill();
                    match tokio::time::timeout(timeout, child.wait()).await {
                        Ok(Ok(_)) => Ok(Reaped::Killed),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err("still running after kill".to_string()),
                    }
                }
            }
        };

        match outcome {
            Ok(reaped) => {
                if let Some(pid) = pid {
                    self.guard.unregister(pid);
                }
                Ok(reaped)
            }
            Err(reason) => Err(SupervisorError::TerminationFailed {
                pid: pid.unwrap_or(0),
                reason,
            }),
        }
    }

    /// Stop the owned child, if any. An adopted server is left running.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        let mut slot = self.child.lock().await;
        let Some(mut child) = slot.take() else {
            if matches!(self.state(), SupervisorState::Ready) {
                *self.reused.write() = false;
                self.set_state(SupervisorState::Stopped);
            }
            return Ok(());
        };

        self.set_state(SupervisorState::Terminating);
        let pid = child.id().or(self.pid());
        match self.reap(&mut child, pid).await? {
            Reaped::Graceful => {
                info!(pid = ?pid, "llama-server stopped");
                self.set_state(SupervisorState::Stopped);
            }
            Reaped::Killed => {
                info!(pid = ?pid, "llama-server killed");
                self.set_state(SupervisorState::Killed);
            }
        }
        Ok(())
    }

    /// Force-kill the owned child without a graceful phase.
    pub async fn kill(&self) -> Result<(), SupervisorError> {
        let mut slot = self.child.lock().await;
        let Some(mut child) = slot.take() else {
            return Ok(());
        };
        let pid = child.id().or(self.pid());
        let _ = child.start_kill();
        match tokio::time::timeout(self.options.terminate_timeout, child.wait()).await {
            Ok(Ok(_)) => {
                if let Some(pid) = pid {
                    self.guard.unregister(pid);
                }
                self.set_state(SupervisorState::Killed);
                Ok(())
            }
            Ok(Err(e)) => Err(SupervisorError::TerminationFailed {
                pid: pid.unwrap_or(0),
                reason: e.to_string(),
            }),
            Err(_) => Err(SupervisorError::TerminationFailed {
                pid: pid.unwrap_or(0),
                reason: "still running after kill".to_string(),
            }),
        }
    }
}

async fn send_terminate(child: &mut Child, pid: u32) {
    #[cfg(unix)]
    {
        let status = tokio::time::timeout(
            Duration::from_secs(2),
            Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await;
        if matches!(status, Ok(Ok(s)) if s.success()) {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    let _ = child.start_kill();
}

/// Drain a child pipe into tracing. Reads raw lines so invalid UTF-8
/// never stops the drain and blocks the child.
fn forward_output<R>(reader: R, model: String, stream: &'static str, pid: u32)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if !line.is_empty() {
                        info!(target: SERVER_OUTPUT_TARGET, model = %model, stream, pid, "{line}");
                    }
                }
                Err(e) => {
                    debug!(stream, pid, error = %e, "Server output closed");
                    break;
                }
            }
        }
    });
}
