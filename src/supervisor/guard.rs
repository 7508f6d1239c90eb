//! Process-wide record of live server children.
//!
//! Children are spawned with `kill_on_drop`, which covers orderly drops.
//! The guard covers the rest: a panic on the main thread or an exit
//! signal force-kills every PID still registered.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{info, warn};

pub struct OrphanGuard {
    pids: Mutex<HashSet<u32>>,
    installed: AtomicBool,
}

impl OrphanGuard {
    pub fn new() -> Self {
        Self {
            pids: Mutex::new(HashSet::new()),
            installed: AtomicBool::new(false),
        }
    }

    /// The guard shared by every supervisor in this process.
    pub fn global() -> Arc<OrphanGuard> {
        static GLOBAL: OnceLock<Arc<OrphanGuard>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(OrphanGuard::new())).clone()
    }

    pub fn register(&self, pid: u32) {
        self.pids.lock().insert(pid);
    }

    pub fn unregister(&self, pid: u32) {
        self.pids.lock().remove(&pid);
    }

    pub fn tracked(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.pids.lock().iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Force-kill every registered child, synchronously. Returns how many
    /// kill requests succeeded.
    pub fn kill_all(&self) -> usize {
        let pids: Vec<u32> = self.pids.lock().drain().collect();
        pids.into_iter().filter(|pid| kill_pid_blocking(*pid)).count()
    }

    /// Register exit handlers once per guard: a main-thread panic hook and,
    /// when called inside a tokio runtime, a Ctrl-C / SIGTERM watcher that
    /// kills children before exiting.
    pub fn install(self: &Arc<Self>) {
        if self.installed.swap(true, Ordering::SeqCst) {
            return;
        }

        let guard = Arc::clone(self);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            if std::thread::current().name() == Some("main") {
                guard.kill_all();
            }
            previous(panic_info);
        }));

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let guard = Arc::clone(self);
            handle.spawn(async move {
                wait_for_exit_signal().await;
                let killed = guard.kill_all();
                info!(killed, "Exit signal received, server children killed");
                std::process::exit(130);
            });
        }
    }
}

impl Default for OrphanGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_exit_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, watching Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_exit_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn kill_pid_blocking(pid: u32) -> bool {
    let pid = pid.to_string();
    #[cfg(unix)]
    let status = std::process::Command::new("kill")
        .args(["-KILL", &pid])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    #[cfg(windows)]
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    #[cfg(not(any(unix, windows)))]
    let status: std::io::Result<std::process::ExitStatus> =
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "no kill utility"));

    match status {
        Ok(s) => s.success(),
        Err(e) => {
            warn!(pid = %pid, error = %e, "Could not kill orphaned server");
            false
        }
    }
}
