//! Emulator process lifecycle.
//!
//! The supervisor launches the emulator, advertises the bridge port through
//! a side-channel file the embedded script reads, and watches for process
//! exit. An unexpected exit ends the session; a deliberate one (manual
//! close, config-driven relaunch) is announced ahead of time by setting
//! restart mode, and the exit that restart mode suppresses consumes the
//! flag. That consumption is what makes the relaunch race safe: the old
//! process's delayed exit callback burns the flag, and a later genuine crash
//! of the replacement process is reported normally.
//!
//! Termination signals by pid rather than through the child handle, so no
//! lock is held across the kill path and the grace-period task cannot
//! deadlock a caller.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::Notify;

/// Grace period between the termination signal and the forced kill.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Invoked on process exit with `(exit_code, expected)`. `expected` is true
/// when restart mode suppressed the exit.
pub type ExitCallback = Arc<dyn Fn(Option<i32>, bool) + Send + Sync>;

struct Inner {
    exe: String,
    args: Vec<String>,
    work_dir: PathBuf,
    port_file: PathBuf,
    pid: Mutex<Option<u32>>,
    restart_mode: AtomicBool,
    exited: Notify,
    on_exit: Mutex<Option<ExitCallback>>,
}

/// Owns the emulator subprocess.
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("exe", &self.inner.exe)
            .field("running", &self.is_running())
            .field("restart_mode", &self.restart_mode())
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    /// New supervisor for the given executable spec and working directory.
    #[must_use]
    pub fn new(exe: impl Into<String>, work_dir: PathBuf, port_file: PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner {
                exe: exe.into(),
                args: Vec::new(),
                work_dir,
                port_file,
                pid: Mutex::new(None),
                restart_mode: AtomicBool::new(false),
                exited: Notify::new(),
                on_exit: Mutex::new(None),
            }),
        }
    }

    /// Extra arguments passed to the emulator on every launch.
    #[must_use]
    pub fn with_args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = Arc::try_unwrap(self.inner)
            .unwrap_or_else(|_| panic!("with_args must be called before the supervisor is shared"));
        inner.args = args.into_iter().map(Into::into).collect();
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Install the exit callback. Replaces any previous one.
    pub fn on_exit(&self, callback: ExitCallback) {
        *self.inner.on_exit.lock().expect("callback lock poisoned") = Some(callback);
    }

    /// Whether a monitored process is currently alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.pid.lock().expect("pid lock poisoned").is_some()
    }

    /// Set or clear restart mode ahead of a deliberate termination.
    pub fn set_restart_mode(&self, on: bool) {
        self.inner.restart_mode.store(on, Ordering::SeqCst);
        log::debug!("[Supervisor] restart mode {}", if on { "set" } else { "cleared" });
    }

    /// Current restart-mode flag.
    #[must_use]
    pub fn restart_mode(&self) -> bool {
        self.inner.restart_mode.load(Ordering::SeqCst)
    }

    /// User-initiated launch. Clears restart mode once the process is up.
    pub fn launch(&self, bridge_port: u16) -> Result<()> {
        self.spawn_process(bridge_port)?;
        self.inner.restart_mode.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Relaunch after a config-driven termination. Restart mode is left as
    /// is, so the old process's delayed exit callback stays suppressed.
    pub fn relaunch(&self, bridge_port: u16) -> Result<()> {
        self.spawn_process(bridge_port)
    }

    fn spawn_process(&self, bridge_port: u16) -> Result<()> {
        let exe = resolve_executable(&self.inner.exe)?;

        std::fs::create_dir_all(&self.inner.work_dir)
            .with_context(|| format!("creating {}", self.inner.work_dir.display()))?;
        if let Some(parent) = self.inner.port_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // The embedded script discovers our listening port through this file
        std::fs::write(&self.inner.port_file, bridge_port.to_string())
            .with_context(|| format!("writing {}", self.inner.port_file.display()))?;

        let mut child = tokio::process::Command::new(&exe)
            .args(&self.inner.args)
            .current_dir(&self.inner.work_dir)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("launching {}", exe.display()))?;

        let pid = child.id();
        *self.inner.pid.lock().expect("pid lock poisoned") = pid;
        log::info!("[Supervisor] launched {} (pid {:?})", exe.display(), pid);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let status = child.wait().await;
            let code = status.ok().and_then(|s| s.code());
            {
                let mut guard = inner.pid.lock().expect("pid lock poisoned");
                if *guard == pid {
                    *guard = None;
                }
            }
            inner.exited.notify_waiters();

            let expected = inner.restart_mode.swap(false, Ordering::SeqCst);
            if expected {
                log::info!("[Supervisor] process exited as part of a restart (code {code:?})");
            } else {
                log::warn!("[Supervisor] process exited unexpectedly (code {code:?})");
            }

            let callback = inner.on_exit.lock().expect("callback lock poisoned").clone();
            if let Some(callback) = callback {
                callback(code, expected);
            }
        });

        Ok(())
    }

    /// Ask the process to exit. Returns once the signal is delivered; the
    /// forced kill, if needed, happens on a detached grace task.
    pub async fn terminate(&self) {
        let pid = { *self.inner.pid.lock().expect("pid lock poisoned") };
        let Some(pid) = pid else {
            return;
        };

        #[cfg(unix)]
        {
            log::info!("[Supervisor] sending SIGTERM to pid {pid}");
            // SAFETY: plain kill(2) with a pid we spawned and still track
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let notified = inner.exited.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if *inner.pid.lock().expect("pid lock poisoned") != Some(pid) {
                    return;
                }
                tokio::select! {
                    () = &mut notified => {}
                    () = tokio::time::sleep(KILL_GRACE) => {
                        if *inner.pid.lock().expect("pid lock poisoned") == Some(pid) {
                            log::warn!("[Supervisor] pid {pid} ignored SIGTERM, killing");
                            // SAFETY: same pid, still tracked as ours
                            unsafe {
                                libc::kill(pid as i32, libc::SIGKILL);
                            }
                        }
                    }
                }
            });
        }

        #[cfg(not(unix))]
        {
            // No graceful signal delivery path on Windows-class systems
            log::info!("[Supervisor] killing pid {pid}");
            let _ = std::process::Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .output();
        }
    }

    /// Wait until the monitored process has exited, bounded by `timeout`.
    /// Returns true when the process is gone.
    pub async fn wait_exited(&self, timeout: Duration) -> bool {
        let notified = self.inner.exited.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_running() {
            return true;
        }
        tokio::time::timeout(timeout, notified).await.is_ok()
    }
}

/// Resolve an executable spec: absolute path, path relative to the working
/// directory, or a bare name searched on `PATH`.
pub fn resolve_executable(spec: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(spec)
        .map_err(|e| anyhow::anyhow!("expanding '{spec}': {e}"))?
        .into_owned();
    let candidate = PathBuf::from(&expanded);

    if candidate.is_absolute() || expanded.contains(std::path::MAIN_SEPARATOR) {
        if candidate.is_file() {
            return Ok(candidate);
        }
        bail!("emulator executable not found: {}", candidate.display());
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let cand = dir.join(&expanded);
        if cand.is_file() {
            return Ok(cand);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{expanded}.exe"));
            if exe.is_file() {
                return Ok(exe);
            }
        }
    }
    bail!("emulator executable '{spec}' not found on PATH")
}

/// Read back the advertised bridge port, for diagnostics.
pub fn read_port_file(path: &Path) -> Result<u16> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    content
        .trim()
        .parse()
        .with_context(|| format!("parsing port from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_absolute_path() {
        let dir = tempdir().unwrap();
        let exe = dir.path().join("emu");
        std::fs::write(&exe, b"#!/bin/sh\n").unwrap();
        let resolved = resolve_executable(exe.to_str().unwrap()).unwrap();
        assert_eq!(resolved, exe);
    }

    #[test]
    fn test_resolve_missing_absolute_path_fails() {
        assert!(resolve_executable("/nonexistent/emulator-binary").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_bare_name_on_path() {
        // `sh` exists on every unix PATH
        let resolved = resolve_executable("sh").unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.is_file());
    }

    #[test]
    fn test_resolve_unknown_bare_name_fails() {
        assert!(resolve_executable("definitely-not-an-emulator-xyz").is_err());
    }

    #[test]
    fn test_port_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("port.txt");
        std::fs::write(&path, "45123\n").unwrap();
        assert_eq!(read_port_file(&path).unwrap(), 45123);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_writes_port_file_and_tracks_pid() {
        let dir = tempdir().unwrap();
        let port_file = dir.path().join("port.txt");
        let sup = ProcessSupervisor::new("sleep", dir.path().to_path_buf(), port_file.clone())
            .with_args(["30"]);

        sup.launch(41999).unwrap();
        assert!(sup.is_running());
        assert_eq!(read_port_file(&port_file).unwrap(), 41999);
        assert!(!sup.restart_mode());

        sup.set_restart_mode(true);
        sup.terminate().await;
        assert!(sup.wait_exited(Duration::from_secs(5)).await);
        assert!(!sup.is_running());
    }
}
