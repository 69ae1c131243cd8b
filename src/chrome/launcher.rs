use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use super::ChromeError;
use super::endpoint::DebugEndpoint;

/// How long the graceful-terminate phase polls before escalating.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Poll interval while waiting for Chrome to exit.
const TERMINATE_POLL: Duration = Duration::from_millis(500);

/// Poll cadence while waiting for the debug endpoint to come up.
const STARTUP_PROBE_EVERY: Duration = Duration::from_millis(100);

/// Everything needed to start a Chrome this tool will own.
pub struct ChromeLauncher {
    pub executable: PathBuf,
    pub port: u16,
    pub headless: bool,
    pub extra_args: Vec<String>,
    /// Profile directory. When absent a scratch profile is created and
    /// removed with the handle.
    pub profile_dir: Option<PathBuf>,
}

impl ChromeLauncher {
    /// Spawn Chrome and wait until its debug endpoint answers.
    ///
    /// # Errors
    ///
    /// Returns `ChromeError::LaunchFailed` when the process cannot start or
    /// dies before listening, `ChromeError::StartupTimeout` when the
    /// endpoint never comes up within `startup_budget`.
    pub async fn launch(self, startup_budget: Duration) -> Result<ChromeHandle, ChromeError> {
        let (profile, scratch) = self.resolve_profile()?;

        let mut command = std::process::Command::new(&self.executable);
        command
            .args(self.command_line(&profile))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = command.spawn().map_err(|e| {
            ChromeError::LaunchFailed(format!("spawning {} failed: {e}", self.executable.display()))
        })?;

        let mut handle = ChromeHandle {
            child: Some(child),
            port: self.port,
            scratch,
        };
        handle.await_endpoint(startup_budget).await?;
        Ok(handle)
    }

    /// The argument vector Chrome is started with.
    fn command_line(&self, profile: &Path) -> Vec<String> {
        let mut args = vec![
            format!("--remote-debugging-port={}", self.port),
            format!("--user-data-dir={}", profile.display()),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
        ];
        if self.headless {
            args.push("--headless=new".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// The profile directory to use, creating a scratch one when none was
    /// configured.
    fn resolve_profile(&self) -> Result<(PathBuf, Option<ScratchProfile>), ChromeError> {
        if let Some(dir) = &self.profile_dir {
            return Ok((dir.clone(), None));
        }
        let dir = std::env::temp_dir().join(format!(
            "bdg-profile-{}",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&dir)?;
        Ok((dir.clone(), Some(ScratchProfile { dir })))
    }
}

/// A throwaway profile directory, removed when the handle goes away.
struct ScratchProfile {
    dir: PathBuf,
}

impl Drop for ScratchProfile {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// A Chrome process this tool launched and still owns.
///
/// Dropping the handle kills the process; `detach` relinquishes ownership,
/// `shutdown` terminates it gracefully.
pub struct ChromeHandle {
    child: Option<std::process::Child>,
    port: u16,
    scratch: Option<ScratchProfile>,
}

impl ChromeHandle {
    /// The Chrome PID (0 once detached).
    #[must_use]
    pub fn pid(&self) -> u32 {
        match &self.child {
            Some(child) => child.id(),
            None => 0,
        }
    }

    /// The remote debugging port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Block startup until `/json/version` answers, watching for an early
    /// child exit so a bad flag set fails fast instead of eating the whole
    /// budget.
    async fn await_endpoint(&mut self, budget: Duration) -> Result<(), ChromeError> {
        let endpoint = DebugEndpoint::localhost(self.port);
        let give_up = tokio::time::Instant::now() + budget;
        let mut probe = tokio::time::interval(STARTUP_PROBE_EVERY);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            probe.tick().await;

            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    self.child = None;
                    return Err(ChromeError::LaunchFailed(format!(
                        "Chrome exited with {status} before its endpoint came up"
                    )));
                }
            }

            if endpoint.version().await.is_ok() {
                return Ok(());
            }

            if tokio::time::Instant::now() >= give_up {
                self.kill();
                return Err(ChromeError::StartupTimeout { port: self.port });
            }
        }
    }

    /// Kill the process immediately and reap it.
    pub fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Give up ownership: the process keeps running and the profile
    /// directory is kept. Returns `(pid, port)` for the caller's records.
    #[must_use]
    pub fn detach(mut self) -> (u32, u16) {
        let pid = self.pid();
        self.child = None;
        if let Some(scratch) = self.scratch.take() {
            // Chrome still needs the profile; leak the guard.
            std::mem::forget(scratch);
        }
        (pid, self.port)
    }

    /// Gracefully terminate an owned Chrome: SIGTERM the process group,
    /// poll for exit within the grace period, escalate to SIGKILL and wait
    /// briefly. Returns `true` when the process exited.
    ///
    /// Liveness is checked through `try_wait` because this handle is the
    /// parent: a signalled child stays a zombie until reaped, which a
    /// `kill(pid, 0)` probe would misread as alive.
    pub async fn shutdown(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return true;
        };
        #[cfg(unix)]
        {
            #[allow(clippy::cast_possible_wrap)]
            let pid_i32 = child.id() as i32;
            // SAFETY: plain kill(2) on our own child's pid/group.
            let term_result = unsafe { libc::kill(-pid_i32, libc::SIGTERM) };
            if term_result != 0 {
                unsafe { libc::kill(pid_i32, libc::SIGTERM) };
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.kill();
        }

        let start = tokio::time::Instant::now();
        while start.elapsed() < TERMINATE_GRACE {
            if matches!(child.try_wait(), Ok(Some(_))) {
                self.child = None;
                return true;
            }
            tokio::time::sleep(TERMINATE_POLL).await;
        }

        let _ = child.kill();
        tokio::time::sleep(TERMINATE_POLL).await;
        if matches!(child.try_wait(), Ok(Some(_))) {
            self.child = None;
            true
        } else {
            tracing::warn!("Chrome pid {} survived SIGKILL", child.id());
            false
        }
    }
}

impl Drop for ChromeHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Ask the kernel for a currently-free loopback port. The listener is
/// dropped before Chrome binds, so a collision is possible but rare.
///
/// # Errors
///
/// Returns `ChromeError::LaunchFailed` when no ephemeral port can be
/// reserved.
pub fn pick_ephemeral_port() -> Result<u16, ChromeError> {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .and_then(|probe| probe.local_addr())
        .map(|addr| addr.port())
        .map_err(|e| ChromeError::LaunchFailed(format!("no ephemeral port available: {e}")))
}

/// Terminate a detached Chrome by PID: SIGTERM to the process group, poll
/// liveness for the grace period, escalate to SIGKILL, wait briefly, and
/// report whether the process is gone.
///
/// Returns `true` when the process exited, `false` when it survived even
/// the kill (callers log and move on).
pub async fn terminate_process(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // PID values are within i32 range on all supported platforms.
        #[allow(clippy::cast_possible_wrap)]
        let pid_i32 = pid as i32;

        // Negative PID targets the process group, reaping Chrome's renderer
        // and utility children too. Fall back to the single process when
        // Chrome is not a group leader.
        // SAFETY: plain kill(2) calls on a caller-supplied pid.
        let term_result = unsafe { libc::kill(-pid_i32, libc::SIGTERM) };
        if term_result != 0 {
            unsafe { libc::kill(pid_i32, libc::SIGTERM) };
        }

        let start = tokio::time::Instant::now();
        while start.elapsed() < TERMINATE_GRACE {
            if !crate::paths::pid_alive(pid) {
                return true;
            }
            tokio::time::sleep(TERMINATE_POLL).await;
        }

        // SAFETY: as above.
        let kill_result = unsafe { libc::kill(-pid_i32, libc::SIGKILL) };
        if kill_result != 0 {
            unsafe { libc::kill(pid_i32, libc::SIGKILL) };
        }

        tokio::time::sleep(TERMINATE_POLL).await;
        if crate::paths::pid_alive(pid) {
            tracing::warn!("Chrome pid {pid} survived SIGKILL");
            return false;
        }
        true
    }
    #[cfg(not(unix))]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .output();
        true
    }
}
