use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::ENV_HOME;
use crate::error::{AppError, ExitCode};

/// Errors from session-file and lock operations.
#[derive(Debug)]
pub enum SessionFileError {
    /// Could not determine home directory.
    NoHomeDir,
    /// I/O error on a session file.
    Io(std::io::Error),
    /// A session file contains invalid JSON.
    InvalidFormat(String),
    /// The lock is held by a live process.
    LockHeld { pid: u32 },
}

impl fmt::Display for SessionFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHomeDir => write!(f, "could not determine home directory"),
            Self::Io(e) => write!(f, "session file error: {e}"),
            Self::InvalidFormat(e) => write!(f, "invalid session file: {e}"),
            Self::LockHeld { pid } => write!(f, "lock held by pid {pid}"),
        }
    }
}

impl std::error::Error for SessionFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SessionFileError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<SessionFileError> for AppError {
    fn from(e: SessionFileError) -> Self {
        let code = match &e {
            SessionFileError::LockHeld { .. } => ExitCode::ResourceBusy,
            _ => ExitCode::SessionFile,
        };
        Self::new(e.to_string(), code)
    }
}

/// Canonical on-disk layout under `<home>/.bdg/` (or `$BDG_HOME`).
#[derive(Debug, Clone)]
pub struct BdgPaths {
    root: PathBuf,
}

impl BdgPaths {
    /// Resolve the base directory: `$BDG_HOME` if set, else `<home>/.bdg`.
    ///
    /// # Errors
    ///
    /// Returns `SessionFileError::NoHomeDir` if neither can be determined.
    pub fn resolve() -> Result<Self, SessionFileError> {
        if let Ok(root) = std::env::var(ENV_HOME) {
            if !root.is_empty() {
                return Ok(Self {
                    root: PathBuf::from(root),
                });
            }
        }
        let home = dirs::home_dir().ok_or(SessionFileError::NoHomeDir)?;
        Ok(Self {
            root: home.join(".bdg"),
        })
    }

    /// Build a registry rooted at an explicit directory (tests).
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the base directory with `0700` permissions.
    ///
    /// # Errors
    ///
    /// Returns `SessionFileError::Io` on failure.
    pub fn ensure_root(&self) -> Result<(), SessionFileError> {
        std::fs::create_dir_all(&self.root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.root, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn session_pid(&self) -> PathBuf {
        self.root.join("session.pid")
    }

    #[must_use]
    pub fn session_meta(&self) -> PathBuf {
        self.root.join("session.meta.json")
    }

    #[must_use]
    pub fn session_preview(&self) -> PathBuf {
        self.root.join("session.preview.json")
    }

    #[must_use]
    pub fn session_full(&self) -> PathBuf {
        self.root.join("session.full.json")
    }

    #[must_use]
    pub fn session_final(&self) -> PathBuf {
        self.root.join("session.json")
    }

    #[must_use]
    pub fn session_lock(&self) -> PathBuf {
        self.root.join("session.lock")
    }

    #[must_use]
    pub fn daemon_pid(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    #[must_use]
    pub fn daemon_lock(&self) -> PathBuf {
        self.root.join("daemon.lock")
    }

    #[must_use]
    pub fn daemon_sock(&self) -> PathBuf {
        self.root.join("daemon.sock")
    }

    #[must_use]
    pub fn chrome_pid(&self) -> PathBuf {
        self.root.join("chrome.pid")
    }

    #[must_use]
    pub fn last_query(&self) -> PathBuf {
        self.root.join("last-query.json")
    }

    #[must_use]
    pub fn worker_sock(&self, pid: u32) -> PathBuf {
        self.root.join(format!("worker.{pid}.sock"))
    }
}

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

/// Write `payload` to `target` atomically: full write to
/// `<target>.<pid>.<uuid>.tmp`, then rename. The tmp file is removed on any
/// failure. Concurrent writers to the same target never corrupt it; the
/// last rename wins.
///
/// # Errors
///
/// Returns `SessionFileError::Io` on write or rename failure.
pub fn atomic_write(target: &Path, payload: &[u8]) -> Result<(), SessionFileError> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = target.with_file_name(format!(
        "{}.{}.{}.tmp",
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        std::process::id(),
        uuid::Uuid::new_v4()
    ));

    let write_result = (|| -> Result<(), SessionFileError> {
        std::fs::write(&tmp, payload)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, target)?;
        Ok(())
    })();

    if write_result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    write_result
}

/// Serialize `value` as pretty JSON and write it atomically.
///
/// # Errors
///
/// Returns `SessionFileError::InvalidFormat` on serialization failure and
/// `SessionFileError::Io` on write failure.
pub fn atomic_write_json<T: Serialize>(target: &Path, value: &T) -> Result<(), SessionFileError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| SessionFileError::InvalidFormat(e.to_string()))?;
    atomic_write(target, json.as_bytes())
}

/// Read and deserialize a JSON file. Returns `Ok(None)` when missing.
///
/// # Errors
///
/// Returns `SessionFileError::InvalidFormat` for malformed JSON, otherwise
/// `SessionFileError::Io`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SessionFileError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let value = serde_json::from_str(&contents)
                .map_err(|e| SessionFileError::InvalidFormat(e.to_string()))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SessionFileError::Io(e)),
    }
}

/// Remove a file, treating "not found" as success.
///
/// # Errors
///
/// Returns `SessionFileError::Io` on other failures.
pub fn remove_file(path: &Path) -> Result<(), SessionFileError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SessionFileError::Io(e)),
    }
}

// ---------------------------------------------------------------------------
// PID files
// ---------------------------------------------------------------------------

/// Write a PID file (atomic, ASCII decimal).
///
/// # Errors
///
/// Returns `SessionFileError::Io` on failure.
pub fn write_pid(path: &Path, pid: u32) -> Result<(), SessionFileError> {
    atomic_write(path, pid.to_string().as_bytes())
}

/// Read a PID file. Returns `None` when the file is missing or does not
/// parse as a PID.
#[must_use]
pub fn read_pid(path: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

/// Check whether a process with the given PID is alive (signal 0 probe).
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // PID values are within i32 range on all supported platforms.
        #[allow(clippy::cast_possible_wrap)]
        let pid_i32 = pid as i32;
        // SAFETY: signal 0 performs an existence check only.
        let result = unsafe { libc::kill(pid_i32, 0) };
        result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

// ---------------------------------------------------------------------------
// Exclusive locks
// ---------------------------------------------------------------------------

/// Acquire an exclusive lock file whose content is this process's PID.
///
/// Creation uses exclusive-create semantics. When the file already exists,
/// the holder PID is read; a dead holder's lock is removed and acquisition
/// retried once.
///
/// # Errors
///
/// Returns `SessionFileError::LockHeld` when a live process holds the lock,
/// `SessionFileError::Io` otherwise.
pub fn acquire_lock(path: &Path) -> Result<(), SessionFileError> {
    acquire_lock_as(path, std::process::id())
}

/// Testable variant of [`acquire_lock`] with an explicit owner PID.
///
/// # Errors
///
/// See [`acquire_lock`].
pub fn acquire_lock_as(path: &Path, owner_pid: u32) -> Result<(), SessionFileError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    for attempt in 0..2 {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                use std::io::Write;
                file.write_all(owner_pid.to_string().as_bytes())?;
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match read_pid(path) {
                    Some(holder) if pid_alive(holder) => {
                        return Err(SessionFileError::LockHeld { pid: holder });
                    }
                    _ => {
                        // Stale or unparseable holder: clear and retry once.
                        tracing::warn!(
                            "removing stale lock {} (holder not alive)",
                            path.display()
                        );
                        remove_file(path)?;
                        if attempt == 1 {
                            return Err(SessionFileError::Io(e));
                        }
                    }
                }
            }
            Err(e) => return Err(SessionFileError::Io(e)),
        }
    }
    unreachable!("lock acquisition loop exits within two attempts")
}

/// Release a lock by removing its file. Missing files are fine.
///
/// # Errors
///
/// Returns `SessionFileError::Io` on removal failure.
pub fn release_lock(path: &Path) -> Result<(), SessionFileError> {
    remove_file(path)
}

/// Read the PID of the current lock holder, if any.
#[must_use]
pub fn lock_holder(path: &Path) -> Option<u32> {
    read_pid(path)
}

// ---------------------------------------------------------------------------
// Chrome PID cache
// ---------------------------------------------------------------------------

/// Record the PID of a Chrome instance this tool launched. Survives session
/// teardown so a later `cleanup` can reap Chrome.
///
/// # Errors
///
/// Returns `SessionFileError::Io` on write failure.
pub fn write_chrome_pid(paths: &BdgPaths, pid: u32) -> Result<(), SessionFileError> {
    write_pid(&paths.chrome_pid(), pid)
}

/// Read the cached Chrome PID. The file is removed automatically when the
/// PID is dead or unparseable, and `None` is returned.
#[must_use]
pub fn read_chrome_pid(paths: &BdgPaths) -> Option<u32> {
    let path = paths.chrome_pid();
    match read_pid(&path) {
        Some(pid) if pid_alive(pid) => Some(pid),
        Some(_) => {
            let _ = remove_file(&path);
            None
        }
        None => {
            if path.exists() {
                let _ = remove_file(&path);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A PID far above any real pid_max, guaranteed dead.
    const DEAD_PID: u32 = 999_999_999;

    fn test_paths() -> (tempfile::TempDir, BdgPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = BdgPaths::at(dir.path());
        (dir, paths)
    }

    #[test]
    fn layout_is_canonical() {
        let paths = BdgPaths::at("/tmp/bdg-test-root");
        assert!(paths.session_meta().ends_with("session.meta.json"));
        assert!(paths.session_preview().ends_with("session.preview.json"));
        assert!(paths.session_final().ends_with("session.json"));
        assert!(paths.daemon_sock().ends_with("daemon.sock"));
        assert!(paths.worker_sock(42).ends_with("worker.42.sock"));
    }

    #[test]
    fn atomic_write_round_trip() {
        let (_dir, paths) = test_paths();
        let target = paths.session_meta();
        atomic_write(&target, b"{\"a\":1}").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn atomic_write_leaves_no_tmp_files() {
        let (dir, paths) = test_paths();
        atomic_write(&paths.session_meta(), b"x").unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn atomic_write_replaces_whole_content() {
        let (_dir, paths) = test_paths();
        let target = paths.session_preview();
        atomic_write(&target, b"first-longer-content").unwrap();
        atomic_write(&target, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "second");
    }

    #[test]
    fn json_round_trip() {
        let (_dir, paths) = test_paths();
        let target = paths.last_query();
        let value = serde_json::json!({"selector": "#app", "count": 3});
        atomic_write_json(&target, &value).unwrap();
        let back: serde_json::Value = read_json(&target).unwrap().unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn read_json_missing_is_none() {
        let (_dir, paths) = test_paths();
        let result: Option<serde_json::Value> = read_json(&paths.session_meta()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn read_json_malformed_is_error() {
        let (_dir, paths) = test_paths();
        std::fs::create_dir_all(paths.root()).unwrap();
        std::fs::write(paths.session_meta(), "not json").unwrap();
        let result: Result<Option<serde_json::Value>, _> = read_json(&paths.session_meta());
        assert!(matches!(result, Err(SessionFileError::InvalidFormat(_))));
    }

    #[test]
    fn pid_round_trip_and_cleanup() {
        let (_dir, paths) = test_paths();
        let path = paths.session_pid();
        write_pid(&path, 4321).unwrap();
        assert_eq!(read_pid(&path), Some(4321));
        remove_file(&path).unwrap();
        assert_eq!(read_pid(&path), None);
    }

    #[test]
    fn remove_missing_is_ok() {
        let (_dir, paths) = test_paths();
        remove_file(&paths.session_pid()).unwrap();
        remove_file(&paths.session_pid()).unwrap();
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn absurd_pid_is_dead() {
        assert!(!pid_alive(DEAD_PID));
    }

    #[test]
    fn lock_is_exclusive() {
        let (_dir, paths) = test_paths();
        let lock = paths.session_lock();
        acquire_lock_as(&lock, std::process::id()).unwrap();
        let second = acquire_lock_as(&lock, std::process::id() + 1);
        // The first holder (this process) is alive, so the second fails.
        assert!(matches!(
            second,
            Err(SessionFileError::LockHeld { pid }) if pid == std::process::id()
        ));
    }

    #[test]
    fn stale_lock_is_recovered() {
        let (_dir, paths) = test_paths();
        let lock = paths.session_lock();
        std::fs::create_dir_all(paths.root()).unwrap();
        std::fs::write(&lock, DEAD_PID.to_string()).unwrap();

        acquire_lock(&lock).unwrap();
        assert_eq!(lock_holder(&lock), Some(std::process::id()));
    }

    #[test]
    fn unparseable_lock_is_recovered() {
        let (_dir, paths) = test_paths();
        let lock = paths.daemon_lock();
        std::fs::create_dir_all(paths.root()).unwrap();
        std::fs::write(&lock, "garbage").unwrap();

        acquire_lock(&lock).unwrap();
        assert_eq!(lock_holder(&lock), Some(std::process::id()));
    }

    #[test]
    fn release_then_reacquire() {
        let (_dir, paths) = test_paths();
        let lock = paths.session_lock();
        acquire_lock(&lock).unwrap();
        release_lock(&lock).unwrap();
        acquire_lock(&lock).unwrap();
    }

    #[test]
    fn chrome_pid_cache_self_cleans_dead_pid() {
        let (_dir, paths) = test_paths();
        write_chrome_pid(&paths, DEAD_PID).unwrap();
        assert!(paths.chrome_pid().exists());
        assert_eq!(read_chrome_pid(&paths), None);
        assert!(!paths.chrome_pid().exists());
    }

    #[test]
    fn chrome_pid_cache_self_cleans_garbage() {
        let (_dir, paths) = test_paths();
        std::fs::create_dir_all(paths.root()).unwrap();
        std::fs::write(paths.chrome_pid(), "not-a-pid").unwrap();
        assert_eq!(read_chrome_pid(&paths), None);
        assert!(!paths.chrome_pid().exists());
    }

    #[test]
    fn chrome_pid_cache_keeps_live_pid() {
        let (_dir, paths) = test_paths();
        write_chrome_pid(&paths, std::process::id()).unwrap();
        assert_eq!(read_chrome_pid(&paths), Some(std::process::id()));
        assert!(paths.chrome_pid().exists());
    }
}
