use std::path::{Path, PathBuf};

use super::ChromeError;

/// Find a Chrome executable.
///
/// The explicit override (from `BDG_CHROME` or the config file) wins; well-known
/// per-platform install paths are tried otherwise. An override that exists but
/// is not an executable file is reported as such rather than silently skipped.
///
/// # Errors
///
/// Returns `ChromeError::NotExecutable` for a bad override path and
/// `ChromeError::NotFound` when no candidate exists.
pub fn find_chrome_executable(override_path: Option<&Path>) -> Result<PathBuf, ChromeError> {
    if let Some(p) = override_path {
        if !p.exists() {
            return Err(ChromeError::NotFound(format!(
                "override path does not exist: {}",
                p.display()
            )));
        }
        if !is_executable(p) {
            return Err(ChromeError::NotExecutable(p.display().to_string()));
        }
        return Ok(p.to_path_buf());
    }

    for candidate in chrome_candidates() {
        if candidate.exists() && is_executable(&candidate) {
            return Ok(candidate);
        }
    }

    Err(ChromeError::NotFound(
        "no Chrome installation found; set BDG_CHROME or [chrome].executable".into(),
    ))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

#[cfg(target_os = "linux")]
fn chrome_candidates() -> Vec<PathBuf> {
    [
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium-browser",
        "/usr/bin/chromium",
        "/snap/bin/chromium",
        "/opt/google/chrome/chrome",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

#[cfg(target_os = "macos")]
fn chrome_candidates() -> Vec<PathBuf> {
    [
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn chrome_candidates() -> Vec<PathBuf> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_override_is_not_found() {
        let result = find_chrome_executable(Some(Path::new("/nonexistent/bdg-chrome")));
        assert!(matches!(result, Err(ChromeError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_override_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chrome");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        // 0o644: a plain file without the execute bit
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let result = find_chrome_executable(Some(&path));
        assert!(matches!(result, Err(ChromeError::NotExecutable(_))));
    }

    #[cfg(unix)]
    #[test]
    fn executable_override_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chrome");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let result = find_chrome_executable(Some(&path)).unwrap();
        assert_eq!(result, path);
    }
}
