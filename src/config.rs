use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

// ---------------------------------------------------------------------------
// Environment contract
// ---------------------------------------------------------------------------

/// Base-directory override, used by tests to relocate `~/.bdg`.
pub const ENV_HOME: &str = "BDG_HOME";

/// Chrome executable override.
pub const ENV_CHROME: &str = "BDG_CHROME";

/// Set in spawned worker processes to prevent launch loops.
pub const ENV_WORKER_PROCESS: &str = "BDG_WORKER_PROCESS";

// ---------------------------------------------------------------------------
// Limits and timings
// ---------------------------------------------------------------------------

/// Network buffer bound; additions past it are dropped with one warning.
pub const MAX_NETWORK_REQUESTS: usize = 10_000;

/// Console buffer bound.
pub const MAX_CONSOLE_MESSAGES: usize = 10_000;

/// Per-resource response body cap in bytes.
pub const MAX_RESPONSE_BODY_BYTES: usize = 65_536;

/// Preview snapshot flush cadence.
pub const PREVIEW_INTERVAL: Duration = Duration::from_secs(5);

/// Items of each kind retained in the preview snapshot.
pub const PREVIEW_LAST_N: usize = 1000;

/// Default item count for `worker_peek` when the caller gives no `lastN`.
pub const PEEK_DEFAULT_LAST_N: usize = 50;

/// Cadence of the in-flight network request sweeper.
pub const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Age past which an in-flight request that never terminated is evicted.
pub const STALE_REQUEST_AGE: Duration = Duration::from_secs(60);

/// Overall page-readiness deadline.
pub const READINESS_DEADLINE: Duration = Duration::from_secs(30);

/// Client→daemon timeout for ordinary queries.
pub const DAEMON_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Client→daemon timeout for `start_session`.
pub const START_SESSION_TIMEOUT: Duration = Duration::from_secs(40);

/// Daemon→worker forward timeout.
pub const WORKER_FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for each DOM snapshot sub-call.
pub const DOM_SUBCALL_TIMEOUT: Duration = Duration::from_secs(5);

/// TTL of the `last-query.json` DOM query cache.
pub const LAST_QUERY_TTL: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Argument parsing helpers
// ---------------------------------------------------------------------------

/// Parse a positive integer within `[min, max]`.
///
/// # Errors
///
/// Returns `AppError::invalid_arguments` when the value does not parse or
/// falls outside the bounds.
pub fn parse_positive_int(value: &str, min: u64, max: u64) -> Result<u64, AppError> {
    let parsed: u64 = value
        .trim()
        .parse()
        .map_err(|_| AppError::invalid_arguments(format!("not a positive integer: {value}")))?;
    if parsed < min || parsed > max {
        return Err(AppError::invalid_arguments(format!(
            "value {parsed} out of range [{min}, {max}]"
        )));
    }
    Ok(parsed)
}

// ---------------------------------------------------------------------------
// Config file (parsed from TOML)
// ---------------------------------------------------------------------------

/// Parsed `<home>/.bdg/config.toml`. All fields optional; CLI flags and
/// environment variables take precedence.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigFile {
    pub session: SessionConfig,
    pub chrome: ChromeConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub headless: Option<bool>,
    pub telemetry: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChromeConfig {
    pub executable: Option<String>,
}

/// Errors reading or parsing the config file.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config file error: {e}"),
            Self::Parse(e) => write!(f, "invalid config file: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load the config file from `<root>/config.toml`.
///
/// A missing file yields defaults; a malformed file is an error so typos
/// are not silently ignored.
///
/// # Errors
///
/// Returns `ConfigError::Parse` for malformed TOML, `ConfigError::Io` for
/// other I/O failures.
pub fn load_config(root: &Path) -> Result<ConfigFile, ConfigError> {
    let path = root.join("config.toml");
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::Io(e)),
    }
}

/// Resolve the Chrome executable override: `BDG_CHROME` first, then the
/// config file. `None` means fall back to well-known platform paths.
#[must_use]
pub fn chrome_override(config: &ConfigFile) -> Option<PathBuf> {
    if let Ok(path) = std::env::var(ENV_CHROME) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    config.chrome.executable.clone().map(PathBuf::from)
}
