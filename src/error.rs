use std::fmt;

use serde::{Deserialize, Serialize};

/// Process exit codes.
///
/// 80–99 are user errors, 100–119 are software errors. The subset
/// {`ChromeLaunch`, `CdpConnection`, `CdpTimeout`} is retryable.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    InvalidUrl = 80,
    InvalidArguments = 81,
    PermissionDenied = 82,
    NotFound = 83,
    AlreadyExists = 84,
    ResourceBusy = 85,
    DaemonAlreadyRunning = 86,
    ChromeLaunch = 100,
    CdpConnection = 101,
    CdpTimeout = 102,
    SessionFile = 103,
    UnhandledException = 104,
    SignalHandler = 105,
}

impl ExitCode {
    /// Whether a failure with this code is worth retrying.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::ChromeLaunch | Self::CdpConnection | Self::CdpTimeout
        )
    }

    /// Whether this code is a user error (80–99).
    #[must_use]
    pub fn is_user_error(self) -> bool {
        (80..100).contains(&(self as u8))
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::GeneralError => "general error",
            Self::InvalidUrl => "invalid URL",
            Self::InvalidArguments => "invalid arguments",
            Self::PermissionDenied => "permission denied",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::ResourceBusy => "resource busy",
            Self::DaemonAlreadyRunning => "daemon already running",
            Self::ChromeLaunch => "Chrome launch failure",
            Self::CdpConnection => "CDP connection failure",
            Self::CdpTimeout => "CDP timeout",
            Self::SessionFile => "session file error",
            Self::UnhandledException => "unhandled exception",
            Self::SignalHandler => "signal handler error",
        };
        write!(f, "{name}")
    }
}

/// Error codes carried in RPC `errorCode` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    SessionAlreadyRunning,
    NoSession,
    SessionKillFailed,
    DaemonAlreadyRunning,
    DaemonNotRunning,
    DaemonError,
    WorkerStartFailed,
    IPCConnection,
    IPCTimeout,
    IPCParse,
    IPCEarlyClose,
    CDPConnection,
    CDPTimeout,
    CDPProtocol,
    InvalidURL,
    InvalidArguments,
    ChromeLaunch,
    ChromeBinaryNotExecutable,
}

impl ErrorCode {
    /// Map an RPC error code to the process exit code the CLI should use.
    #[must_use]
    pub fn exit_code(self) -> ExitCode {
        match self {
            Self::SessionAlreadyRunning => ExitCode::AlreadyExists,
            Self::NoSession | Self::DaemonNotRunning => ExitCode::NotFound,
            Self::SessionKillFailed | Self::DaemonError | Self::WorkerStartFailed => {
                ExitCode::GeneralError
            }
            Self::DaemonAlreadyRunning => ExitCode::DaemonAlreadyRunning,
            Self::IPCConnection | Self::IPCParse | Self::IPCEarlyClose => ExitCode::CdpConnection,
            Self::IPCTimeout | Self::CDPTimeout => ExitCode::CdpTimeout,
            Self::CDPConnection | Self::CDPProtocol => ExitCode::CdpConnection,
            Self::InvalidURL => ExitCode::InvalidUrl,
            Self::InvalidArguments => ExitCode::InvalidArguments,
            Self::ChromeLaunch | Self::ChromeBinaryNotExecutable => ExitCode::ChromeLaunch,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Wire spelling matches the variant name.
        write!(f, "{self:?}")
    }
}

/// Top-level application error: a message plus the exit code to use.
#[derive(Debug)]
pub struct AppError {
    pub message: String,
    pub code: ExitCode,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl AppError {
    #[must_use]
    pub fn new(message: impl Into<String>, code: ExitCode) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    #[must_use]
    pub fn invalid_url(url: &str, reason: &str) -> Self {
        Self::new(format!("invalid URL {url}: {reason}"), ExitCode::InvalidUrl)
    }

    #[must_use]
    pub fn invalid_arguments(msg: impl Into<String>) -> Self {
        Self::new(msg, ExitCode::InvalidArguments)
    }

    #[must_use]
    pub fn daemon_not_running(stale_pid_cleaned: bool) -> Self {
        let message = if stale_pid_cleaned {
            "daemon is not running (stale pid file cleaned up; retry should succeed)".to_string()
        } else {
            "daemon is not running".to_string()
        };
        Self::new(message, ExitCode::NotFound)
    }

    #[must_use]
    pub fn no_session() -> Self {
        Self::new("no active session", ExitCode::NotFound)
    }

    /// Build from an RPC error response.
    #[must_use]
    pub fn from_rpc(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(message, code.exit_code())
    }

    pub fn to_json(&self) -> String {
        let output = ErrorOutput {
            error: &self.message,
            code: self.code as u8,
        };
        serde_json::to_string(&output).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","code":{}}}"#,
                self.message, self.code as u8
            )
        })
    }

    pub fn print_json_stderr(&self) {
        eprintln!("{}", self.to_json());
    }
}

#[derive(Serialize)]
struct ErrorOutput<'a> {
    error: &'a str,
    code: u8,
}
