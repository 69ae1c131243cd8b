use std::fmt;

/// Errors that can occur during Chrome resolution, launch and teardown.
#[derive(Debug)]
pub enum ChromeError {
    /// Chrome executable was not found on the system.
    NotFound(String),

    /// The resolved Chrome path exists but is not an executable file.
    NotExecutable(String),

    /// Chrome process failed to launch.
    LaunchFailed(String),

    /// Chrome did not start accepting connections within the timeout.
    StartupTimeout {
        /// The port Chrome was expected to listen on.
        port: u16,
    },

    /// HTTP request to Chrome's debug endpoint failed.
    HttpError(String),

    /// Failed to parse a response from Chrome.
    ParseError(String),

    /// An I/O error occurred.
    Io(std::io::Error),
}

impl fmt::Display for ChromeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "Chrome not found: {msg}"),
            Self::NotExecutable(path) => {
                write!(f, "Chrome binary is not executable: {path}")
            }
            Self::LaunchFailed(msg) => write!(f, "Chrome launch failed: {msg}"),
            Self::StartupTimeout { port } => {
                write!(f, "Chrome startup timed out on port {port}")
            }
            Self::HttpError(msg) => write!(f, "Chrome HTTP error: {msg}"),
            Self::ParseError(msg) => write!(f, "Chrome parse error: {msg}"),
            Self::Io(e) => write!(f, "Chrome I/O error: {e}"),
        }
    }
}

impl std::error::Error for ChromeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChromeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ChromeError> for crate::error::AppError {
    fn from(e: ChromeError) -> Self {
        use crate::error::ExitCode;
        let code = match &e {
            ChromeError::NotFound(_)
            | ChromeError::NotExecutable(_)
            | ChromeError::LaunchFailed(_)
            | ChromeError::Io(_) => ExitCode::ChromeLaunch,
            ChromeError::StartupTimeout { .. } => ExitCode::CdpTimeout,
            ChromeError::HttpError(_) | ChromeError::ParseError(_) => ExitCode::CdpConnection,
        };
        Self::new(e.to_string(), code)
    }
}

impl ChromeError {
    /// The RPC error code this failure maps to.
    #[must_use]
    pub fn rpc_code(&self) -> crate::error::ErrorCode {
        use crate::error::ErrorCode;
        match self {
            Self::NotExecutable(_) => ErrorCode::ChromeBinaryNotExecutable,
            Self::NotFound(_) | Self::LaunchFailed(_) | Self::Io(_) => ErrorCode::ChromeLaunch,
            Self::StartupTimeout { .. } => ErrorCode::CDPTimeout,
            Self::HttpError(_) | Self::ParseError(_) => ErrorCode::CDPConnection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, ExitCode};

    #[test]
    fn display_messages() {
        assert_eq!(
            ChromeError::NotFound("set BDG_CHROME".into()).to_string(),
            "Chrome not found: set BDG_CHROME"
        );
        assert_eq!(
            ChromeError::NotExecutable("/tmp/x".into()).to_string(),
            "Chrome binary is not executable: /tmp/x"
        );
        assert_eq!(
            ChromeError::StartupTimeout { port: 9222 }.to_string(),
            "Chrome startup timed out on port 9222"
        );
    }

    #[test]
    fn exit_code_mapping() {
        let app: crate::error::AppError = ChromeError::LaunchFailed("denied".into()).into();
        assert_eq!(app.code, ExitCode::ChromeLaunch);
        let app: crate::error::AppError = ChromeError::StartupTimeout { port: 1 }.into();
        assert_eq!(app.code, ExitCode::CdpTimeout);
        let app: crate::error::AppError = ChromeError::HttpError("refused".into()).into();
        assert_eq!(app.code, ExitCode::CdpConnection);
    }

    #[test]
    fn rpc_code_mapping() {
        assert_eq!(
            ChromeError::NotExecutable("/x".into()).rpc_code(),
            ErrorCode::ChromeBinaryNotExecutable
        );
        assert_eq!(
            ChromeError::LaunchFailed("x".into()).rpc_code(),
            ErrorCode::ChromeLaunch
        );
    }
}
