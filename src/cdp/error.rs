use std::fmt;

/// Errors that can occur during CDP communication.
#[derive(Debug)]
pub enum CdpError {
    /// WebSocket connection could not be established.
    Connection(String),

    /// Connection attempt exceeded the configured timeout.
    ConnectionTimeout,

    /// A `send` was issued while the connection is not open.
    NotOpen,

    /// A command did not receive a response within the configured timeout.
    CommandTimeout {
        /// The CDP method that timed out.
        method: String,
    },

    /// Chrome returned a CDP protocol-level error.
    Protocol {
        /// The CDP error code (e.g., -32000).
        code: i64,
        /// The CDP error message.
        message: String,
    },

    /// The WebSocket closed before the response arrived.
    Closed,

    /// Failed to interpret a message received from Chrome.
    InvalidResponse(String),

    /// Reconnection failed after all retry attempts were exhausted.
    ReconnectFailed {
        /// Number of reconnection attempts made.
        attempts: u32,
        /// The error from the last reconnection attempt.
        last_error: String,
    },

    /// Internal error (transport task died or channel closed).
    Internal(String),
}

impl fmt::Display for CdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "CDP connection error: {msg}"),
            Self::ConnectionTimeout => write!(f, "CDP connection timed out"),
            Self::NotOpen => write!(f, "CDP connection is not open"),
            Self::CommandTimeout { method } => {
                write!(f, "CDP command timed out: {method}")
            }
            Self::Protocol { code, message } => {
                write!(f, "CDP protocol error ({code}): {message}")
            }
            Self::Closed => write!(f, "CDP connection closed"),
            Self::InvalidResponse(msg) => write!(f, "CDP invalid response: {msg}"),
            Self::ReconnectFailed {
                attempts,
                last_error,
            } => {
                write!(
                    f,
                    "CDP reconnection failed after {attempts} attempts: {last_error}"
                )
            }
            Self::Internal(msg) => write!(f, "CDP internal error: {msg}"),
        }
    }
}

impl std::error::Error for CdpError {}

impl From<CdpError> for crate::error::AppError {
    fn from(e: CdpError) -> Self {
        use crate::error::ExitCode;
        let code = match &e {
            CdpError::Connection(_)
            | CdpError::Closed
            | CdpError::Protocol { .. }
            | CdpError::ReconnectFailed { .. } => ExitCode::CdpConnection,
            CdpError::ConnectionTimeout | CdpError::CommandTimeout { .. } => ExitCode::CdpTimeout,
            CdpError::NotOpen => ExitCode::InvalidArguments,
            CdpError::InvalidResponse(_) | CdpError::Internal(_) => ExitCode::GeneralError,
        };
        Self::new(e.to_string(), code)
    }
}

impl CdpError {
    /// The RPC error code this transport error maps to.
    #[must_use]
    pub fn rpc_code(&self) -> crate::error::ErrorCode {
        use crate::error::ErrorCode;
        match self {
            Self::Connection(_) | Self::Closed | Self::ReconnectFailed { .. } | Self::NotOpen => {
                ErrorCode::CDPConnection
            }
            Self::ConnectionTimeout | Self::CommandTimeout { .. } => ErrorCode::CDPTimeout,
            Self::Protocol { .. } => ErrorCode::CDPProtocol,
            Self::InvalidResponse(_) | Self::Internal(_) => ErrorCode::CDPConnection,
        }
    }
}
