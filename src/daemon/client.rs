use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::UnixStream;

use crate::error::{AppError, ErrorCode};
use crate::paths::{BdgPaths, pid_alive, read_pid, remove_file};
use crate::rpc::{CLIENT_ID_FIELD, make_request, read_frame, write_frame};

/// How long to wait for a freshly spawned daemon to start answering.
const DAEMON_SPAWN_WAIT: Duration = Duration::from_secs(5);

/// Probe timeout for handshakes.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// CLI-side client for the daemon socket. One request, one response, one
/// connection.
pub struct DaemonClient {
    paths: BdgPaths,
}

impl DaemonClient {
    #[must_use]
    pub fn new(paths: BdgPaths) -> Self {
        Self { paths }
    }

    /// Send one request and await its response.
    ///
    /// # Errors
    ///
    /// Returns `AppError::daemon_not_running` when the socket is dead
    /// (cleaning a stale `daemon.pid` on the way), a mapped RPC error when
    /// the daemon answers `status: "error"`, or a transport error.
    pub async fn request(
        &self,
        msg_type: &str,
        extra: Value,
        timeout: Duration,
    ) -> Result<Value, AppError> {
        let stream = match UnixStream::connect(self.paths.daemon_sock()).await {
            Ok(stream) => stream,
            Err(_) => return Err(self.not_running_error()),
        };
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let session_id = uuid::Uuid::new_v4().to_string();
        let request = make_request(msg_type, CLIENT_ID_FIELD, &session_id, extra);
        write_frame(&mut write_half, &request).await?;

        let response = read_frame(&mut reader, timeout, msg_type).await?;
        if response[CLIENT_ID_FIELD].as_str() != Some(session_id.as_str()) {
            tracing::warn!("daemon response carries a foreign correlation id");
        }

        if response["status"] == "error" {
            let code = response
                .get("errorCode")
                .cloned()
                .and_then(|v| serde_json::from_value::<ErrorCode>(v).ok())
                .unwrap_or(ErrorCode::DaemonError);
            let message = response["message"]
                .as_str()
                .unwrap_or("daemon reported an error")
                .to_string();
            return Err(AppError::from_rpc(code, message));
        }
        Ok(response)
    }

    /// Whether a daemon currently answers handshakes.
    pub async fn is_running(&self) -> bool {
        self.request("handshake_request", Value::Null, HANDSHAKE_TIMEOUT)
            .await
            .is_ok()
    }

    /// Make sure a daemon is running, spawning a detached one when needed.
    ///
    /// # Errors
    ///
    /// Returns `AppError` when the daemon cannot be spawned or does not
    /// start answering within the wait window.
    pub async fn ensure_running(&self) -> Result<(), AppError> {
        if self.is_running().await {
            return Ok(());
        }

        let exe = std::env::current_exe().map_err(|e| {
            AppError::new(
                format!("cannot resolve executable: {e}"),
                crate::error::ExitCode::GeneralError,
            )
        })?;
        std::process::Command::new(exe)
            .args(["daemon", "--foreground"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                AppError::new(
                    format!("cannot spawn daemon: {e}"),
                    crate::error::ExitCode::GeneralError,
                )
            })?;

        let deadline = tokio::time::Instant::now() + DAEMON_SPAWN_WAIT;
        while tokio::time::Instant::now() < deadline {
            if self.is_running().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(AppError::new(
            "daemon did not start answering in time",
            crate::error::ExitCode::GeneralError,
        ))
    }

    /// The not-running error, cleaning up a stale `daemon.pid` so the
    /// caller knows whether a retry is likely to succeed.
    fn not_running_error(&self) -> AppError {
        let pid_path = self.paths.daemon_pid();
        let stale_cleaned = match read_pid(&pid_path) {
            Some(pid) if !pid_alive(pid) => {
                let _ = remove_file(&pid_path);
                true
            }
            _ => false,
        };
        AppError::daemon_not_running(stale_cleaned)
    }
}
