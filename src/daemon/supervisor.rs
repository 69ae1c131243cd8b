use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

use crate::config::{ENV_WORKER_PROCESS, START_SESSION_TIMEOUT};
use crate::error::ErrorCode;
use crate::paths::BdgPaths;
use crate::rpc::{LineBuffer, RpcError, WORKER_ID_FIELD, make_request, write_frame};
use crate::worker::WorkerConfig;

/// Retained tail of the worker's stderr, for crash diagnostics.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// How a worker spawn attempt failed.
#[derive(Debug)]
pub enum SpawnError {
    /// The subprocess could not be started at all.
    SpawnFailed(String),
    /// The worker exited before signalling ready; stderr tail attached.
    Crashed { stderr: String },
    /// No `worker_ready` frame arrived within the startup timeout.
    ReadyTimeout,
    /// The first stdout line was not a valid `worker_ready` frame.
    MalformedReady(String),
}

impl SpawnError {
    #[must_use]
    pub fn rpc_code(&self) -> ErrorCode {
        match self {
            Self::ReadyTimeout => ErrorCode::CDPTimeout,
            _ => ErrorCode::WorkerStartFailed,
        }
    }

    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::SpawnFailed(e) => format!("worker spawn failed: {e}"),
            Self::Crashed { stderr } => {
                format!("worker crashed during startup: {stderr}")
            }
            Self::ReadyTimeout => "worker did not become ready within the startup timeout".into(),
            Self::MalformedReady(line) => format!("worker emitted a malformed ready frame: {line}"),
        }
    }
}

/// A supervised worker: the subprocess (owned by an exit-watcher task), its
/// ready info, the persistent channel to its socket, and the retained
/// stderr tail.
pub struct WorkerSupervisor {
    pub pid: u32,
    pub chrome_pid: u32,
    pub ready: Value,
    pub started: Instant,
    channel_tx: mpsc::Sender<ChannelCommand>,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
    exit_rx: tokio::sync::watch::Receiver<bool>,
}

impl WorkerSupervisor {
    /// Spawn the worker subprocess (`<current_exe> worker <config-json>`),
    /// await its `worker_ready` frame, and open the persistent channel to
    /// its socket.
    ///
    /// # Errors
    ///
    /// Returns the spawn-failure subcase for the daemon to map onto
    /// `WorkerStartFailed` / `CDPTimeout`.
    pub async fn spawn(paths: &BdgPaths, config: &WorkerConfig) -> Result<Self, SpawnError> {
        let exe = std::env::current_exe()
            .map_err(|e| SpawnError::SpawnFailed(format!("cannot resolve executable: {e}")))?;
        let config_json = serde_json::to_string(config)
            .map_err(|e| SpawnError::SpawnFailed(format!("cannot encode config: {e}")))?;

        let mut child = tokio::process::Command::new(exe)
            .arg("worker")
            .arg(config_json)
            .env(ENV_WORKER_PROCESS, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SpawnError::SpawnFailed(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| SpawnError::SpawnFailed("worker exited immediately".into()))?;

        // Collect stderr continuously; crash paths report its tail.
        let stderr = child.stderr.take().expect("stderr was piped");
        let stderr_tail = Arc::new(Mutex::new(Vec::new()));
        spawn_stderr_collector(stderr, Arc::clone(&stderr_tail));

        let stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(stdout).lines();

        // Wait for the ready frame, racing against worker exit and the
        // startup deadline.
        let ready = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => parse_ready_frame(&line)?,
                Ok(None) | Err(_) => {
                    let _ = child.wait().await;
                    return Err(SpawnError::Crashed {
                        stderr: stderr_tail_string(&stderr_tail),
                    });
                }
            },
            status = child.wait() => {
                tracing::warn!("worker exited during startup: {status:?}");
                return Err(SpawnError::Crashed {
                    stderr: stderr_tail_string(&stderr_tail),
                });
            }
            () = tokio::time::sleep(START_SESSION_TIMEOUT) => {
                let _ = child.kill().await;
                return Err(SpawnError::ReadyTimeout);
            }
        };

        // The worker binds its socket before emitting ready; connect now
        // and keep the channel open for the worker's lifetime.
        let sock_path = paths.worker_sock(pid);
        let stream = UnixStream::connect(&sock_path).await.map_err(|e| {
            SpawnError::MalformedReady(format!(
                "worker socket {} not connectable: {e}",
                sock_path.display()
            ))
        })?;
        let channel_tx = spawn_channel_task(stream);

        let chrome_pid = ready["chromePid"]
            .as_u64()
            .and_then(|p| u32::try_from(p).ok())
            .unwrap_or(0);

        // The watcher task owns the child from here: it reaps the process
        // and flips the exit flag the daemon's select loop observes.
        let (exit_tx, exit_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            let mut child = child;
            let status = child.wait().await;
            tracing::info!("worker {pid} exited: {status:?}");
            let _ = exit_tx.send(true);
        });

        Ok(Self {
            pid,
            chrome_pid,
            ready,
            started: Instant::now(),
            channel_tx,
            stderr_tail,
            exit_rx,
        })
    }

    /// A lightweight clonable handle for forwarding commands without
    /// holding the supervisor itself.
    #[must_use]
    pub fn link(&self) -> WorkerLink {
        WorkerLink {
            pid: self.pid,
            channel_tx: self.channel_tx.clone(),
        }
    }

    /// Forward a registered command to the worker and await the correlated
    /// response.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Timeout` on deadline expiry (a late reply is
    /// discarded), `RpcError::EarlyClose` when the worker went away.
    pub async fn forward(
        &self,
        command: &str,
        extra: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.link().forward(command, extra, timeout).await
    }

    /// Session duration so far, in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
    }

    /// The retained stderr tail (crash diagnostics).
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        stderr_tail_string(&self.stderr_tail)
    }

    /// Whether the worker process is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !*self.exit_rx.borrow()
    }

    /// A watch receiver that flips to `true` when the worker exits.
    #[must_use]
    pub fn exit_watch(&self) -> tokio::sync::watch::Receiver<bool> {
        self.exit_rx.clone()
    }

    /// Resolve when the worker process exits.
    pub async fn exited(&self) {
        let mut rx = self.exit_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Ask the worker to shut down gracefully (SIGTERM) and wait for it to
    /// exit, up to `grace`. Escalates to SIGKILL past the deadline.
    pub async fn terminate(&self, grace: Duration) {
        #[cfg(unix)]
        {
            #[allow(clippy::cast_possible_wrap)]
            let pid = self.pid as i32;
            // SAFETY: plain kill(2) on our own child.
            unsafe { libc::kill(pid, libc::SIGTERM) };
        }
        if tokio::time::timeout(grace, self.exited()).await.is_err() {
            tracing::warn!("worker {} ignored SIGTERM, killing", self.pid);
            #[cfg(unix)]
            {
                #[allow(clippy::cast_possible_wrap)]
                let pid = self.pid as i32;
                // SAFETY: as above.
                unsafe { libc::kill(pid, libc::SIGKILL) };
            }
            let _ = tokio::time::timeout(Duration::from_millis(500), self.exited()).await;
        }
    }
}

/// Clonable forwarding handle onto the worker channel.
#[derive(Clone)]
pub struct WorkerLink {
    pub pid: u32,
    channel_tx: mpsc::Sender<ChannelCommand>,
}

impl WorkerLink {
    /// See [`WorkerSupervisor::forward`].
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Timeout` on deadline expiry, `RpcError::EarlyClose`
    /// when the worker went away.
    pub async fn forward(
        &self,
        command: &str,
        extra: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let request_type = format!("{command}_request");
        let request = make_request(&request_type, WORKER_ID_FIELD, &request_id, extra);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.channel_tx
            .send(ChannelCommand::Forward {
                request_id,
                request_name: request_type,
                request,
                reply_tx,
                deadline: Instant::now() + timeout,
            })
            .await
            .map_err(|_| RpcError::EarlyClose)?;

        reply_rx.await.map_err(|_| RpcError::EarlyClose)?
    }
}

fn parse_ready_frame(line: &str) -> Result<Value, SpawnError> {
    let frame: Value = serde_json::from_str(line)
        .map_err(|_| SpawnError::MalformedReady(line.to_string()))?;
    if frame["type"] != "worker_ready" {
        return Err(SpawnError::MalformedReady(line.to_string()));
    }
    Ok(frame)
}

fn spawn_stderr_collector(
    stderr: tokio::process::ChildStderr,
    tail: Arc<Mutex<Vec<u8>>>,
) {
    tokio::spawn(async move {
        let mut stderr = stderr;
        let mut buf = [0u8; 1024];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut tail = tail.lock().expect("stderr tail poisoned");
                    tail.extend_from_slice(&buf[..n]);
                    let len = tail.len();
                    if len > STDERR_TAIL_BYTES {
                        tail.drain(..len - STDERR_TAIL_BYTES);
                    }
                }
            }
        }
    });
}

fn stderr_tail_string(tail: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8_lossy(&tail.lock().expect("stderr tail poisoned")).into_owned()
}

// ---------------------------------------------------------------------------
// Worker channel
// ---------------------------------------------------------------------------

/// A forward dispatched onto the worker channel.
enum ChannelCommand {
    Forward {
        request_id: String,
        request_name: String,
        request: Value,
        reply_tx: oneshot::Sender<Result<Value, RpcError>>,
        deadline: Instant,
    },
}

/// A pending forward awaiting its correlated response.
struct PendingForward {
    reply_tx: oneshot::Sender<Result<Value, RpcError>>,
    request_name: String,
    deadline: Instant,
    dispatched: Instant,
}

/// Spawn the channel task owning the worker's unix stream. Requests are
/// matched to responses by `requestId`; deadline expiry removes the pending
/// entry so a late reply is discarded.
fn spawn_channel_task(stream: UnixStream) -> mpsc::Sender<ChannelCommand> {
    let (command_tx, mut command_rx) = mpsc::channel::<ChannelCommand>(64);

    tokio::spawn(async move {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut pending: HashMap<String, PendingForward> = HashMap::new();
        let mut line_buffer = LineBuffer::new();
        let mut chunk = vec![0u8; 4096];

        loop {
            let next_deadline = pending.values().map(|p| p.deadline).min();
            let deadline_sleep = async {
                if let Some(deadline) = next_deadline {
                    tokio::time::sleep_until(deadline).await;
                } else {
                    std::future::pending::<()>().await;
                }
            };

            tokio::select! {
                read = reader.read(&mut chunk) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let text = String::from_utf8_lossy(&chunk[..n]).into_owned();
                            for line in line_buffer.push(&text) {
                                handle_response_line(&mut pending, &line);
                            }
                        }
                    }
                }
                cmd = command_rx.recv() => {
                    let Some(ChannelCommand::Forward {
                        request_id, request_name, request, reply_tx, deadline,
                    }) = cmd else { break };
                    if let Err(e) = write_frame(&mut write_half, &request).await {
                        let _ = reply_tx.send(Err(e));
                        continue;
                    }
                    pending.insert(request_id, PendingForward {
                        reply_tx,
                        request_name,
                        deadline,
                        dispatched: Instant::now(),
                    });
                }
                () = deadline_sleep => {
                    sweep_deadlines(&mut pending);
                }
            }
        }

        // Worker channel gone: fail whatever is still pending.
        for (_, entry) in pending.drain() {
            let _ = entry.reply_tx.send(Err(RpcError::EarlyClose));
        }
    });

    command_tx
}

fn handle_response_line(pending: &mut HashMap<String, PendingForward>, line: &str) {
    let Ok(response) = serde_json::from_str::<Value>(line) else {
        tracing::warn!("discarding malformed worker frame");
        return;
    };
    let Some(request_id) = response[WORKER_ID_FIELD].as_str() else {
        tracing::warn!("discarding worker frame without a requestId");
        return;
    };
    if let Some(entry) = pending.remove(request_id) {
        let _ = entry.reply_tx.send(Ok(response));
    } else {
        // Timed out earlier; the caller already got its fallback.
        tracing::debug!("discarding late worker response for {request_id}");
    }
}

fn sweep_deadlines(pending: &mut HashMap<String, PendingForward>) {
    let now = Instant::now();
    let expired: Vec<String> = pending
        .iter()
        .filter(|(_, p)| p.deadline <= now)
        .map(|(id, _)| id.clone())
        .collect();
    for id in expired {
        if let Some(entry) = pending.remove(&id) {
            let elapsed_ms = entry
                .dispatched
                .elapsed()
                .as_millis()
                .try_into()
                .unwrap_or(u64::MAX);
            let _ = entry.reply_tx.send(Err(RpcError::Timeout {
                request: entry.request_name,
                elapsed_ms,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_frame_parses() {
        let frame = parse_ready_frame(
            r#"{"type":"worker_ready","workerPid":10,"chromePid":20,"cdpPort":9222,"target":{"url":"http://x/","title":"X"}}"#,
        )
        .unwrap();
        assert_eq!(frame["workerPid"], 10);
    }

    #[test]
    fn malformed_ready_frames_are_rejected() {
        assert!(matches!(
            parse_ready_frame("not json"),
            Err(SpawnError::MalformedReady(_))
        ));
        assert!(matches!(
            parse_ready_frame(r#"{"type":"something_else"}"#),
            Err(SpawnError::MalformedReady(_))
        ));
    }

    #[test]
    fn spawn_error_codes() {
        assert_eq!(
            SpawnError::ReadyTimeout.rpc_code(),
            ErrorCode::CDPTimeout
        );
        assert_eq!(
            SpawnError::SpawnFailed("x".into()).rpc_code(),
            ErrorCode::WorkerStartFailed
        );
        assert_eq!(
            SpawnError::Crashed {
                stderr: String::new()
            }
            .rpc_code(),
            ErrorCode::WorkerStartFailed
        );
    }

    #[test]
    fn crash_message_carries_stderr() {
        let err = SpawnError::Crashed {
            stderr: "panic: oh no".into(),
        };
        assert!(err.message().contains("panic: oh no"));
    }

    #[tokio::test]
    async fn channel_round_trip_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("worker.test.sock");
        let listener = tokio::net::UnixListener::bind(&sock).unwrap();

        // Echo server: answers each request with an ok response.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let response = crate::rpc::ok_response(
                    request["type"].as_str().unwrap(),
                    WORKER_ID_FIELD,
                    request[WORKER_ID_FIELD].as_str().unwrap(),
                    serde_json::json!({"echo": true}),
                );
                write_frame(&mut write_half, &response).await.unwrap();
            }
        });

        let stream = UnixStream::connect(&sock).await.unwrap();
        let channel_tx = spawn_channel_task(stream);

        let (reply_tx, reply_rx) = oneshot::channel();
        channel_tx
            .send(ChannelCommand::Forward {
                request_id: "r-1".into(),
                request_name: "worker_status_request".into(),
                request: make_request(
                    "worker_status_request",
                    WORKER_ID_FIELD,
                    "r-1",
                    Value::Null,
                ),
                reply_tx,
                deadline: Instant::now() + Duration::from_secs(2),
            })
            .await
            .unwrap();

        let response = reply_rx.await.unwrap().unwrap();
        assert_eq!(response["status"], "ok");
        assert_eq!(response["echo"], true);
    }

    #[tokio::test]
    async fn channel_times_out_and_discards_late_reply() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("worker.slow.sock");
        let listener = tokio::net::UnixListener::bind(&sock).unwrap();

        // Server that never answers.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, _write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(_)) = lines.next_line().await {}
        });

        let stream = UnixStream::connect(&sock).await.unwrap();
        let channel_tx = spawn_channel_task(stream);

        let (reply_tx, reply_rx) = oneshot::channel();
        channel_tx
            .send(ChannelCommand::Forward {
                request_id: "r-2".into(),
                request_name: "worker_peek_request".into(),
                request: make_request("worker_peek_request", WORKER_ID_FIELD, "r-2", Value::Null),
                reply_tx,
                deadline: Instant::now() + Duration::from_millis(100),
            })
            .await
            .unwrap();

        let result = reply_rx.await.unwrap();
        match result {
            Err(RpcError::Timeout { request, .. }) => {
                assert_eq!(request, "worker_peek_request");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn channel_fails_pending_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("worker.dead.sock");
        let listener = tokio::net::UnixListener::bind(&sock).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Accept one request, then slam the connection shut.
            let (read_half, _write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let _ = lines.next_line().await;
        });

        let stream = UnixStream::connect(&sock).await.unwrap();
        let channel_tx = spawn_channel_task(stream);

        let (reply_tx, reply_rx) = oneshot::channel();
        channel_tx
            .send(ChannelCommand::Forward {
                request_id: "r-3".into(),
                request_name: "worker_status_request".into(),
                request: make_request("worker_status_request", WORKER_ID_FIELD, "r-3", Value::Null),
                reply_tx,
                deadline: Instant::now() + Duration::from_secs(5),
            })
            .await
            .unwrap();

        let result = reply_rx.await.unwrap();
        assert!(matches!(result, Err(RpcError::EarlyClose)));
    }
}
