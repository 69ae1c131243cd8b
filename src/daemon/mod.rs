//! The daemon supervisor: owns the client-facing unix socket, routes RPCs,
//! spawns and monitors the worker subprocess, and enforces single-instance
//! semantics through the on-disk locks.

mod client;
mod supervisor;

pub use client::DaemonClient;
pub use supervisor::{SpawnError, WorkerLink, WorkerSupervisor};

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc};

use crate::config::{self, WORKER_FORWARD_TIMEOUT};
use crate::error::{AppError, ErrorCode, ExitCode};
use crate::paths::{
    BdgPaths, acquire_lock, pid_alive, read_pid, release_lock, remove_file, write_pid,
};
use crate::rpc::{
    CLIENT_ID_FIELD, error_response, get_command_name, ok_response, read_frame, write_frame,
};
use crate::telemetry::TelemetryKind;
use crate::worker::{SessionMetadata, WorkerConfig};

/// How long the daemon waits for a client to send its one request line.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for the worker to act on SIGTERM during stop-session.
const WORKER_STOP_GRACE: Duration = Duration::from_secs(5);

/// Pause between the stop-session reply and daemon exit, so the response
/// flushes before the socket goes away.
const STOP_FLUSH_DELAY: Duration = Duration::from_millis(100);

/// Loop-internal control events raised by request handlers.
enum DaemonEvent {
    /// A worker was installed; re-arm the exit watch.
    WorkerStarted,
    /// Stop-session completed; exit the daemon.
    StopDaemon,
}

/// Shared daemon state: the (at most one) supervised worker.
type WorkerSlot = Arc<Mutex<Option<WorkerSupervisor>>>;

struct DaemonContext {
    paths: BdgPaths,
    worker: WorkerSlot,
    events_tx: mpsc::Sender<DaemonEvent>,
    /// Stderr tail of the last worker that died without a stop request,
    /// surfaced by `status_request` to explain the crash.
    last_crash: Arc<Mutex<Option<String>>>,
}

/// Run the daemon to completion.
///
/// # Errors
///
/// Returns `AppError` with `DaemonAlreadyRunning` when a live daemon holds
/// the lock, or a session-file error when startup hygiene fails.
pub async fn run_daemon(paths: BdgPaths) -> Result<(), AppError> {
    paths.ensure_root()?;

    // Startup lock: held only across the socket takeover, then released.
    // It serializes concurrent startups; liveness of an established daemon
    // is judged from its pid file below.
    acquire_lock(&paths.daemon_lock()).map_err(|e| match e {
        crate::paths::SessionFileError::LockHeld { pid } => AppError::new(
            format!("daemon already running (pid {pid})"),
            ExitCode::DaemonAlreadyRunning,
        ),
        other => other.into(),
    })?;

    if let Some(pid) = read_pid(&paths.daemon_pid()) {
        if pid_alive(pid) && pid != std::process::id() {
            let _ = release_lock(&paths.daemon_lock());
            return Err(AppError::new(
                format!("daemon already running (pid {pid})"),
                ExitCode::DaemonAlreadyRunning,
            ));
        }
    }

    let startup = daemon_startup(&paths);
    let listener = match startup {
        Ok(listener) => listener,
        Err(e) => {
            let _ = release_lock(&paths.daemon_lock());
            return Err(e);
        }
    };
    let _ = release_lock(&paths.daemon_lock());

    tracing::info!("daemon listening on {}", paths.daemon_sock().display());

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let ctx = DaemonContext {
        paths: paths.clone(),
        worker: Arc::new(Mutex::new(None)),
        events_tx,
        last_crash: Arc::new(Mutex::new(None)),
    };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| AppError::new(format!("signal handler: {e}"), ExitCode::SignalHandler))?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| AppError::new(format!("signal handler: {e}"), ExitCode::SignalHandler))?;

    loop {
        let exit_watch = { ctx.worker.lock().await.as_ref().map(WorkerSupervisor::exit_watch) };
        let worker_exit = async {
            match exit_watch {
                Some(mut rx) => {
                    while !*rx.borrow() {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let handler_ctx = DaemonContext {
                            paths: ctx.paths.clone(),
                            worker: Arc::clone(&ctx.worker),
                            events_tx: ctx.events_tx.clone(),
                            last_crash: Arc::clone(&ctx.last_crash),
                        };
                        tokio::spawn(handle_client(stream, handler_ctx));
                    }
                    Err(e) => tracing::warn!("accept failed: {e}"),
                }
            }
            () = worker_exit => {
                tracing::warn!("worker exited, reaping session state");
                reap_worker(&ctx).await;
            }
            event = events_rx.recv() => {
                match event {
                    Some(DaemonEvent::WorkerStarted) => { /* re-arm the exit watch */ }
                    Some(DaemonEvent::StopDaemon) | None => break,
                }
            }
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
        }
    }

    tokio::time::sleep(STOP_FLUSH_DELAY).await;
    daemon_shutdown(&ctx).await;
    Ok(())
}

/// Clean stale artefacts from a crashed predecessor, take over the socket
/// path, and write the daemon pid file.
fn daemon_startup(paths: &BdgPaths) -> Result<UnixListener, AppError> {
    clean_stale_session(paths);

    let sock_path = paths.daemon_sock();
    remove_file(&sock_path)?;
    let listener = UnixListener::bind(&sock_path).map_err(|e| {
        AppError::new(
            format!("cannot bind {}: {e}", sock_path.display()),
            ExitCode::GeneralError,
        )
    })?;
    write_pid(&paths.daemon_pid(), std::process::id())?;
    Ok(listener)
}

/// Remove session artefacts left behind by a dead worker, including stale
/// per-pid worker sockets.
fn clean_stale_session(paths: &BdgPaths) {
    let worker_pid = read_pid(&paths.session_pid());
    let stale = match worker_pid {
        Some(pid) => !pid_alive(pid),
        None => paths.session_meta().exists(),
    };
    if stale {
        tracing::info!("cleaning stale session artefacts");
        for path in [
            paths.session_pid(),
            paths.session_meta(),
            paths.session_preview(),
            paths.session_full(),
            paths.session_lock(),
        ] {
            let _ = remove_file(&path);
        }
    }

    // Worker sockets are per-pid; unlink any whose owner is gone.
    if let Ok(entries) = std::fs::read_dir(paths.root()) {
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(pid) = name
                .strip_prefix("worker.")
                .and_then(|rest| rest.strip_suffix(".sock"))
                .and_then(|pid| pid.parse::<u32>().ok())
            else {
                continue;
            };
            if !pid_alive(pid) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

/// Tear down everything the daemon owns on exit.
async fn daemon_shutdown(ctx: &DaemonContext) {
    if let Some(worker) = ctx.worker.lock().await.take() {
        worker.terminate(WORKER_STOP_GRACE).await;
    }
    let _ = remove_file(&ctx.paths.daemon_sock());
    let _ = remove_file(&ctx.paths.daemon_pid());
    tracing::info!("daemon exited");
}

/// Reap session files after a worker died without cleaning up.
async fn reap_worker(ctx: &DaemonContext) {
    let worker = ctx.worker.lock().await.take();
    if let Some(worker) = worker {
        let tail = worker.stderr_tail();
        if !tail.is_empty() {
            tracing::warn!("worker stderr tail: {tail}");
            *ctx.last_crash.lock().await = Some(tail);
        }
    }
    for path in [
        ctx.paths.session_pid(),
        ctx.paths.session_meta(),
        ctx.paths.session_preview(),
        ctx.paths.session_full(),
        ctx.paths.session_lock(),
    ] {
        let _ = remove_file(&path);
    }
    clean_stale_session(&ctx.paths);
}

/// One client connection: exactly one JSONL request, exactly one JSONL
/// response.
async fn handle_client(stream: UnixStream, ctx: DaemonContext) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = match read_frame(&mut reader, CLIENT_READ_TIMEOUT, "client_request").await {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!("client read failed: {e}");
            let response = error_response(
                "unknown_request",
                CLIENT_ID_FIELD,
                "",
                e.rpc_code(),
                &e.to_string(),
            );
            let _ = write_frame(&mut write_half, &response).await;
            return;
        }
    };

    let response = route_request(&ctx, &request).await;
    if let Err(e) = write_frame(&mut write_half, &response).await {
        tracing::debug!("client write failed: {e}");
    }
}

/// Dispatch one request by `type`.
async fn route_request(ctx: &DaemonContext, request: &Value) -> Value {
    let msg_type = request["type"].as_str().unwrap_or_default().to_string();
    let session_id = request[CLIENT_ID_FIELD]
        .as_str()
        .unwrap_or_default()
        .to_string();

    match msg_type.as_str() {
        "handshake_request" => ok_response(
            &msg_type,
            CLIENT_ID_FIELD,
            &session_id,
            json!({"pid": std::process::id(), "version": env!("CARGO_PKG_VERSION")}),
        ),
        "status_request" => handle_status(ctx, &msg_type, &session_id).await,
        "peek_request" => handle_peek(ctx, &msg_type, &session_id, request).await,
        "start_session_request" => handle_start_session(ctx, &msg_type, &session_id, request).await,
        "stop_session_request" => handle_stop_session(ctx, &msg_type, &session_id).await,
        other if get_command_name(other).is_some() => {
            handle_generic_forward(ctx, &msg_type, &session_id, request).await
        }
        other => error_response(
            other,
            CLIENT_ID_FIELD,
            &session_id,
            ErrorCode::InvalidArguments,
            &format!("unknown request type: {other}"),
        ),
    }
}

/// A live worker's forwarding link, if one exists.
async fn live_link(ctx: &DaemonContext) -> Option<WorkerLink> {
    let guard = ctx.worker.lock().await;
    guard
        .as_ref()
        .filter(|w| w.is_alive())
        .map(WorkerSupervisor::link)
}

async fn handle_status(ctx: &DaemonContext, msg_type: &str, session_id: &str) -> Value {
    let metadata = SessionMetadata::load(&ctx.paths);
    let link = live_link(ctx).await;

    let mut data = json!({
        "daemon": {"pid": std::process::id(), "version": env!("CARGO_PKG_VERSION")},
        "active": link.is_some(),
    });
    if let Some(metadata) = metadata {
        data["session"] = serde_json::to_value(&metadata).unwrap_or(Value::Null);
    }
    if link.is_none() {
        if let Some(tail) = ctx.last_crash.lock().await.as_ref() {
            data["lastWorkerCrash"] = json!(tail);
        }
    }

    if let Some(link) = link {
        match link
            .forward("worker_status", Value::Null, WORKER_FORWARD_TIMEOUT)
            .await
        {
            Ok(worker_status) => {
                // Merge the worker's activity into the reply.
                for key in ["startTime", "duration", "target", "activeTelemetry", "activity"] {
                    if let Some(value) = worker_status.get(key) {
                        data[key] = value.clone();
                    }
                }
            }
            Err(e) => {
                // Worker unresponsive: return what is known locally.
                tracing::warn!("worker_status forward failed: {e}");
                data["workerUnresponsive"] = json!(true);
            }
        }
    }

    ok_response(msg_type, CLIENT_ID_FIELD, session_id, data)
}

async fn handle_peek(
    ctx: &DaemonContext,
    msg_type: &str,
    session_id: &str,
    request: &Value,
) -> Value {
    let Some(link) = live_link(ctx).await else {
        return error_response(
            msg_type,
            CLIENT_ID_FIELD,
            session_id,
            ErrorCode::NoSession,
            "no active session",
        );
    };

    let mut extra = serde_json::Map::new();
    if let Some(last_n) = request.get("lastN") {
        extra.insert("lastN".into(), last_n.clone());
    }
    match link
        .forward("worker_peek", Value::Object(extra), WORKER_FORWARD_TIMEOUT)
        .await
    {
        Ok(worker_response) => relay_worker_response(msg_type, session_id, worker_response),
        Err(e) => error_response(
            msg_type,
            CLIENT_ID_FIELD,
            session_id,
            e.rpc_code(),
            &e.to_string(),
        ),
    }
}

async fn handle_start_session(
    ctx: &DaemonContext,
    msg_type: &str,
    session_id: &str,
    request: &Value,
) -> Value {
    // Hold the slot for the whole spawn: under concurrent starts exactly
    // one caller spawns, the rest observe the winner.
    let mut slot = ctx.worker.lock().await;
    if let Some(existing) = slot.as_ref().filter(|w| w.is_alive()) {
        let context = session_already_running_context(ctx, existing).await;
        let mut response = error_response(
            msg_type,
            CLIENT_ID_FIELD,
            session_id,
            ErrorCode::SessionAlreadyRunning,
            &format!("a session is already running (worker pid {})", existing.pid),
        );
        response["worker"] = context;
        return response;
    }

    let config = match worker_config_from_request(&ctx.paths, request) {
        Ok(config) => config,
        Err(e) => {
            return error_response(
                msg_type,
                CLIENT_ID_FIELD,
                session_id,
                match e.code {
                    ExitCode::InvalidUrl => ErrorCode::InvalidURL,
                    _ => ErrorCode::InvalidArguments,
                },
                &e.message,
            );
        }
    };

    match WorkerSupervisor::spawn(&ctx.paths, &config).await {
        Ok(worker) => {
            let ready = worker.ready.clone();
            *slot = Some(worker);
            drop(slot);
            *ctx.last_crash.lock().await = None;
            let _ = ctx.events_tx.send(DaemonEvent::WorkerStarted).await;
            let data = json!({
                "workerPid": ready["workerPid"],
                "chromePid": ready["chromePid"],
                "cdpPort": ready["cdpPort"],
                "target": ready["target"],
            });
            ok_response(msg_type, CLIENT_ID_FIELD, session_id, data)
        }
        Err(spawn_error) => error_response(
            msg_type,
            CLIENT_ID_FIELD,
            session_id,
            spawn_error.rpc_code(),
            &spawn_error.message(),
        ),
    }
}

/// Actionable context for `SessionAlreadyRunning`: the live worker's pid,
/// session duration, and (best-effort) its current URL via Chrome's
/// `/json/list`.
async fn session_already_running_context(
    ctx: &DaemonContext,
    worker: &WorkerSupervisor,
) -> Value {
    let mut context = json!({
        "pid": worker.pid,
        "duration": worker.duration_ms(),
    });
    if let Some(url) = current_page_url(&ctx.paths).await {
        context["url"] = json!(url);
    }
    context
}

/// The current page URL of the active session's Chrome, best-effort.
async fn current_page_url(paths: &BdgPaths) -> Option<String> {
    let metadata = SessionMetadata::load(paths)?;
    if metadata.cdp_port == 0 {
        return None;
    }
    let targets = crate::chrome::DebugEndpoint::localhost(metadata.cdp_port)
        .targets()
        .await
        .ok()?;
    targets
        .into_iter()
        .find(|t| t.target_type == "page")
        .map(|t| t.url)
}

/// Build the worker config from a `start_session_request`, applying config
/// file defaults.
fn worker_config_from_request(paths: &BdgPaths, request: &Value) -> Result<WorkerConfig, AppError> {
    let url = request["url"]
        .as_str()
        .ok_or_else(|| AppError::invalid_arguments("start_session requires a url"))?
        .to_string();
    url::Url::parse(&url).map_err(|e| AppError::invalid_url(&url, &e.to_string()))?;

    let file = config::load_config(paths.root()).unwrap_or_default();

    let telemetry: Vec<TelemetryKind> = match request["telemetry"].as_array() {
        Some(kinds) => kinds
            .iter()
            .filter_map(Value::as_str)
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(AppError::invalid_arguments)?,
        None => file
            .session
            .telemetry
            .as_ref()
            .map(|kinds| {
                kinds
                    .iter()
                    .map(|s| s.parse())
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()
            .map_err(AppError::invalid_arguments)?
            .unwrap_or_else(|| vec![TelemetryKind::Network, TelemetryKind::Console]),
    };

    Ok(WorkerConfig {
        url,
        cdp_port: request["cdpPort"]
            .as_u64()
            .and_then(|p| u16::try_from(p).ok()),
        telemetry,
        timeout_secs: request["timeoutSecs"]
            .as_u64()
            .or(file.session.timeout_secs),
        headless: request["headless"]
            .as_bool()
            .or(file.session.headless)
            .unwrap_or(false),
        attach_ws_url: request["attachWsUrl"].as_str().map(String::from),
        include_all_console: request["includeAllConsole"].as_bool().unwrap_or(false),
        chrome_executable: config::chrome_override(&file)
            .map(|p| p.display().to_string()),
    })
}

async fn handle_stop_session(ctx: &DaemonContext, msg_type: &str, session_id: &str) -> Value {
    let worker = ctx.worker.lock().await.take();
    let Some(worker) = worker.filter(|w| w.is_alive()) else {
        return error_response(
            msg_type,
            CLIENT_ID_FIELD,
            session_id,
            ErrorCode::NoSession,
            "no active session",
        );
    };

    // Capture the Chrome pid before cleanup removes the metadata.
    let chrome_pid = SessionMetadata::load(&ctx.paths)
        .map_or(worker.chrome_pid, |m| m.chrome_pid);

    worker.terminate(WORKER_STOP_GRACE).await;

    // The worker cleans up after itself on SIGTERM; reap whatever is left.
    for path in [
        ctx.paths.session_pid(),
        ctx.paths.session_meta(),
        ctx.paths.session_preview(),
        ctx.paths.session_full(),
        ctx.paths.session_lock(),
    ] {
        let _ = remove_file(&path);
    }

    let _ = ctx.events_tx.send(DaemonEvent::StopDaemon).await;
    ok_response(
        msg_type,
        CLIENT_ID_FIELD,
        session_id,
        json!({"chromePid": chrome_pid}),
    )
}

/// The generic forward path for registered worker commands.
async fn handle_generic_forward(
    ctx: &DaemonContext,
    msg_type: &str,
    session_id: &str,
    request: &Value,
) -> Value {
    let Some(command) = get_command_name(msg_type) else {
        return error_response(
            msg_type,
            CLIENT_ID_FIELD,
            session_id,
            ErrorCode::InvalidArguments,
            &format!("not a registered command: {msg_type}"),
        );
    };
    let Some(link) = live_link(ctx).await else {
        return error_response(
            msg_type,
            CLIENT_ID_FIELD,
            session_id,
            ErrorCode::NoSession,
            "no active session",
        );
    };

    // Pass the request payload through minus the envelope fields.
    let mut extra = request.as_object().cloned().unwrap_or_default();
    extra.remove("type");
    extra.remove(CLIENT_ID_FIELD);

    match link
        .forward(command, Value::Object(extra), WORKER_FORWARD_TIMEOUT)
        .await
    {
        Ok(worker_response) => relay_worker_response(msg_type, session_id, worker_response),
        Err(e) => error_response(
            msg_type,
            CLIENT_ID_FIELD,
            session_id,
            e.rpc_code(),
            &e.to_string(),
        ),
    }
}

/// Re-envelope a worker response for the client: swap the correlation id
/// and type, keep status/errorCode/data fields as-is.
fn relay_worker_response(request_type: &str, session_id: &str, worker_response: Value) -> Value {
    let mut obj = worker_response.as_object().cloned().unwrap_or_default();
    obj.remove("type");
    obj.remove(crate::rpc::WORKER_ID_FIELD);
    obj.insert(
        "type".into(),
        json!(crate::rpc::response_type_for(request_type)),
    );
    obj.insert(CLIENT_ID_FIELD.into(), json!(session_id));
    Value::Object(obj)
}
