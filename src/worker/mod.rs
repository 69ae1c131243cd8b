//! The worker runtime: owns one Chrome and one CDP connection, runs the
//! telemetry collectors, writes preview snapshots, and serves RPCs on its
//! private unix socket until a shutdown trigger fires.

mod preview;
mod rpc;

pub use preview::{PreviewWriter, write_final_snapshot};
pub use rpc::{WorkerContext, handle_connection, handle_request};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::UnixListener;
use tokio::sync::mpsc;

use crate::cdp::{CdpClient, CdpConfig, ReconnectConfig};
use crate::chrome::{
    ChromeHandle, ChromeLauncher, DebugEndpoint, TargetInfo, find_chrome_executable,
    pick_ephemeral_port,
};
use crate::config::READINESS_DEADLINE;
use crate::error::{AppError, ExitCode};
use crate::paths::{
    BdgPaths, acquire_lock, atomic_write_json, read_json, release_lock, remove_file, write_chrome_pid,
    write_pid,
};
use crate::readiness::await_page_ready;
use crate::telemetry::{
    CleanupRegistry, NavigationHandle, SharedStore, TargetSummary, TelemetryKind, TelemetryStore,
    capture_dom_snapshot, start_console_collector, start_navigation_tracker,
    start_network_collector,
};
use crate::timefmt::now_iso8601;

/// Timeout for Chrome to start serving its debug endpoint.
const CHROME_STARTUP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Session metadata persisted once the worker signals ready. The worker
/// writes it; the daemon and CLI read it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub worker_pid: u32,
    /// 0 when attached to an externally-managed Chrome.
    pub chrome_pid: u32,
    pub start_time: String,
    pub cdp_port: u16,
    pub target_id: String,
    pub web_socket_debugger_url: String,
    pub active_telemetry: Vec<TelemetryKind>,
}

impl SessionMetadata {
    /// Read the persisted metadata, if a session has written one.
    #[must_use]
    pub fn load(paths: &BdgPaths) -> Option<Self> {
        read_json(&paths.session_meta()).ok().flatten()
    }
}

/// Worker configuration, passed by the daemon as a single JSON argument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    /// The URL to navigate to.
    pub url: String,
    /// Explicit CDP port; an ephemeral one is picked when absent.
    pub cdp_port: Option<u16>,
    /// Telemetry kinds to activate before navigation.
    pub telemetry: Vec<TelemetryKind>,
    /// Session timeout in seconds; the worker shuts down (reason `timeout`)
    /// when it elapses.
    pub timeout_secs: Option<u64>,
    pub headless: bool,
    /// Attach to an externally-managed Chrome instead of launching one.
    pub attach_ws_url: Option<String>,
    /// Disable the console noise filter.
    pub include_all_console: bool,
    /// Chrome executable override.
    pub chrome_executable: Option<String>,
}

impl WorkerConfig {
    /// Parse the single-argument JSON form.
    ///
    /// # Errors
    ///
    /// Returns `AppError::invalid_arguments` for malformed JSON or a
    /// missing URL.
    pub fn from_arg(arg: &str) -> Result<Self, AppError> {
        let config: Self = serde_json::from_str(arg)
            .map_err(|e| AppError::invalid_arguments(format!("bad worker config: {e}")))?;
        if config.url.is_empty() {
            return Err(AppError::invalid_arguments("worker config is missing url"));
        }
        Ok(config)
    }
}

/// Why the worker is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Normal,
    Crash,
    Timeout,
}

/// Everything the shutdown sequence needs to tear down.
struct WorkerState {
    paths: BdgPaths,
    store: SharedStore,
    client: Arc<CdpClient>,
    registry: CleanupRegistry,
    chrome: Option<ChromeHandle>,
    sock_path: std::path::PathBuf,
    dom_active: bool,
}

/// Run the worker to completion. Any startup failure is reported through
/// the exit status and stderr, which the daemon captures.
///
/// # Errors
///
/// Returns `AppError` on any startup failure.
pub async fn run_worker(config: WorkerConfig) -> Result<(), AppError> {
    url::Url::parse(&config.url)
        .map_err(|e| AppError::invalid_url(&config.url, &e.to_string()))?;

    let paths = BdgPaths::resolve()?;
    paths.ensure_root()?;

    // Step 1: Chrome (launch or attach).
    let (chrome, chrome_pid, cdp_port, attach_ws) = start_chrome(&config, &paths).await?;

    // Step 2: the session lock. A live holder wins; Chrome (if we launched
    // it) is reaped by the handle's drop on the error path.
    acquire_lock(&paths.session_lock()).map_err(|e| match e {
        crate::paths::SessionFileError::LockHeld { pid } => AppError::new(
            format!("session already running (worker pid {pid})"),
            ExitCode::ResourceBusy,
        ),
        other => other.into(),
    })?;

    let result = start_session(config, paths.clone(), chrome, chrome_pid, cdp_port, attach_ws).await;
    if result.is_err() {
        let _ = release_lock(&paths.session_lock());
    }
    result
}

/// Launch Chrome or prepare attachment to an external one.
async fn start_chrome(
    config: &WorkerConfig,
    paths: &BdgPaths,
) -> Result<(Option<ChromeHandle>, u32, u16, Option<String>), AppError> {
    if let Some(ws_url) = &config.attach_ws_url {
        let port = config
            .cdp_port
            .or_else(|| extract_ws_port(ws_url))
            .unwrap_or(0);
        return Ok((None, 0, port, Some(ws_url.clone())));
    }

    let port = match config.cdp_port {
        Some(port) => port,
        None => pick_ephemeral_port()?,
    };
    let executable =
        find_chrome_executable(config.chrome_executable.as_deref().map(std::path::Path::new))?;
    let launcher = ChromeLauncher {
        executable,
        port,
        headless: config.headless,
        extra_args: Vec::new(),
        profile_dir: None,
    };
    let chrome = launcher.launch(CHROME_STARTUP_TIMEOUT).await?;

    let pid = chrome.pid();
    if let Err(e) = write_chrome_pid(paths, pid) {
        tracing::warn!("could not cache Chrome pid: {e}");
    }
    Ok((Some(chrome), pid, port, None))
}

/// Extract the port from a `ws://host:port/...` URL.
fn extract_ws_port(ws_url: &str) -> Option<u16> {
    let without_scheme = ws_url
        .strip_prefix("ws://")
        .or_else(|| ws_url.strip_prefix("wss://"))?;
    let host_port = without_scheme.split('/').next()?;
    host_port.rsplit(':').next()?.parse().ok()
}

/// Steps 3–8: target, transport, collectors, navigation, readiness, socket,
/// metadata, ready frame, serve loop, shutdown.
#[allow(clippy::too_many_lines)]
async fn start_session(
    config: WorkerConfig,
    paths: BdgPaths,
    chrome: Option<ChromeHandle>,
    chrome_pid: u32,
    cdp_port: u16,
    attach_ws: Option<String>,
) -> Result<(), AppError> {
    // Step 3: resolve the page target.
    let (target_id, ws_url) = match &attach_ws {
        Some(ws) => ("external".to_string(), ws.clone()),
        None => resolve_page_target(cdp_port).await?,
    };

    // Step 4: open the CDP transport. Reconnection stays off: a dead CDP
    // link is a shutdown trigger, not something to paper over.
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel(1);
    let cdp_config = CdpConfig {
        reconnect: ReconnectConfig {
            max_retries: 0,
            ..ReconnectConfig::default()
        },
        ..CdpConfig::default()
    };
    let client = Arc::new(
        CdpClient::connect(&ws_url, cdp_config, Some(disconnect_tx))
            .await
            .map_err(AppError::from)?,
    );

    // Step 5: collectors before navigation, so events are captured from the
    // first byte. Partial setup failure unwinds whatever was registered.
    let nav = NavigationHandle::new();
    let store = TelemetryStore::shared(
        config.telemetry.clone(),
        TargetSummary {
            url: config.url.clone(),
            title: String::new(),
        },
    );
    let mut registry = CleanupRegistry::new();

    let collectors_result = activate_collectors(
        &config,
        &client,
        &store,
        &nav,
        &mut registry,
    )
    .await;
    if let Err(e) = collectors_result {
        registry.run_all();
        let _ = client.close().await;
        return Err(e.into());
    }

    // Step 6: navigate and wait for the page to stabilise.
    let nav_result = client
        .send_command("Page.navigate", Some(json!({"url": config.url})))
        .await
        .map_err(AppError::from)?;
    if let Some(error_text) = nav_result["errorText"].as_str() {
        if !error_text.is_empty() {
            registry.run_all();
            let _ = client.close().await;
            return Err(AppError::new(
                format!("navigation failed: {error_text}"),
                ExitCode::CdpConnection,
            ));
        }
    }
    let readiness = await_page_ready(&client, READINESS_DEADLINE).await;
    tracing::debug!(?readiness, "navigation settled");

    let title = crate::telemetry::dom_page_title(&client).await;
    store.lock().expect("telemetry store poisoned").target.title = title.clone();

    // Step 7: worker socket, session metadata, ready frame.
    let worker_pid = std::process::id();
    let sock_path = paths.worker_sock(worker_pid);
    let _ = remove_file(&sock_path);
    let listener = UnixListener::bind(&sock_path)
        .map_err(|e| AppError::new(format!("worker socket bind failed: {e}"), ExitCode::GeneralError))?;

    write_pid(&paths.session_pid(), worker_pid)?;
    let metadata = SessionMetadata {
        worker_pid,
        chrome_pid,
        start_time: now_iso8601(),
        cdp_port,
        target_id,
        web_socket_debugger_url: ws_url,
        active_telemetry: config.telemetry.clone(),
    };
    atomic_write_json(&paths.session_meta(), &metadata)?;

    emit_ready_frame(&metadata, &config.url, &title);

    // Step 8: serve RPCs until a shutdown trigger fires.
    let state = WorkerState {
        paths,
        store,
        client,
        registry,
        chrome,
        sock_path,
        dom_active: config.telemetry.contains(&TelemetryKind::Dom),
    };
    let reason = serve(
        &listener,
        &state,
        &mut disconnect_rx,
        config.timeout_secs,
    )
    .await;

    shutdown(state, reason).await;
    Ok(())
}

/// Find the first page target, creating one when the browser has none.
async fn resolve_page_target(cdp_port: u16) -> Result<(String, String), AppError> {
    let endpoint = DebugEndpoint::localhost(cdp_port);
    let targets = endpoint.targets().await.map_err(AppError::from)?;
    let target = match targets.into_iter().find(TargetInfo::is_page) {
        Some(target) => target,
        None => endpoint.open_page().await.map_err(AppError::from)?,
    };
    let ws = target.ws_debugger_url.ok_or_else(|| {
        AppError::new(
            "page target has no webSocketDebuggerUrl",
            ExitCode::CdpConnection,
        )
    })?;
    Ok((target.id, ws))
}

/// Activate the requested collectors. The navigation tracker always runs:
/// every collected item is tagged with a navigation id.
async fn activate_collectors(
    config: &WorkerConfig,
    client: &Arc<CdpClient>,
    store: &SharedStore,
    nav: &NavigationHandle,
    registry: &mut CleanupRegistry,
) -> Result<(), crate::cdp::CdpError> {
    registry.register(start_navigation_tracker(client, store.clone(), nav.clone()).await?);
    if config.telemetry.contains(&TelemetryKind::Network) {
        registry.register(
            start_network_collector(Arc::clone(client), store.clone(), nav.clone()).await?,
        );
    }
    if config.telemetry.contains(&TelemetryKind::Console) {
        registry.register(
            start_console_collector(client, store.clone(), nav.clone(), config.include_all_console)
                .await?,
        );
    }
    Ok(())
}

/// The single `worker_ready` JSONL frame on stdout. Everything else the
/// worker has to say goes to stderr or the log file.
fn emit_ready_frame(metadata: &SessionMetadata, url: &str, title: &str) {
    let frame = json!({
        "type": "worker_ready",
        "workerPid": metadata.worker_pid,
        "chromePid": metadata.chrome_pid,
        "cdpPort": metadata.cdp_port,
        "target": {"url": url, "title": title},
    });
    println!("{frame}");
    use std::io::Write;
    let _ = std::io::stdout().flush();
}

/// Accept daemon connections until a shutdown trigger fires.
async fn serve(
    listener: &UnixListener,
    state: &WorkerState,
    disconnect_rx: &mut mpsc::Receiver<()>,
    timeout_secs: Option<u64>,
) -> ShutdownReason {
    let preview = PreviewWriter::start(state.store.clone(), state.paths.clone());
    let ctx = WorkerContext {
        store: state.store.clone(),
        client: Arc::clone(&state.client),
    };

    let session_timeout = async {
        match timeout_secs {
            Some(secs) => tokio::time::sleep(std::time::Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(session_timeout);

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(e) => {
            tracing::error!("cannot install SIGTERM handler: {e}");
            preview.stop().await;
            return ShutdownReason::Crash;
        }
    };
    let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
    {
        Ok(signal) => signal,
        Err(e) => {
            tracing::error!("cannot install SIGINT handler: {e}");
            preview.stop().await;
            return ShutdownReason::Crash;
        }
    };

    let reason = loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(rpc::handle_connection(stream, ctx.clone()));
                    }
                    Err(e) => {
                        tracing::warn!("worker socket accept failed: {e}");
                    }
                }
            }
            _ = sigterm.recv() => {
                tracing::info!("worker received SIGTERM, shutting down");
                break ShutdownReason::Normal;
            }
            _ = sigint.recv() => {
                tracing::info!("worker received SIGINT, shutting down");
                break ShutdownReason::Normal;
            }
            _ = disconnect_rx.recv() => {
                tracing::warn!("CDP connection lost, shutting down");
                break ShutdownReason::Crash;
            }
            () = &mut session_timeout => {
                tracing::info!("session timeout elapsed, shutting down");
                break ShutdownReason::Timeout;
            }
        }
    };

    // The preview writer stops before any teardown mutates the store.
    preview.stop().await;
    reason
}

/// The shutdown sequence. Every step is isolated: one failure never blocks
/// the rest.
async fn shutdown(mut state: WorkerState, reason: ShutdownReason) {
    tracing::info!(?reason, "worker shutdown started");

    // DOM capture only on a clean stop with DOM telemetry active.
    if reason == ShutdownReason::Normal && state.dom_active {
        match capture_dom_snapshot(&state.client).await {
            Ok(snapshot) => {
                state.store.lock().expect("telemetry store poisoned").dom = Some(snapshot);
            }
            Err(e) => tracing::warn!("final DOM capture failed: {e}"),
        }
    }

    state.registry.run_all();

    if let Err(e) = state.client.close().await {
        tracing::debug!("transport close: {e}");
    }

    // Only Chrome instances this worker launched are reaped; an external
    // attachment stays untouched (`state.chrome` is `None` there).
    if let Some(mut chrome) = state.chrome.take() {
        if !chrome.shutdown().await {
            tracing::warn!("Chrome did not exit during shutdown");
        }
    }

    let partial = reason != ShutdownReason::Normal;
    if let Err(e) = write_final_snapshot(&state.store, &state.paths, partial) {
        tracing::warn!("final snapshot write failed: {e}");
    }

    let paths = &state.paths;
    for (label, result) in [
        ("session.lock", release_lock(&paths.session_lock())),
        ("session.pid", remove_file(&paths.session_pid())),
        ("session.meta.json", remove_file(&paths.session_meta())),
        ("session.preview.json", remove_file(&paths.session_preview())),
        ("session.full.json", remove_file(&paths.session_full())),
        ("worker socket", remove_file(&state.sock_path)),
    ] {
        if let Err(e) = result {
            tracing::warn!("cleanup of {label} failed: {e}");
        }
    }

    tracing::info!("worker shutdown complete");
}
