use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::TelemetryKind;
use crate::timefmt::epoch_ms_to_iso;

/// One network request, correlated across its CDP lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    /// Stable CDP-assigned request id.
    pub request_id: String,
    pub url: String,
    pub method: String,
    /// Milliseconds since epoch.
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub navigation_id: u32,
    /// Explicit failure marker; `status == 0` alone is ambiguous with
    /// "no response yet".
    #[serde(default)]
    pub failed: bool,
}

/// One console message or uncaught exception.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub text: String,
    /// Milliseconds since epoch.
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    pub navigation_id: u32,
}

/// One main-frame navigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationEvent {
    pub url: String,
    /// Milliseconds since epoch.
    pub timestamp: u64,
    pub navigation_id: u32,
}

/// A captured DOM snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub url: String,
    pub title: String,
    #[serde(rename = "outerHTML")]
    pub outer_html: String,
}

/// The page target a session is attached to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetSummary {
    pub url: String,
    pub title: String,
}

/// Per-kind activity counters for `worker_status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    pub counts: Value,
    pub last_at: Value,
}

/// The worker's in-process telemetry record. Mutated only from the worker's
/// collector-dispatch context; snapshot emission copies ranges out under the
/// lock.
#[derive(Debug)]
pub struct TelemetryStore {
    pub network: Vec<NetworkRequest>,
    pub console: Vec<ConsoleMessage>,
    pub navigations: Vec<NavigationEvent>,
    pub active_telemetry: Vec<TelemetryKind>,
    /// Wall-clock session start, milliseconds since epoch.
    pub start_time_ms: u64,
    /// Monotonic session start, for duration computation.
    pub started: std::time::Instant,
    pub target: TargetSummary,
    pub dom: Option<DomSnapshot>,
    /// One-time drop warning states for the bounded buffers.
    pub network_limit_warned: bool,
    pub console_limit_warned: bool,
    /// Wall-clock of the most recent item per kind, for activity reporting.
    pub last_network_at: Option<u64>,
    pub last_console_at: Option<u64>,
}

/// The store as shared between the worker's tasks.
pub type SharedStore = Arc<Mutex<TelemetryStore>>;

impl TelemetryStore {
    #[must_use]
    pub fn new(active_telemetry: Vec<TelemetryKind>, target: TargetSummary) -> Self {
        Self {
            network: Vec::new(),
            console: Vec::new(),
            navigations: Vec::new(),
            active_telemetry,
            start_time_ms: crate::timefmt::now_epoch_ms(),
            started: std::time::Instant::now(),
            target,
            dom: None,
            network_limit_warned: false,
            console_limit_warned: false,
            last_network_at: None,
            last_console_at: None,
        }
    }

    #[must_use]
    pub fn shared(active_telemetry: Vec<TelemetryKind>, target: TargetSummary) -> SharedStore {
        Arc::new(Mutex::new(Self::new(active_telemetry, target)))
    }

    /// Session duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
    }

    /// Activity counts and last-seen timestamps per kind.
    #[must_use]
    pub fn activity(&self) -> ActivitySummary {
        ActivitySummary {
            counts: json!({
                "network": self.network.len(),
                "console": self.console.len(),
                "navigations": self.navigations.len(),
            }),
            last_at: json!({
                "network": self.last_network_at.map(epoch_ms_to_iso),
                "console": self.last_console_at.map(epoch_ms_to_iso),
            }),
        }
    }
}

/// Which view of the store a snapshot represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Bounded, body-stripped, periodically refreshed.
    Preview,
    /// Complete buffers with bodies, periodically refreshed.
    Full,
    /// Written once at shutdown. `partial` is true unless the session ended
    /// normally.
    Final { partial: bool },
}

/// Strip a network request down to its preview form (no bodies).
fn strip_network(req: &NetworkRequest) -> NetworkRequest {
    NetworkRequest {
        request_body: None,
        response_body: None,
        ..req.clone()
    }
}

/// Strip a console message down to its preview form (no args).
fn strip_console(msg: &ConsoleMessage) -> ConsoleMessage {
    ConsoleMessage {
        args: None,
        ..msg.clone()
    }
}

/// Emit a snapshot of the store: a pure function of the record and the mode.
#[must_use]
pub fn emit_snapshot(store: &TelemetryStore, mode: SnapshotMode, last_n: usize) -> Value {
    let (network, console): (Vec<NetworkRequest>, Vec<ConsoleMessage>) = match mode {
        SnapshotMode::Preview => {
            let net_start = store.network.len().saturating_sub(last_n);
            let con_start = store.console.len().saturating_sub(last_n);
            (
                store.network[net_start..].iter().map(strip_network).collect(),
                store.console[con_start..].iter().map(strip_console).collect(),
            )
        }
        SnapshotMode::Full | SnapshotMode::Final { .. } => {
            (store.network.clone(), store.console.clone())
        }
    };

    let partial = match mode {
        SnapshotMode::Final { partial } => partial,
        SnapshotMode::Preview | SnapshotMode::Full => true,
    };

    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "startTime": epoch_ms_to_iso(store.start_time_ms),
        "duration": store.duration_ms(),
        "target": store.target,
        "activeTelemetry": store.active_telemetry,
        "partial": partial,
        "counts": {
            "network": store.network.len(),
            "console": store.console.len(),
            "navigations": store.navigations.len(),
        },
        "network": network,
        "console": console,
        "navigations": store.navigations,
        "dom": store.dom,
    })
}
