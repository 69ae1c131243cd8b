use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::cdp::CdpClient;
use crate::config::PEEK_DEFAULT_LAST_N;
use crate::error::ErrorCode;
use crate::rpc::{WORKER_ID_FIELD, error_response, get_command_name, ok_response};
use crate::telemetry::{
    SharedStore, SnapshotMode, capture_dom_snapshot, emit_snapshot,
};
use crate::timefmt::epoch_ms_to_iso;

/// Shared state the worker's RPC handlers operate on.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: SharedStore,
    pub client: Arc<CdpClient>,
}

/// Serve one daemon connection: a JSONL request per line, a JSONL response
/// per request. The daemon holds this connection open for the worker's
/// lifetime.
pub async fn handle_connection(stream: UnixStream, ctx: WorkerContext) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("worker socket read error: {e}");
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Value>(trimmed) {
            Ok(request) => handle_request(&ctx, &request).await,
            Err(e) => error_response(
                "unknown_request",
                WORKER_ID_FIELD,
                "",
                ErrorCode::IPCParse,
                &format!("malformed request: {e}"),
            ),
        };

        let mut frame = response.to_string();
        frame.push('\n');
        if write_half.write_all(frame.as_bytes()).await.is_err() {
            break;
        }
    }
}

/// Dispatch one parsed request to its handler.
pub async fn handle_request(ctx: &WorkerContext, request: &Value) -> Value {
    let msg_type = request["type"].as_str().unwrap_or_default().to_string();
    let request_id = request[WORKER_ID_FIELD]
        .as_str()
        .unwrap_or_default()
        .to_string();

    let Some(command) = get_command_name(&msg_type) else {
        return error_response(
            &msg_type,
            WORKER_ID_FIELD,
            &request_id,
            ErrorCode::InvalidArguments,
            &format!("unknown worker command: {msg_type}"),
        );
    };

    let result = match command {
        "worker_peek" => {
            let last_n = request["lastN"]
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(PEEK_DEFAULT_LAST_N);
            Ok(peek_payload(&ctx.store, last_n))
        }
        "worker_status" => Ok(status_payload(&ctx.store)),
        "worker_details" => details_payload(
            &ctx.store,
            request["itemType"].as_str().unwrap_or_default(),
            request["id"].as_str().unwrap_or_default(),
        ),
        "cdp_call" => handle_cdp_call(ctx, request).await,
        "dom_snapshot" => handle_dom_snapshot(ctx).await,
        other => Err((
            ErrorCode::InvalidArguments,
            format!("unhandled worker command: {other}"),
        )),
    };

    match result {
        Ok(data) => ok_response(&msg_type, WORKER_ID_FIELD, &request_id, data),
        Err((code, message)) => {
            error_response(&msg_type, WORKER_ID_FIELD, &request_id, code, &message)
        }
    }
}

/// Bounded, body-stripped view of the buffers for `worker_peek`.
fn peek_payload(store: &SharedStore, last_n: usize) -> Value {
    let store = store.lock().expect("telemetry store poisoned");
    let snapshot = emit_snapshot(&store, SnapshotMode::Preview, last_n);
    json!({
        "version": snapshot["version"],
        "startTime": snapshot["startTime"],
        "duration": snapshot["duration"],
        "target": snapshot["target"],
        "activeTelemetry": snapshot["activeTelemetry"],
        "network": snapshot["network"],
        "console": snapshot["console"],
    })
}

/// Activity summary for `worker_status`.
fn status_payload(store: &SharedStore) -> Value {
    let store = store.lock().expect("telemetry store poisoned");
    let activity = store.activity();
    json!({
        "startTime": epoch_ms_to_iso(store.start_time_ms),
        "duration": store.duration_ms(),
        "target": store.target,
        "activeTelemetry": store.active_telemetry,
        "activity": {
            "counts": activity.counts,
            "lastAt": activity.last_at,
        },
    })
}

/// One item with bodies for `worker_details`. Network items are addressed
/// by their CDP request id, console items by buffer index.
fn details_payload(
    store: &SharedStore,
    item_type: &str,
    id: &str,
) -> Result<Value, (ErrorCode, String)> {
    let store = store.lock().expect("telemetry store poisoned");
    match item_type {
        "network" => store
            .network
            .iter()
            .find(|r| r.request_id == id)
            .map(|r| json!({"item": r}))
            .ok_or_else(|| {
                (
                    ErrorCode::InvalidArguments,
                    format!("network item not found: {id}"),
                )
            }),
        "console" => id
            .parse::<usize>()
            .ok()
            .and_then(|index| store.console.get(index))
            .map(|m| json!({"item": m}))
            .ok_or_else(|| {
                (
                    ErrorCode::InvalidArguments,
                    format!("console item not found: {id}"),
                )
            }),
        other => Err((
            ErrorCode::InvalidArguments,
            format!("unknown item type: {other}"),
        )),
    }
}

/// Pass-through CDP call.
async fn handle_cdp_call(
    ctx: &WorkerContext,
    request: &Value,
) -> Result<Value, (ErrorCode, String)> {
    let method = request["method"].as_str().unwrap_or_default();
    if method.is_empty() || !method.contains('.') {
        return Err((
            ErrorCode::InvalidArguments,
            format!("not a CDP method: {method:?}"),
        ));
    }
    let params = match request.get("params") {
        None | Some(Value::Null) => None,
        Some(params) => Some(params.clone()),
    };
    ctx.client
        .send_command(method, params)
        .await
        .map(|result| json!({"result": result}))
        .map_err(|e| (e.rpc_code(), e.to_string()))
}

/// On-demand DOM snapshot; the capture is also retained in the store so the
/// final session file carries it.
async fn handle_dom_snapshot(ctx: &WorkerContext) -> Result<Value, (ErrorCode, String)> {
    let snapshot = capture_dom_snapshot(&ctx.client)
        .await
        .map_err(|e| (e.rpc_code(), e.to_string()))?;
    let payload = serde_json::to_value(&snapshot)
        .map_err(|e| (ErrorCode::DaemonError, e.to_string()))?;
    ctx.store.lock().expect("telemetry store poisoned").dom = Some(snapshot);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{
        ConsoleMessage, NetworkRequest, TargetSummary, TelemetryKind, TelemetryStore,
    };

    fn seeded_store() -> SharedStore {
        let store = TelemetryStore::shared(
            vec![TelemetryKind::Network, TelemetryKind::Console],
            TargetSummary {
                url: "http://127.0.0.1:8080/".into(),
                title: "App".into(),
            },
        );
        {
            let mut guard = store.lock().unwrap();
            for i in 0..5 {
                guard.network.push(NetworkRequest {
                    request_id: format!("req-{i}"),
                    url: format!("http://127.0.0.1:8080/api/{i}"),
                    method: "GET".into(),
                    timestamp: 1_700_000_000_000 + i,
                    status: Some(200),
                    mime_type: Some("application/json".into()),
                    request_headers: None,
                    response_headers: None,
                    request_body: None,
                    response_body: Some("{\"n\":1}".into()),
                    navigation_id: 0,
                    failed: false,
                });
            }
            guard.console.push(ConsoleMessage {
                msg_type: "log".into(),
                text: "ready".into(),
                timestamp: 1_700_000_000_100,
                args: Some(vec![json!({"type": "string", "value": "ready"})]),
                navigation_id: 0,
            });
        }
        store
    }

    #[test]
    fn peek_respects_last_n_and_strips_bodies() {
        let store = seeded_store();
        let payload = peek_payload(&store, 2);
        let network = payload["network"].as_array().unwrap();
        assert_eq!(network.len(), 2);
        assert_eq!(network[0]["requestId"], "req-3");
        assert!(network[0].get("responseBody").is_none());
        let console = payload["console"].as_array().unwrap();
        assert_eq!(console.len(), 1);
        assert!(console[0].get("args").is_none());
        assert_eq!(payload["target"]["title"], "App");
    }

    #[test]
    fn status_reports_activity_counts() {
        let store = seeded_store();
        let payload = status_payload(&store);
        assert_eq!(payload["activity"]["counts"]["network"], 5);
        assert_eq!(payload["activity"]["counts"]["console"], 1);
        assert_eq!(payload["activeTelemetry"][0], "network");
        assert!(payload["duration"].as_u64().is_some());
    }

    #[test]
    fn details_finds_network_by_request_id() {
        let store = seeded_store();
        let payload = details_payload(&store, "network", "req-2").unwrap();
        assert_eq!(payload["item"]["requestId"], "req-2");
        // Details serve from the full buffers, bodies included.
        assert_eq!(payload["item"]["responseBody"], "{\"n\":1}");
    }

    #[test]
    fn details_finds_console_by_index() {
        let store = seeded_store();
        let payload = details_payload(&store, "console", "0").unwrap();
        assert_eq!(payload["item"]["text"], "ready");
        assert!(payload["item"]["args"].is_array());
    }

    #[test]
    fn details_rejects_unknown_items() {
        let store = seeded_store();
        assert!(details_payload(&store, "network", "nope").is_err());
        assert!(details_payload(&store, "console", "99").is_err());
        assert!(details_payload(&store, "console", "not-a-number").is_err());
        assert!(details_payload(&store, "widgets", "0").is_err());
    }
}
