//! Integration tests for the worker's RPC loop: a real unix socket, JSONL
//! framing, and a mock CDP backend behind the worker context.

use std::sync::Arc;
use std::time::Duration;

use bdg::cdp::{CdpClient, CdpConfig, KeepaliveConfig, ReconnectConfig};
use bdg::telemetry::{NetworkRequest, TargetSummary, TelemetryKind, TelemetryStore};
use bdg::worker::{WorkerContext, handle_request};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

/// Mock CDP server answering every command with a canned result.
async fn start_mock_cdp() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut sink, mut source) = ws.split();
                while let Some(Ok(Message::Text(text))) = source.next().await {
                    let cmd: Value = serde_json::from_str(&text).unwrap();
                    let result = match cmd["method"].as_str() {
                        Some("Browser.getVersion") => json!({"product": "MockChrome/1.0"}),
                        Some("DOM.getDocument") => json!({"root": {"nodeId": 1}}),
                        Some("DOM.getOuterHTML") => {
                            json!({"outerHTML": "<html><body>hi</body></html>"})
                        }
                        Some("Runtime.evaluate") => {
                            let expr = cmd["params"]["expression"].as_str().unwrap_or("");
                            if expr == "document.title" {
                                json!({"result": {"value": "Mock Page"}})
                            } else if expr == "window.location.href" {
                                json!({"result": {"value": "http://127.0.0.1:8080/"}})
                            } else {
                                json!({"result": {}})
                            }
                        }
                        _ => json!({}),
                    };
                    let response = json!({"id": cmd["id"], "result": result});
                    sink.send(Message::Text(response.to_string().into()))
                        .await
                        .unwrap();
                }
            });
        }
    });
    addr
}

async fn test_context() -> WorkerContext {
    let addr = start_mock_cdp().await;
    let config = CdpConfig {
        reconnect: ReconnectConfig {
            max_retries: 0,
            ..ReconnectConfig::default()
        },
        keepalive: KeepaliveConfig::default(),
        ..CdpConfig::default()
    };
    let client = Arc::new(
        CdpClient::connect(&format!("ws://{addr}"), config, None)
            .await
            .unwrap(),
    );
    let store = TelemetryStore::shared(
        vec![TelemetryKind::Network, TelemetryKind::Console],
        TargetSummary {
            url: "http://127.0.0.1:8080/".into(),
            title: "Mock Page".into(),
        },
    );
    WorkerContext { store, client }
}

fn seed_network(ctx: &WorkerContext, count: usize) {
    let mut store = ctx.store.lock().unwrap();
    for i in 0..count {
        store.network.push(NetworkRequest {
            request_id: format!("req-{i}"),
            url: format!("http://127.0.0.1:8080/api/{i}"),
            method: "GET".into(),
            timestamp: 1_700_000_000_000 + i as u64,
            status: Some(200),
            mime_type: Some("application/json".into()),
            request_headers: None,
            response_headers: None,
            request_body: None,
            response_body: Some(format!("{{\"i\":{i}}}")),
            navigation_id: 0,
            failed: false,
        });
    }
}

#[tokio::test]
async fn peek_bounds_results_and_strips_bodies() {
    let ctx = test_context().await;
    seed_network(&ctx, 500);

    let request = json!({
        "type": "worker_peek_request",
        "requestId": "r-1",
        "lastN": 50,
    });
    let response = handle_request(&ctx, &request).await;

    assert_eq!(response["type"], "worker_peek_response");
    assert_eq!(response["requestId"], "r-1");
    assert_eq!(response["status"], "ok");
    let network = response["network"].as_array().unwrap();
    assert_eq!(network.len(), 50);
    for item in network {
        assert!(item.get("responseBody").is_none(), "peek must strip bodies");
    }
}

#[tokio::test]
async fn status_counts_reflect_buffers() {
    let ctx = test_context().await;
    seed_network(&ctx, 3);

    let request = json!({"type": "worker_status_request", "requestId": "r-2"});
    let response = handle_request(&ctx, &request).await;

    assert_eq!(response["status"], "ok");
    assert_eq!(response["activity"]["counts"]["network"], 3);
    assert_eq!(response["target"]["title"], "Mock Page");
}

#[tokio::test]
async fn details_returns_full_item() {
    let ctx = test_context().await;
    seed_network(&ctx, 3);

    let request = json!({
        "type": "worker_details_request",
        "requestId": "r-3",
        "itemType": "network",
        "id": "req-1",
    });
    let response = handle_request(&ctx, &request).await;

    assert_eq!(response["status"], "ok");
    assert_eq!(response["item"]["requestId"], "req-1");
    assert_eq!(response["item"]["responseBody"], "{\"i\":1}");
}

#[tokio::test]
async fn cdp_call_passes_through() {
    let ctx = test_context().await;

    let request = json!({
        "type": "cdp_call_request",
        "requestId": "r-4",
        "method": "Browser.getVersion",
    });
    let response = handle_request(&ctx, &request).await;

    assert_eq!(response["status"], "ok");
    assert_eq!(response["result"]["product"], "MockChrome/1.0");
}

#[tokio::test]
async fn cdp_call_rejects_non_methods() {
    let ctx = test_context().await;

    let request = json!({
        "type": "cdp_call_request",
        "requestId": "r-5",
        "method": "notamethod",
    });
    let response = handle_request(&ctx, &request).await;

    assert_eq!(response["status"], "error");
    assert_eq!(response["errorCode"], "InvalidArguments");
}

#[tokio::test]
async fn dom_snapshot_captures_and_retains() {
    let ctx = test_context().await;

    let request = json!({"type": "dom_snapshot_request", "requestId": "r-6"});
    let response = handle_request(&ctx, &request).await;

    assert_eq!(response["status"], "ok");
    assert_eq!(response["title"], "Mock Page");
    assert_eq!(response["outerHTML"], "<html><body>hi</body></html>");

    // The capture is retained for the final session file.
    let store = ctx.store.lock().unwrap();
    assert_eq!(store.dom.as_ref().unwrap().title, "Mock Page");
}

#[tokio::test]
async fn unknown_commands_are_rejected() {
    let ctx = test_context().await;

    let request = json!({"type": "launch_rockets_request", "requestId": "r-7"});
    let response = handle_request(&ctx, &request).await;

    assert_eq!(response["status"], "error");
    assert_eq!(response["errorCode"], "InvalidArguments");
    assert_eq!(response["requestId"], "r-7");
}

#[tokio::test]
async fn rpc_loop_answers_over_a_real_socket() {
    let ctx = test_context().await;
    seed_network(&ctx, 2);

    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("worker.test.sock");
    let listener = tokio::net::UnixListener::bind(&sock).unwrap();
    tokio::spawn({
        let ctx = ctx.clone();
        async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(bdg::worker::handle_connection(stream, ctx.clone()));
            }
        }
    });

    let stream = tokio::net::UnixStream::connect(&sock).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Two requests down one connection, answered in order.
    for (id, last_n) in [("a", 1), ("b", 2)] {
        let request =
            json!({"type": "worker_peek_request", "requestId": id, "lastN": last_n});
        let mut frame = request.to_string();
        frame.push('\n');
        write_half.write_all(frame.as_bytes()).await.unwrap();
    }

    let first: Value = serde_json::from_str(
        &tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(first["requestId"], "a");
    assert_eq!(first["network"].as_array().unwrap().len(), 1);

    let second: Value = serde_json::from_str(
        &tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(second["requestId"], "b");
    assert_eq!(second["network"].as_array().unwrap().len(), 2);
}
