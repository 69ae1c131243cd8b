//! Integration tests for the daemon's socket, router, and single-instance
//! startup, driven through a real unix socket in a private `BDG_HOME`-style
//! root.
//!
//! Worker-spawning paths are exercised only up to their validation steps:
//! spawning a real worker subprocess is out of reach for an in-process
//! test harness.

use std::time::Duration;

use bdg::daemon::{DaemonClient, run_daemon};
use bdg::error::ExitCode;
use bdg::paths::BdgPaths;
use serde_json::{Value, json};

/// Spawn the daemon over a fresh root and wait until it answers.
async fn start_daemon(paths: &BdgPaths) -> tokio::task::JoinHandle<()> {
    let daemon_paths = paths.clone();
    let handle = tokio::spawn(async move {
        if let Err(e) = run_daemon(daemon_paths).await {
            panic!("daemon exited with error: {e}");
        }
    });

    let client = DaemonClient::new(paths.clone());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if client.is_running().await {
            return handle;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("daemon did not start answering");
}

#[tokio::test]
async fn cold_start_status_reports_inactive() {
    let dir = tempfile::tempdir().unwrap();
    let paths = BdgPaths::at(dir.path());
    let daemon = start_daemon(&paths).await;
    let client = DaemonClient::new(paths.clone());

    let handshake = client
        .request("handshake_request", Value::Null, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(handshake["pid"].as_u64().unwrap() > 0);
    assert_eq!(handshake["version"], env!("CARGO_PKG_VERSION"));

    let status = client
        .request("status_request", Value::Null, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(status["active"], false);
    assert_eq!(status["status"], "ok");

    // The daemon wrote its pid file during startup.
    assert!(paths.daemon_pid().exists());
    assert!(paths.daemon_sock().exists());

    daemon.abort();
}

#[tokio::test]
async fn queries_without_a_session_report_no_session() {
    let dir = tempfile::tempdir().unwrap();
    let paths = BdgPaths::at(dir.path());
    let daemon = start_daemon(&paths).await;
    let client = DaemonClient::new(paths.clone());

    for request_type in ["peek_request", "stop_session_request", "worker_details_request"] {
        let err = client
            .request(request_type, Value::Null, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(
            err.code,
            ExitCode::NotFound,
            "{request_type} should map NoSession to 83"
        );
    }

    daemon.abort();
}

#[tokio::test]
async fn unknown_request_types_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let paths = BdgPaths::at(dir.path());
    let daemon = start_daemon(&paths).await;
    let client = DaemonClient::new(paths.clone());

    let err = client
        .request("frobnicate_request", Value::Null, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert_eq!(err.code, ExitCode::InvalidArguments);

    daemon.abort();
}

#[tokio::test]
async fn start_session_validates_before_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let paths = BdgPaths::at(dir.path());
    let daemon = start_daemon(&paths).await;
    let client = DaemonClient::new(paths.clone());

    // Missing URL
    let err = client
        .request("start_session_request", json!({}), Duration::from_secs(2))
        .await
        .unwrap_err();
    assert_eq!(err.code, ExitCode::InvalidArguments);

    // Malformed URL
    let err = client
        .request(
            "start_session_request",
            json!({"url": "not a url"}),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ExitCode::InvalidUrl);

    // Unknown telemetry kind
    let err = client
        .request(
            "start_session_request",
            json!({"url": "http://127.0.0.1:8080/", "telemetry": ["metrics"]}),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ExitCode::InvalidArguments);

    daemon.abort();
}

#[tokio::test]
async fn second_daemon_is_rejected_while_first_is_alive() {
    let dir = tempfile::tempdir().unwrap();
    let paths = BdgPaths::at(dir.path());
    std::fs::create_dir_all(paths.root()).unwrap();
    // A live foreign daemon, simulated through its pid file. PID 1 is
    // always alive.
    std::fs::write(paths.daemon_pid(), "1").unwrap();

    let err = run_daemon(paths).await.unwrap_err();
    assert_eq!(err.code, ExitCode::DaemonAlreadyRunning);
    assert!(err.message.contains("pid 1"));
}

#[tokio::test]
async fn startup_reaps_stale_session_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let paths = BdgPaths::at(dir.path());
    std::fs::create_dir_all(paths.root()).unwrap();
    std::fs::write(paths.session_pid(), "999999999").unwrap();
    std::fs::write(paths.session_meta(), "{}").unwrap();
    std::fs::write(paths.session_preview(), "{}").unwrap();
    std::fs::write(paths.session_lock(), "999999999").unwrap();

    let daemon = start_daemon(&paths).await;

    assert!(!paths.session_pid().exists());
    assert!(!paths.session_meta().exists());
    assert!(!paths.session_preview().exists());
    assert!(!paths.session_lock().exists());

    daemon.abort();
}

#[tokio::test]
async fn one_connection_carries_one_request() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let dir = tempfile::tempdir().unwrap();
    let paths = BdgPaths::at(dir.path());
    let daemon = start_daemon(&paths).await;

    // Raw socket: send a request, read the one response, observe EOF.
    let stream = tokio::net::UnixStream::connect(paths.daemon_sock())
        .await
        .unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half
        .write_all(b"{\"type\":\"handshake_request\",\"sessionId\":\"raw-1\"}\n")
        .await
        .unwrap();

    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let response: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["type"], "handshake_response");
    assert_eq!(response["sessionId"], "raw-1");
    assert_eq!(response["status"], "ok");

    // The daemon closes after its single response.
    let eof = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .unwrap()
        .unwrap();
    assert!(eof.is_none());

    daemon.abort();
}
