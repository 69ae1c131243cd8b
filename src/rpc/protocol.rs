use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AppError, ErrorCode, ExitCode};

/// Correlation-id field on the client↔daemon leg.
pub const CLIENT_ID_FIELD: &str = "sessionId";

/// Correlation-id field on the daemon↔worker leg.
pub const WORKER_ID_FIELD: &str = "requestId";

/// Errors on the JSONL RPC legs.
#[derive(Debug)]
pub enum RpcError {
    /// Could not connect to or use the socket.
    Connection(String),
    /// The peer did not answer within the deadline.
    Timeout {
        /// The request name (e.g. `status_request`).
        request: String,
        /// Elapsed time when the deadline fired.
        elapsed_ms: u64,
    },
    /// A frame was not valid JSON.
    Parse(String),
    /// The peer closed the stream before a full response line arrived.
    EarlyClose,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "IPC connection error: {msg}"),
            Self::Timeout {
                request,
                elapsed_ms,
            } => write!(f, "IPC timeout: {request} after {elapsed_ms}ms"),
            Self::Parse(msg) => write!(f, "IPC parse error: {msg}"),
            Self::EarlyClose => write!(f, "IPC connection closed before response"),
        }
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// The RPC error code this failure maps to.
    #[must_use]
    pub fn rpc_code(&self) -> ErrorCode {
        match self {
            Self::Connection(_) => ErrorCode::IPCConnection,
            Self::Timeout { .. } => ErrorCode::IPCTimeout,
            Self::Parse(_) => ErrorCode::IPCParse,
            Self::EarlyClose => ErrorCode::IPCEarlyClose,
        }
    }
}

impl From<RpcError> for AppError {
    fn from(e: RpcError) -> Self {
        let code = match &e {
            RpcError::Timeout { .. } => ExitCode::CdpTimeout,
            _ => ExitCode::CdpConnection,
        };
        Self::new(e.to_string(), code)
    }
}

// ---------------------------------------------------------------------------
// Line framing
// ---------------------------------------------------------------------------

/// Accumulates stream chunks and yields complete newline-terminated lines.
/// Partial lines remain buffered until the next chunk; blank lines are
/// skipped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the complete, trimmed, non-empty lines it
    /// released.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Bytes currently buffered without a terminating newline.
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buf
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// The response type for a request type: `_request` → `_response`.
#[must_use]
pub fn response_type_for(request_type: &str) -> String {
    request_type.strip_suffix("_request").map_or_else(
        || format!("{request_type}_response"),
        |prefix| format!("{prefix}_response"),
    )
}

/// Build a request envelope: `{type, <id_field>: id, ...extra}`.
///
/// `extra` must be a JSON object (or Null for none).
#[must_use]
pub fn make_request(msg_type: &str, id_field: &str, id: &str, extra: Value) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("type".into(), Value::String(msg_type.into()));
    obj.insert(id_field.into(), Value::String(id.into()));
    if let Value::Object(map) = extra {
        for (k, v) in map {
            obj.insert(k, v);
        }
    }
    Value::Object(obj)
}

/// Build a success response for `request_type`, echoing the correlation id
/// and merging `data`'s fields into the envelope.
#[must_use]
pub fn ok_response(request_type: &str, id_field: &str, id: &str, data: Value) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert(
        "type".into(),
        Value::String(response_type_for(request_type)),
    );
    obj.insert(id_field.into(), Value::String(id.into()));
    obj.insert("status".into(), Value::String("ok".into()));
    if let Value::Object(map) = data {
        for (k, v) in map {
            obj.insert(k, v);
        }
    }
    Value::Object(obj)
}

/// Build an error response for `request_type`.
#[must_use]
pub fn error_response(
    request_type: &str,
    id_field: &str,
    id: &str,
    code: ErrorCode,
    message: &str,
) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert(
        "type".into(),
        Value::String(response_type_for(request_type)),
    );
    obj.insert(id_field.into(), Value::String(id.into()));
    obj.insert("status".into(), Value::String("error".into()));
    obj.insert(
        "errorCode".into(),
        serde_json::to_value(code).unwrap_or(Value::Null),
    );
    obj.insert("message".into(), Value::String(message.into()));
    Value::Object(obj)
}

// ---------------------------------------------------------------------------
// Stream helpers
// ---------------------------------------------------------------------------

/// Write one JSONL frame.
///
/// # Errors
///
/// Returns `RpcError::Connection` on write failure.
pub async fn write_frame<W>(writer: &mut W, value: &Value) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = value.to_string();
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| RpcError::Connection(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| RpcError::Connection(e.to_string()))
}

/// Read one JSONL frame with a deadline. `request_name` labels timeout
/// errors.
///
/// # Errors
///
/// Returns `RpcError::Timeout` on deadline expiry, `RpcError::EarlyClose`
/// on EOF before a full line, `RpcError::Parse` on malformed JSON.
pub async fn read_frame<R>(
    reader: &mut R,
    deadline: Duration,
    request_name: &str,
) -> Result<Value, RpcError>
where
    R: AsyncBufReadExt + Unpin,
{
    let started = tokio::time::Instant::now();
    let mut line = String::new();
    let n = tokio::time::timeout(deadline, reader.read_line(&mut line))
        .await
        .map_err(|_| RpcError::Timeout {
            request: request_name.to_string(),
            elapsed_ms: started.elapsed().as_millis().try_into().unwrap_or(u64::MAX),
        })?
        .map_err(|e| RpcError::Connection(e.to_string()))?;
    if n == 0 {
        return Err(RpcError::EarlyClose);
    }
    serde_json::from_str(line.trim()).map_err(|e| RpcError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn line_buffer_splits_complete_lines() {
        let mut buf = LineBuffer::new();
        let lines = buf.push("{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn line_buffer_holds_partial_lines() {
        let mut buf = LineBuffer::new();
        assert!(buf.push("{\"a\":").is_empty());
        assert_eq!(buf.pending(), "{\"a\":");
        let lines = buf.push("1}\n");
        assert_eq!(lines, vec!["{\"a\":1}"]);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn line_buffer_skips_blank_lines() {
        let mut buf = LineBuffer::new();
        let lines = buf.push("\n  \n{\"a\":1}\n\n");
        assert_eq!(lines, vec!["{\"a\":1}"]);
    }

    #[test]
    fn line_buffer_trims_carriage_returns() {
        let mut buf = LineBuffer::new();
        let lines = buf.push("{\"a\":1}\r\n");
        assert_eq!(lines, vec!["{\"a\":1}"]);
    }

    #[test]
    fn response_type_swaps_suffix() {
        assert_eq!(response_type_for("status_request"), "status_response");
        assert_eq!(
            response_type_for("start_session_request"),
            "start_session_response"
        );
    }

    #[test]
    fn make_request_merges_extra() {
        let req = make_request(
            "peek_request",
            CLIENT_ID_FIELD,
            "abc",
            json!({"lastN": 10}),
        );
        assert_eq!(req["type"], "peek_request");
        assert_eq!(req["sessionId"], "abc");
        assert_eq!(req["lastN"], 10);
    }

    #[test]
    fn ok_response_echoes_id_and_merges_data() {
        let resp = ok_response(
            "status_request",
            CLIENT_ID_FIELD,
            "abc",
            json!({"active": false}),
        );
        assert_eq!(resp["type"], "status_response");
        assert_eq!(resp["sessionId"], "abc");
        assert_eq!(resp["status"], "ok");
        assert_eq!(resp["active"], false);
    }

    #[test]
    fn error_response_carries_taxonomy() {
        let resp = error_response(
            "peek_request",
            WORKER_ID_FIELD,
            "r-1",
            ErrorCode::NoSession,
            "no active session",
        );
        assert_eq!(resp["type"], "peek_response");
        assert_eq!(resp["requestId"], "r-1");
        assert_eq!(resp["status"], "error");
        assert_eq!(resp["errorCode"], "NoSession");
        assert_eq!(resp["message"], "no active session");
    }

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let mut reader = tokio::io::BufReader::new(server_read);
        let (_client_read, mut client_write) = tokio::io::split(client);

        let frame = json!({"type": "handshake_request", "sessionId": "s1"});
        write_frame(&mut client_write, &frame).await.unwrap();

        let read = read_frame(&mut reader, Duration::from_secs(1), "handshake_request")
            .await
            .unwrap();
        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn read_frame_times_out() {
        let (_client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let mut reader = tokio::io::BufReader::new(server_read);

        let err = read_frame(&mut reader, Duration::from_millis(50), "status_request")
            .await
            .unwrap_err();
        match err {
            RpcError::Timeout { request, .. } => assert_eq!(request, "status_request"),
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn read_frame_reports_early_close() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let mut reader = tokio::io::BufReader::new(server_read);
        drop(client);

        let err = read_frame(&mut reader, Duration::from_secs(1), "status_request")
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::EarlyClose));
    }

    #[tokio::test]
    async fn read_frame_reports_parse_error() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let mut reader = tokio::io::BufReader::new(server_read);
        let (_client_read, mut client_write) = tokio::io::split(client);

        client_write.write_all(b"not json\n").await.unwrap();
        let err = read_frame(&mut reader, Duration::from_secs(1), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Parse(_)));
    }
}
