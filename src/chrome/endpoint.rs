use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::ChromeError;

/// Wall-clock budget for one round trip against the debug endpoint.
const ROUND_TRIP_BUDGET: Duration = Duration::from_secs(5);

/// Chrome's HTTP debug endpoint on `http://<host>:<port>/json/*`.
///
/// Every exchange is a single short request with `Connection: close`, so
/// the reply is delimited by the server closing the socket. A
/// `Content-Length` header, when present, trims any trailing bytes.
#[derive(Debug, Clone)]
pub struct DebugEndpoint {
    host: String,
    port: u16,
}

/// Subset of `/json/version` this tool consumes.
#[derive(Debug, Deserialize)]
pub struct BrowserVersion {
    /// Browser product string, e.g. "Chrome/131.0.6778.85".
    #[serde(rename = "Browser")]
    pub browser: String,

    /// Browser-level WebSocket debugger URL.
    #[serde(rename = "webSocketDebuggerUrl")]
    pub ws_debugger_url: String,
}

/// One entry of `/json/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetInfo {
    pub id: String,

    #[serde(rename = "type")]
    pub target_type: String,

    pub title: String,

    pub url: String,

    /// Absent for targets something else is already attached to.
    #[serde(rename = "webSocketDebuggerUrl")]
    pub ws_debugger_url: Option<String>,
}

impl TargetInfo {
    /// Whether this target is a debuggable page (tab).
    #[must_use]
    pub fn is_page(&self) -> bool {
        self.target_type == "page" && self.ws_debugger_url.is_some()
    }
}

impl DebugEndpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The endpoint of a Chrome this tool launched (always loopback).
    #[must_use]
    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    /// `GET /json/version`.
    ///
    /// # Errors
    ///
    /// Returns `ChromeError::HttpError` when Chrome is unreachable and
    /// `ChromeError::ParseError` for an undecodable reply.
    pub async fn version(&self) -> Result<BrowserVersion, ChromeError> {
        let body = self.fetch("GET", "/json/version").await?;
        serde_json::from_str(&body).map_err(|e| ChromeError::ParseError(e.to_string()))
    }

    /// `GET /json/list`: every debuggable target.
    ///
    /// # Errors
    ///
    /// Same as [`version`](Self::version).
    pub async fn targets(&self) -> Result<Vec<TargetInfo>, ChromeError> {
        let body = self.fetch("GET", "/json/list").await?;
        serde_json::from_str(&body).map_err(|e| ChromeError::ParseError(e.to_string()))
    }

    /// `PUT /json/new`: open a blank page target. Older Chromes accepted
    /// GET here; everything current wants PUT.
    ///
    /// # Errors
    ///
    /// Same as [`version`](Self::version).
    pub async fn open_page(&self) -> Result<TargetInfo, ChromeError> {
        let body = self.fetch("PUT", "/json/new?about:blank").await?;
        serde_json::from_str(&body).map_err(|e| ChromeError::ParseError(e.to_string()))
    }

    /// One HTTP exchange under the round-trip budget.
    async fn fetch(&self, method: &str, path: &str) -> Result<String, ChromeError> {
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: {}:{}\r\nAccept: application/json\r\nConnection: close\r\n\r\n",
            self.host, self.port
        );

        let exchange = async {
            let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
            stream.write_all(request.as_bytes()).await?;
            let mut raw = Vec::with_capacity(4096);
            stream.read_to_end(&mut raw).await?;
            Ok::<Vec<u8>, std::io::Error>(raw)
        };

        let raw = tokio::time::timeout(ROUND_TRIP_BUDGET, exchange)
            .await
            .map_err(|_| {
                ChromeError::HttpError(format!(
                    "{method} {path} on {}:{} timed out",
                    self.host, self.port
                ))
            })?
            .map_err(|e| {
                ChromeError::HttpError(format!("{method} {path} on {}:{}: {e}", self.host, self.port))
            })?;

        decode_reply(&raw)
    }
}

/// Pull the body out of a raw close-delimited HTTP reply.
fn decode_reply(raw: &[u8]) -> Result<String, ChromeError> {
    let divider = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| ChromeError::ParseError("endpoint reply has no header block".into()))?;

    let head = std::str::from_utf8(&raw[..divider])
        .map_err(|_| ChromeError::ParseError("endpoint reply headers are not UTF-8".into()))?;

    match status_code_of(head) {
        Some(200) => {}
        Some(code) => {
            return Err(ChromeError::HttpError(format!(
                "endpoint returned HTTP {code}"
            )));
        }
        None => {
            return Err(ChromeError::ParseError(
                "endpoint reply has no status line".into(),
            ));
        }
    }

    let mut body = &raw[divider + 4..];
    if let Some(declared) = declared_length(head) {
        if declared <= body.len() {
            body = &body[..declared];
        }
    }

    String::from_utf8(body.to_vec())
        .map_err(|_| ChromeError::ParseError("endpoint reply body is not UTF-8".into()))
}

/// The numeric status of the first header line, if it looks like one.
fn status_code_of(head: &str) -> Option<u16> {
    head.lines().next()?.split_whitespace().nth(1)?.parse().ok()
}

/// The `Content-Length` value, when the endpoint declares one.
fn declared_length(head: &str) -> Option<usize> {
    head.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_reply_deserializes() {
        let body = r#"{
            "Browser": "Chrome/131.0.6778.85",
            "Protocol-Version": "1.3",
            "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/browser/f00"
        }"#;
        let version: BrowserVersion = serde_json::from_str(body).unwrap();
        assert_eq!(version.browser, "Chrome/131.0.6778.85");
        assert!(version.ws_debugger_url.starts_with("ws://"));
    }

    #[test]
    fn target_list_deserializes_and_classifies() {
        let body = r#"[
            {"id": "T1", "type": "page", "title": "App", "url": "http://127.0.0.1:8080/",
             "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/T1"},
            {"id": "SW", "type": "service_worker", "title": "", "url": "http://127.0.0.1:8080/sw.js"},
            {"id": "T2", "type": "page", "title": "Attached elsewhere", "url": "about:blank"}
        ]"#;
        let targets: Vec<TargetInfo> = serde_json::from_str(body).unwrap();
        assert_eq!(targets.len(), 3);
        assert!(targets[0].is_page());
        assert!(!targets[1].is_page(), "service workers are not pages");
        assert!(!targets[2].is_page(), "no debugger URL means not attachable");
    }

    #[test]
    fn decode_reply_extracts_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"ok\":1}";
        assert_eq!(decode_reply(raw).unwrap(), "{\"ok\":1}");
    }

    #[test]
    fn decode_reply_trims_to_declared_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\n{\"a\":1}junk-after-body";
        assert_eq!(decode_reply(raw).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn decode_reply_tolerates_overlong_declared_length() {
        // A short read still yields what actually arrived.
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 9999\r\n\r\n{\"a\":1}";
        assert_eq!(decode_reply(raw).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn decode_reply_rejects_error_statuses() {
        let raw = b"HTTP/1.1 500 Internal Server Error\r\n\r\nboom";
        let err = decode_reply(raw).unwrap_err();
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[test]
    fn decode_reply_requires_a_header_block() {
        assert!(decode_reply(b"HTTP/1.1 200 OK\r\nno divider yet").is_err());
        assert!(decode_reply(b"").is_err());
    }

    #[test]
    fn status_line_parsing() {
        assert_eq!(status_code_of("HTTP/1.1 200 OK"), Some(200));
        assert_eq!(status_code_of("HTTP/1.1 404 Not Found"), Some(404));
        assert_eq!(status_code_of("garbage"), None);
        assert_eq!(status_code_of(""), None);
    }

    #[test]
    fn content_length_header_is_case_insensitive() {
        let head = "HTTP/1.1 200 OK\r\ncontent-LENGTH: 42\r\nX-Other: 1";
        assert_eq!(declared_length(head), Some(42));
        assert_eq!(declared_length("HTTP/1.1 200 OK\r\nX-Other: 1"), None);
    }

    #[tokio::test]
    async fn fetch_round_trips_against_a_scripted_server() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 1024];
            let n = stream.read(&mut request).await.unwrap();
            let request = String::from_utf8_lossy(&request[..n]).into_owned();
            assert!(request.starts_with("GET /json/version HTTP/1.1\r\n"));
            assert!(request.contains("Connection: close"));

            let body = r#"{"Browser": "Chrome/131.0.0.0", "webSocketDebuggerUrl": "ws://127.0.0.1:1/devtools/browser/x"}"#;
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(reply.as_bytes()).await.unwrap();
            // Dropping the stream closes the connection, delimiting the reply.
        });

        let version = DebugEndpoint::localhost(port).version().await.unwrap();
        assert_eq!(version.browser, "Chrome/131.0.0.0");
    }

    #[tokio::test]
    async fn fetch_reports_unreachable_endpoints() {
        // Bind and drop to obtain a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = DebugEndpoint::localhost(port).version().await.unwrap_err();
        assert!(matches!(err, ChromeError::HttpError(_)));
    }
}
