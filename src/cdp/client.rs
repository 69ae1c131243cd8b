use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

use super::error::CdpError;
use super::transport::{
    KeepaliveConfig, ReconnectConfig, TransportCommand, TransportHandle, spawn_transport,
};
use super::types::CdpEvent;

/// Configuration for a CDP client connection.
#[derive(Debug, Clone)]
pub struct CdpConfig {
    /// Timeout for the initial WebSocket connection (default: 10s).
    pub connect_timeout: Duration,
    /// Timeout for individual CDP commands (default: 30s).
    pub command_timeout: Duration,
    /// Capacity of the internal command channel (default: 256).
    pub channel_capacity: usize,
    /// Reconnection settings.
    pub reconnect: ReconnectConfig,
    /// Keepalive settings.
    pub keepalive: KeepaliveConfig,
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            channel_capacity: 256,
            reconnect: ReconnectConfig::default(),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

/// A CDP client connected to one page target over WebSocket.
///
/// Entry point for sending CDP commands and subscribing to events. It talks
/// to a background transport task that owns the WebSocket connection.
#[derive(Debug)]
pub struct CdpClient {
    handle: TransportHandle,
    config: CdpConfig,
    url: String,
}

impl CdpClient {
    /// Connect to a Chrome CDP WebSocket endpoint.
    ///
    /// `disconnect_tx`, when provided, receives one notice on the first
    /// connection loss; the worker treats that as a shutdown trigger.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Connection` if the WebSocket handshake fails, or
    /// `CdpError::ConnectionTimeout` if the attempt exceeds the configured
    /// timeout.
    pub async fn connect(
        url: &str,
        config: CdpConfig,
        disconnect_tx: Option<mpsc::Sender<()>>,
    ) -> Result<Self, CdpError> {
        let handle = spawn_transport(
            url,
            config.channel_capacity,
            config.reconnect.clone(),
            config.keepalive.clone(),
            config.connect_timeout,
            disconnect_tx,
        )
        .await?;

        Ok(Self {
            handle,
            config,
            url: url.to_owned(),
        })
    }

    /// Send a CDP command and await its response.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::CommandTimeout` if Chrome does not respond within
    /// the configured timeout, `CdpError::Protocol` if Chrome returns an
    /// error envelope, `CdpError::Closed` if the connection closed before
    /// the response, or `CdpError::NotOpen` if it was not open to begin
    /// with.
    pub async fn send_command(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CdpError> {
        self.send_command_with_timeout(method, params, self.config.command_timeout)
            .await
    }

    /// Send a CDP command with an explicit per-call timeout.
    ///
    /// # Errors
    ///
    /// Same as [`send_command`](Self::send_command).
    pub async fn send_command_with_timeout(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, CdpError> {
        let id = self.handle.next_message_id();
        let command = super::types::CdpCommand {
            id,
            method: method.to_owned(),
            params,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;

        self.handle
            .send(TransportCommand::Dispatch {
                command,
                reply_tx,
                deadline,
            })
            .await?;

        reply_rx
            .await
            .map_err(|_| CdpError::Internal("transport task exited before responding".into()))?
    }

    /// Subscribe to CDP events matching a method name.
    ///
    /// Returns a receiver yielding `CdpEvent` values. Dropping the receiver
    /// unsubscribes.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Internal` if the transport task has exited.
    pub async fn subscribe(&self, method: &str) -> Result<mpsc::Receiver<CdpEvent>, CdpError> {
        let (event_tx, event_rx) = mpsc::channel(self.config.channel_capacity);
        self.handle
            .send(TransportCommand::Subscribe {
                method: method.to_owned(),
                event_tx,
            })
            .await?;
        Ok(event_rx)
    }

    /// Gracefully close the WebSocket connection. Idempotent: pending sends
    /// fail with `CdpError::Closed`.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Internal` if the transport task has already
    /// exited (in which case there is nothing left to close).
    pub async fn close(&self) -> Result<(), CdpError> {
        self.handle.send(TransportCommand::Shutdown).await
    }

    /// Check if the client is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Get the WebSocket URL this client is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}
