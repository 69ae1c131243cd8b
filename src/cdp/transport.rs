use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::error::CdpError;
use super::types::{CdpCommand, CdpEvent, MessageKind, RawCdpMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Command sent from the client handle to the transport task.
pub enum TransportCommand {
    /// Write a CDP command and deliver its response via the oneshot.
    Dispatch {
        command: CdpCommand,
        reply_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
        deadline: Instant,
    },
    /// Register an event receiver for a method name.
    Subscribe {
        method: String,
        event_tx: mpsc::Sender<CdpEvent>,
    },
    /// Shut the transport down gracefully.
    Shutdown,
}

/// A dispatched command still waiting for its correlated response.
struct AwaitingReply {
    reply_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
    method: String,
    deadline: Instant,
}

/// Reconnection configuration. `max_retries == 0` disables reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts.
    pub max_retries: u32,
    /// Initial backoff delay.
    pub initial_backoff: Duration,
    /// Maximum backoff delay.
    pub max_backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Keepalive configuration.
///
/// While open, the transport pings Chrome every `interval`; after
/// `max_missed` consecutive pings without a pong the connection is declared
/// dead.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    pub interval: Duration,
    pub max_missed: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            max_missed: 2,
        }
    }
}

/// Clonable handle for talking to the transport task.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    command_tx: mpsc::Sender<TransportCommand>,
    connected: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl TransportHandle {
    /// Hand a command to the background task.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Internal` if the transport task has exited.
    pub async fn send(&self, cmd: TransportCommand) -> Result<(), CdpError> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| CdpError::Internal("transport task is not running".into()))
    }

    /// Whether the transport currently believes the socket is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// The next unique message ID on this connection.
    pub fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Connect and spawn the transport task, returning its handle.
///
/// `disconnect_tx`, when provided, receives exactly one notice on the first
/// connection loss, whether or not reconnection later succeeds.
///
/// # Errors
///
/// Returns `CdpError::Connection` or `CdpError::ConnectionTimeout` if the
/// initial WebSocket connection cannot be established.
pub async fn spawn_transport(
    url: &str,
    channel_capacity: usize,
    reconnect_config: ReconnectConfig,
    keepalive_config: KeepaliveConfig,
    connect_timeout: Duration,
    disconnect_tx: Option<mpsc::Sender<()>>,
) -> Result<TransportHandle, CdpError> {
    let socket = open_ws(url, connect_timeout).await?;
    let (command_tx, command_rx) = mpsc::channel(channel_capacity);

    let handle = TransportHandle {
        command_tx,
        connected: Arc::new(AtomicBool::new(true)),
        next_id: Arc::new(AtomicU64::new(1)),
    };

    // The ping timer's first tick fires immediately; skipping it here means
    // the first ping goes out one full interval after connect.
    let mut keepalive = tokio::time::interval(keepalive_config.interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.reset();

    let mut task = TransportTask {
        socket,
        command_rx,
        awaiting: HashMap::new(),
        subscribers: HashMap::new(),
        connected: Arc::clone(&handle.connected),
        url: url.to_owned(),
        reconnect_config,
        keepalive_config,
        keepalive,
        missed_pongs: 0,
        connect_timeout,
        gave_up: None,
        disconnect_tx,
    };
    tokio::spawn(async move { task.run().await });

    Ok(handle)
}

/// One WebSocket dial attempt under a timeout.
async fn open_ws(url: &str, timeout: Duration) -> Result<WsStream, CdpError> {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((socket, _handshake))) => Ok(socket),
        Ok(Err(e)) => Err(CdpError::Connection(e.to_string())),
        Err(_) => Err(CdpError::ConnectionTimeout),
    }
}

/// The background task that owns the WebSocket.
struct TransportTask {
    socket: WsStream,
    command_rx: mpsc::Receiver<TransportCommand>,
    awaiting: HashMap<u64, AwaitingReply>,
    subscribers: HashMap<String, Vec<mpsc::Sender<CdpEvent>>>,
    connected: Arc<AtomicBool>,
    url: String,
    reconnect_config: ReconnectConfig,
    keepalive_config: KeepaliveConfig,
    keepalive: tokio::time::Interval,
    missed_pongs: u32,
    connect_timeout: Duration,
    /// Set once reconnection is exhausted: `(attempts, last error)`.
    gave_up: Option<(u32, String)>,
    disconnect_tx: Option<mpsc::Sender<()>>,
}

impl TransportTask {
    async fn run(&mut self) {
        loop {
            // Past the point of no return, the task only drains commands:
            // every dispatch is answered with ReconnectFailed until the
            // owner shuts the transport down.
            if let Some((attempts, ref last_error)) = self.gave_up {
                match self.command_rx.recv().await {
                    Some(TransportCommand::Dispatch { reply_tx, .. }) => {
                        let _ = reply_tx.send(Err(CdpError::ReconnectFailed {
                            attempts,
                            last_error: last_error.clone(),
                        }));
                    }
                    Some(TransportCommand::Subscribe { .. }) => {}
                    Some(TransportCommand::Shutdown) | None => return,
                }
                continue;
            }

            let wake_at = self.nearest_deadline();
            let deadline_sleep = async {
                match wake_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                inbound = self.socket.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => self.on_frame(&text),
                        Some(Ok(Message::Pong(_))) => self.missed_pongs = 0,
                        Some(Ok(Message::Close(_)) | Err(_)) | None => {
                            self.on_connection_lost().await;
                        }
                        Some(Ok(_)) => {
                            // Binary, Ping, raw frames: nothing to do.
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(TransportCommand::Dispatch { command, reply_tx, deadline }) => {
                            self.dispatch(command, reply_tx, deadline).await;
                        }
                        Some(TransportCommand::Subscribe { method, event_tx }) => {
                            self.subscribers.entry(method).or_default().push(event_tx);
                        }
                        Some(TransportCommand::Shutdown) | None => {
                            self.abort_awaiting(|| CdpError::Closed);
                            let _ = self.socket.close(None).await;
                            self.connected.store(false, Ordering::Relaxed);
                            return;
                        }
                    }
                }

                _ = self.keepalive.tick() => {
                    self.on_keepalive_tick().await;
                }

                () = deadline_sleep => {
                    self.expire_overdue();
                }
            }
        }
    }

    /// Ping on schedule; two unanswered pings mean the peer is gone.
    async fn on_keepalive_tick(&mut self) {
        if self.missed_pongs >= self.keepalive_config.max_missed {
            tracing::warn!(
                "keepalive: {} consecutive pongs missed, declaring connection dead",
                self.missed_pongs
            );
            self.on_connection_lost().await;
            return;
        }
        self.missed_pongs += 1;
        if self
            .socket
            .send(Message::Ping(Vec::new().into()))
            .await
            .is_err()
        {
            self.on_connection_lost().await;
        }
    }

    /// Classify an inbound text frame and route it. Frames that are neither
    /// a response nor an event are logged and dropped.
    fn on_frame(&mut self, text: &str) {
        let parsed: RawCdpMessage = match serde_json::from_str(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!("ignoring malformed CDP frame: {e}");
                return;
            }
        };

        match parsed.classify() {
            Some(MessageKind::Response(response)) => {
                let Some(waiter) = self.awaiting.remove(&response.id) else {
                    return; // already expired; the caller got a timeout
                };
                let outcome = response.result.map_err(|proto| CdpError::Protocol {
                    code: proto.code,
                    message: proto.message,
                });
                let _ = waiter.reply_tx.send(outcome);
            }
            Some(MessageKind::Event(event)) => self.fan_out(&event),
            None => tracing::debug!("ignoring unclassifiable CDP frame"),
        }
    }

    /// Hand the event to every subscriber of its method, in registration
    /// order. A full or vanished subscriber never blocks later ones.
    fn fan_out(&mut self, event: &CdpEvent) {
        let Some(senders) = self.subscribers.get_mut(&event.method) else {
            return;
        };
        senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("subscriber for {} is full, dropping event", event.method);
                true
            }
            // Receiver dropped: unsubscribe.
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if senders.is_empty() {
            self.subscribers.remove(&event.method);
        }
    }

    /// Write a command frame and record the waiter. Failures are reported
    /// straight back through the oneshot, never deferred.
    async fn dispatch(
        &mut self,
        command: CdpCommand,
        reply_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
        deadline: Instant,
    ) {
        if !self.connected.load(Ordering::Relaxed) {
            let _ = reply_tx.send(Err(CdpError::NotOpen));
            return;
        }

        let frame = match serde_json::to_string(&command) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = reply_tx.send(Err(CdpError::Internal(format!("serialization error: {e}"))));
                return;
            }
        };

        if let Err(e) = self.socket.send(Message::Text(frame.into())).await {
            let _ = reply_tx.send(Err(CdpError::Connection(format!(
                "WebSocket write error: {e}"
            ))));
            return;
        }

        self.awaiting.insert(
            command.id,
            AwaitingReply {
                reply_tx,
                method: command.method,
                deadline,
            },
        );
    }

    /// The soonest moment any waiter times out.
    fn nearest_deadline(&self) -> Option<Instant> {
        self.awaiting.values().map(|w| w.deadline).min()
    }

    /// Fail every waiter whose deadline has passed with `CommandTimeout`.
    fn expire_overdue(&mut self) {
        let now = Instant::now();
        let overdue: Vec<u64> = self
            .awaiting
            .iter()
            .filter_map(|(&id, waiter)| (waiter.deadline <= now).then_some(id))
            .collect();

        for id in overdue {
            if let Some(waiter) = self.awaiting.remove(&id) {
                let _ = waiter.reply_tx.send(Err(CdpError::CommandTimeout {
                    method: waiter.method,
                }));
            }
        }
    }

    /// Fail every waiter with the given error.
    fn abort_awaiting(&mut self, error: impl Fn() -> CdpError) {
        for (_, waiter) in std::mem::take(&mut self.awaiting) {
            let _ = waiter.reply_tx.send(Err(error()));
        }
    }

    /// The socket died. Notify once, fail the waiters, then either win a
    /// reconnect race or park the task in the drain state.
    async fn on_connection_lost(&mut self) {
        self.connected.store(false, Ordering::Relaxed);
        self.abort_awaiting(|| CdpError::Closed);
        self.missed_pongs = 0;

        // The notice fires exactly once, before any reconnect attempt.
        if let Some(tx) = self.disconnect_tx.take() {
            let _ = tx.try_send(());
        }

        let mut backoff = self.reconnect_config.initial_backoff;
        let mut last_error = String::from("no retries configured");

        for attempt in 1..=self.reconnect_config.max_retries {
            tokio::time::sleep(backoff).await;

            match open_ws(&self.url, self.connect_timeout).await {
                Ok(socket) => {
                    tracing::info!("CDP reconnected after {attempt} attempt(s)");
                    self.socket = socket;
                    self.connected.store(true, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    last_error = e.to_string();
                    backoff = (backoff * 2).min(self.reconnect_config.max_backoff);
                }
            }
        }

        // Retries exhausted (or disabled): the run loop drains remaining
        // commands with ReconnectFailed from here on.
        self.gave_up = Some((self.reconnect_config.max_retries, last_error));
    }
}
