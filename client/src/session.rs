//! Tunnel session
//!
//! One attempt at a duplex connection to the relay: open the transport,
//! authenticate with `CONNECT`, then forward `REQUEST`s and answer `PING`s
//! until the connection ends.
//!
//! All writes go through a single writer task. Control frames (handshake,
//! `PONG`) have their own queue, which the writer drains before responses,
//! so keepalives never wait behind a backlog of forwarded requests.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hookline_shared::{Error, RequestMessage, Result, WireMessage};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::SessionIdentity;
use crate::forwarder::Forwarder;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const CONTROL_CHANNEL_CAPACITY: usize = 32;
const RESPONSE_CHANNEL_CAPACITY: usize = 128;
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Connected,
    Disconnected,
    Reconnecting,
    Terminated,
}

/// How a connected session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Lost without a local `disconnect()`; eligible for reconnection
    Disconnected(String),
    /// Closed locally
    Terminated,
}

/// Queues feeding the writer task.
#[derive(Clone)]
struct Outbound {
    control: mpsc::Sender<String>,
    responses: mpsc::Sender<String>,
}

impl Outbound {
    async fn send_control(&self, message: &WireMessage) -> bool {
        enqueue(&self.control, message).await
    }

    async fn send_response(&self, message: &WireMessage) -> bool {
        enqueue(&self.responses, message).await
    }
}

async fn enqueue(tx: &mpsc::Sender<String>, message: &WireMessage) -> bool {
    match message.encode() {
        Ok(frame) => tx.send(frame).await.is_ok(),
        Err(e) => {
            error!("Failed to encode {} message: {}", message.kind(), e);
            false
        }
    }
}

/// Tasks and shutdown switch of the live connection.
struct Link {
    shutdown: Arc<watch::Sender<bool>>,
    reader: JoinHandle<SessionEnd>,
    writer: JoinHandle<()>,
}

pub struct TunnelSession {
    identity: Arc<SessionIdentity>,
    forwarder: Arc<Forwarder>,
    handshake_timeout: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    link: Option<Link>,
}

impl TunnelSession {
    pub fn new(identity: SessionIdentity, forwarder: Forwarder) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            identity: Arc::new(identity),
            forwarder: Arc::new(forwarder),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            state: Arc::new(state),
            link: None,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Subscribe to state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Mark the session as waiting for a reconnect attempt.
    pub fn begin_reconnect(&self) {
        self.set_state(ConnectionState::Reconnecting);
    }

    fn set_state(&self, state: ConnectionState) {
        debug!("Tunnel {} -> {:?}", self.identity.tunnel_id(), state);
        self.state.send_replace(state);
    }

    /// Open the transport and authenticate. Resolves once `CONNECTED` arrives.
    pub async fn connect(&mut self) -> Result<()> {
        if let Some(link) = &self.link {
            if !link.reader.is_finished() {
                return Err(Error::AlreadyConnected);
            }
        }
        if let Some(stale) = self.link.take() {
            stale.shutdown.send_replace(true);
            let _ = stale.writer.await;
        }

        self.set_state(ConnectionState::Connecting);
        let url = self.identity.tunnel_url().clone();
        if self.identity.is_plaintext_remote() {
            warn!(
                "Using insecure WebSocket connection ({}): all tunnel traffic is transmitted in plaintext. \
                 Use an https endpoint for a secure (wss://) connection.",
                url
            );
        }
        info!("Connecting to relay: {}", url);

        // Opening the transport is bounded by the same timeout as the handshake.
        let opened = tokio::time::timeout(self.handshake_timeout, connect_async(url.as_str())).await;
        let ws_stream = match opened {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(Error::Connection(format!("failed to connect to relay: {}", e)));
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(Error::ConnectTimeout(self.handshake_timeout));
            }
        };
        let (sink, mut source) = ws_stream.split();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let writer = tokio::spawn(write_loop(sink, control_rx, response_rx, shutdown_rx.clone()));
        let outbound = Outbound {
            control: control_tx,
            responses: response_tx,
        };

        let hello = WireMessage::Connect {
            token: self.identity.auth_token().to_string(),
            tunnel_id: self.identity.tunnel_id().to_string(),
            local_port: self.identity.local_port(),
        };
        let handshake = if outbound.send_control(&hello).await {
            self.set_state(ConnectionState::Authenticating);
            debug!("Sent CONNECT for tunnel {}", self.identity.tunnel_id());
            match tokio::time::timeout(self.handshake_timeout, await_connected(&mut source, &outbound)).await {
                Ok(result) => result,
                Err(_) => Err(Error::HandshakeTimeout(self.handshake_timeout)),
            }
        } else {
            Err(Error::Connection("transport closed before handshake".into()))
        };

        let message = match handshake {
            Ok(message) => message,
            Err(e) => {
                if e.is_rejection() {
                    error!("Error: {}", e);
                }
                shutdown.send_replace(true);
                let _ = writer.await;
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        if message.is_empty() {
            info!("Tunnel {} connected", self.identity.tunnel_id());
        } else {
            info!("Tunnel {} connected: {}", self.identity.tunnel_id(), message);
        }
        self.set_state(ConnectionState::Connected);

        let reader = tokio::spawn(read_loop(
            source,
            ReadContext {
                forwarder: self.forwarder.clone(),
                outbound,
                shutdown: shutdown.clone(),
                shutdown_rx,
                state: self.state.clone(),
            },
        ));
        self.link = Some(Link {
            shutdown,
            reader,
            writer,
        });
        Ok(())
    }

    /// Wait for the current connection to end.
    pub async fn closed(&mut self) -> SessionEnd {
        let Some(link) = self.link.as_mut() else {
            return SessionEnd::Disconnected("not connected".into());
        };
        let joined = (&mut link.reader).await;
        let end = match joined {
            Ok(end) => end,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                SessionEnd::Disconnected(format!("reader task failed: {}", e))
            }
        };
        if let Some(link) = self.link.take() {
            let _ = link.writer.await;
        }
        end
    }

    /// Close the transport and stop. Safe to call more than once.
    pub async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            info!("Disconnecting tunnel {}", self.identity.tunnel_id());
            link.shutdown.send_replace(true);
            let _ = link.reader.await;
            let _ = link.writer.await;
        }
        self.set_state(ConnectionState::Terminated);
    }
}

/// Read frames until the relay accepts or rejects the handshake.
async fn await_connected(source: &mut WsSource, outbound: &Outbound) -> Result<String> {
    loop {
        let frame = match source.next().await {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => return Err(Error::ClosedDuringHandshake),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(Error::Connection(e.to_string())),
        };

        match WireMessage::decode(&frame) {
            Ok(WireMessage::Connected { message, .. }) => return Ok(message),
            Ok(WireMessage::Error { message }) => return Err(Error::Rejected(message)),
            Ok(WireMessage::Ping) => {
                outbound.send_control(&WireMessage::Pong).await;
            }
            Ok(other) => debug!("Ignoring {} before handshake completed", other.kind()),
            Err(e) if e.is_unknown_type() => debug!("Ignoring frame: {}", e),
            Err(e) => warn!("Dropping malformed frame: {}", e),
        }
    }
}

struct ReadContext {
    forwarder: Arc<Forwarder>,
    outbound: Outbound,
    shutdown: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    state: Arc<watch::Sender<ConnectionState>>,
}

async fn read_loop(mut source: WsSource, mut ctx: ReadContext) -> SessionEnd {
    let end = loop {
        let next = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut ctx.shutdown_rx) => break SessionEnd::Terminated,
            next = source.next() => next,
        };

        let frame = match next {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "connection closed by relay".to_string());
                break SessionEnd::Disconnected(reason);
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break SessionEnd::Disconnected(format!("transport error: {}", e)),
            None => break SessionEnd::Disconnected("connection closed".to_string()),
        };

        match WireMessage::decode(&frame) {
            Ok(WireMessage::Request(request)) => spawn_forward(&ctx, request),
            Ok(WireMessage::Ping) => {
                if !ctx.outbound.send_control(&WireMessage::Pong).await {
                    break SessionEnd::Disconnected("writer closed".to_string());
                }
            }
            Ok(WireMessage::Error { message }) => {
                error!("Relay error: {}", message);
                break SessionEnd::Disconnected(message);
            }
            Ok(other) => debug!("Ignoring {} message", other.kind()),
            Err(e) if e.is_unknown_type() => debug!("Ignoring frame: {}", e),
            Err(e) => warn!("Dropping malformed frame: {}", e),
        }
    };

    // Stops the writer, which closes the transport. Responses still in
    // flight are dropped.
    ctx.shutdown.send_replace(true);
    let state = match end {
        SessionEnd::Terminated => ConnectionState::Terminated,
        SessionEnd::Disconnected(ref reason) => {
            warn!("Tunnel disconnected: {}", reason);
            ConnectionState::Disconnected
        }
    };
    ctx.state.send_replace(state);
    end
}

/// Forward without blocking the reader; the response is queued when done.
fn spawn_forward(ctx: &ReadContext, request: RequestMessage) {
    let forwarder = ctx.forwarder.clone();
    let outbound = ctx.outbound.clone();
    tokio::spawn(async move {
        let request_id = request.request_id.clone();
        let response = forwarder.forward(request).await;
        if !outbound.send_response(&WireMessage::Response(response)).await {
            debug!("Transport closed, dropping response for {}", request_id);
        }
    });
}

async fn write_loop(
    mut sink: WsSink,
    mut control: mpsc::Receiver<String>,
    mut responses: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            Some(frame) = control.recv() => frame,
            Some(frame) = responses.recv() => frame,
            else => break,
        };
        if let Err(e) = sink.send(Message::Text(frame)).await {
            warn!("Failed to write to relay: {}", e);
            break;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

/// Resolves once the flag is set. A dropped sender never resolves.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
