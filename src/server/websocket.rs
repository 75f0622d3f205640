//! WebSocket server implementation
//!
//! Provides a WebSocket server that listens on a configurable port and handles
//! connections from clients. Each connection may start sessions (becoming
//! their live consumer) and run any number of tails; all of that is detached
//! when the connection closes, while the sessions themselves keep running.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::protocol::{ClientEnvelope, ClientMessage, ErrorCode, ServerEnvelope, ServerMessage};
use crate::process::TerminalSize;
use crate::session::{CancelOutcome, SessionId, SessionRegistry, StartRequest, Tail, TailEvent};

/// Messages queued for one client before producers have to wait
const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self { bind, port }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server for handling client connections
pub struct WebSocketServer {
    config: ServerConfig,
    registry: SessionRegistry,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig, registry: SessionRegistry) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the WebSocket server
    ///
    /// This will listen for incoming connections and handle them concurrently.
    /// On shutdown every running session is sent SIGTERM.
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on ws://{}/ws", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let registry = self.registry.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, registry, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let session_count = self.registry.session_count().await;
        if session_count > 0 {
            info!("Terminating {} sessions...", session_count);
            self.registry.shutdown_all().await;
        }

        Ok(())
    }
}

/// Per-connection state: the outbound queue plus the tasks feeding it
struct Connection {
    registry: SessionRegistry,
    outbound: mpsc::Sender<ServerMessage>,
    /// Live forwarders and in-flight input writes
    live: Vec<JoinHandle<()>>,
    tails: HashMap<SessionId, JoinHandle<()>>,
}

impl Connection {
    fn new(registry: SessionRegistry, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            registry,
            outbound,
            live: Vec::new(),
            tails: HashMap::new(),
        }
    }

    fn add_live(&mut self, handle: JoinHandle<()>) {
        self.live.retain(|h| !h.is_finished());
        self.live.push(handle);
    }

    fn add_tail(&mut self, session_id: SessionId, handle: JoinHandle<()>) {
        self.tails.retain(|_, h| !h.is_finished());
        if let Some(previous) = self.tails.insert(session_id, handle) {
            previous.abort();
        }
    }

    fn stop_tail(&mut self, session_id: SessionId) -> bool {
        match self.tails.remove(&session_id) {
            Some(handle) => {
                let running = !handle.is_finished();
                handle.abort();
                running
            }
            None => false,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Dropping the live receivers detaches this connection from its
        // sessions; the sessions keep buffering.
        for handle in self.live.drain(..) {
            handle.abort();
        }
        for (_, handle) in self.tails.drain() {
            handle.abort();
        }
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: SessionRegistry,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    // Upgrade to WebSocket
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let mut connection = Connection::new(registry, outbound_tx);

    // Send welcome message
    ws_sender
        .send(Message::Text(encode(ServerMessage::welcome())?))
        .await?;
    debug!("Sent welcome message to {}", peer_addr);

    // Message handling loop
    loop {
        tokio::select! {
            // Receive messages from client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received message from {}: {} bytes", peer_addr, text.len());

                        if let Some(response) = handle_message(&text, &mut connection).await {
                            ws_sender.send(Message::Text(encode(response)?)).await?;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", peer_addr);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Connection closed by {}", peer_addr);
                        break;
                    }
                }
            }
            // Forward pushed output and deferred replies
            Some(message) = outbound_rx.recv() => {
                ws_sender.send(Message::Text(encode(message)?)).await?;
            }
            // Handle shutdown signal
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection to {}", peer_addr);
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    info!("Connection from {} closed", peer_addr);
    Ok(())
}

fn encode(message: ServerMessage) -> anyhow::Result<String> {
    Ok(ServerEnvelope::new(message).to_json()?)
}

/// Handle a client message.
///
/// Returns the direct reply, if any; streamed output and long-running results
/// go through the connection's outbound queue.
async fn handle_message(text: &str, connection: &mut Connection) -> Option<ServerMessage> {
    let envelope = match ClientEnvelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Rejected message: {}", e);
            return Some(e.into());
        }
    };
    let registry = connection.registry.clone();

    match envelope.message {
        ClientMessage::Ping { seq } => {
            debug!("Received ping with seq {}", seq);
            Some(ServerMessage::pong(seq))
        }

        ClientMessage::StartSession {
            command,
            cwd,
            cols,
            rows,
            env,
            mode,
            timeout_secs,
        } => {
            let mut request = StartRequest::new(command);
            request.cwd = cwd.map(PathBuf::from);
            request.env = env;
            request.mode = mode;
            request.timeout = timeout_secs.map(Duration::from_secs);
            if cols.is_some() || rows.is_some() {
                let default = registry.config().launcher.default_size();
                request.size = Some(TerminalSize::new(
                    cols.unwrap_or(default.cols),
                    rows.unwrap_or(default.rows),
                ));
            }

            match registry.start(request).await {
                Ok(started) => {
                    let session_id = started.info.session_id;
                    let reply = ServerMessage::session_started(&started.info);
                    if let Some(live) = started.live {
                        connection.add_live(spawn_live_forwarder(
                            session_id,
                            live,
                            registry,
                            connection.outbound.clone(),
                        ));
                    }
                    Some(reply)
                }
                Err(e) => Some(e.into()),
            }
        }

        ClientMessage::SendInput { target, data } => {
            // The process may be slow to take its input; keep reading frames
            // meanwhile so the client can still cancel.
            let outbound = connection.outbound.clone();
            connection.add_live(tokio::spawn(async move {
                let reply = match registry.write_input(target, data.as_bytes()).await {
                    Ok(bytes) => ServerMessage::InputAccepted { target, bytes },
                    Err(e) => e.into(),
                };
                let _ = outbound.send(reply).await;
            }));
            None
        }

        ClientMessage::TailLogs { target, offset } => match registry.tail(target, offset).await {
            Ok(tail) => {
                let session_id = tail.session_id();
                connection.add_tail(
                    session_id,
                    spawn_tail_forwarder(tail, connection.outbound.clone()),
                );
                None
            }
            Err(e) => Some(ServerMessage::tail_ended(None, Some(e.to_string()), None)),
        },

        ClientMessage::StopTail { session_id } => {
            if connection.stop_tail(session_id) {
                Some(ServerMessage::tail_ended(
                    Some(session_id),
                    Some("Tail stopped".to_string()),
                    None,
                ))
            } else {
                Some(ServerMessage::session_error(
                    session_id,
                    "No active tail for this session",
                    ErrorCode::SessionNotFound,
                ))
            }
        }

        ClientMessage::ReadOutput { target, offset } => {
            match registry.read_output(target, offset).await {
                Ok(read) => Some(ServerMessage::OutputChunk {
                    target,
                    output: read.output,
                    offset: read.offset,
                    reset: read.reset,
                    running: read.running,
                }),
                Err(e) => Some(e.into()),
            }
        }

        ClientMessage::CancelSession { target, purge } => match registry.cancel(target, purge).await {
            Ok(outcome) => Some(ServerMessage::Cancelled {
                target,
                success: outcome == CancelOutcome::Cancelled,
            }),
            Err(e) => Some(e.into()),
        },

        ClientMessage::ResizeTerminal { target, cols, rows } => {
            match registry.resize(target, TerminalSize::new(cols, rows)).await {
                Ok(()) => Some(ServerMessage::SessionResized { target, cols, rows }),
                Err(e) => Some(e.into()),
            }
        }

        ClientMessage::ListSessions => Some(ServerMessage::SessionList {
            sessions: registry.list().await,
        }),

        ClientMessage::GetSessionStatus { target } => match registry.status(target).await {
            Ok(session) => Some(ServerMessage::SessionStatus { session }),
            Err(e) => Some(e.into()),
        },

        ClientMessage::RunHelper { program, args, cwd } => {
            let outbound = connection.outbound.clone();
            tokio::spawn(async move {
                let reply = match registry.run_helper(program, args, cwd.map(PathBuf::from)).await {
                    Ok(result) => ServerMessage::HelperResult {
                        session_id: result.session_id,
                        output: result.output,
                        exit: result.exit,
                    },
                    Err(e) => e.into(),
                };
                let _ = outbound.send(reply).await;
            });
            None
        }
    }
}

/// Push a session's live stream to this connection, then its exit.
///
/// If the session detached the stream because this client fell behind, the
/// rest is replayed from the buffer starting where the stream stopped.
fn spawn_live_forwarder(
    session_id: SessionId,
    mut live: mpsc::Receiver<String>,
    registry: SessionRegistry,
    outbound: mpsc::Sender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut delivered = 0;
        while let Some(data) = live.recv().await {
            delivered += data.len();
            if outbound
                .send(ServerMessage::session_output(session_id, data))
                .await
                .is_err()
            {
                return;
            }
        }

        let mut exit = None;
        if let Ok(mut tail) = registry.tail(session_id.into(), delivered).await {
            while let Some(event) = tail.next().await {
                match event {
                    TailEvent::Output(chunk) => {
                        let message = ServerMessage::session_output(session_id, chunk.output);
                        if outbound.send(message).await.is_err() {
                            return;
                        }
                    }
                    TailEvent::Ended { exit: record } => {
                        exit = record;
                        break;
                    }
                    TailEvent::Gone { .. } => break,
                }
            }
        }
        let _ = outbound
            .send(ServerMessage::session_exited(session_id, exit))
            .await;
    })
}

fn spawn_tail_forwarder(mut tail: Tail, outbound: mpsc::Sender<ServerMessage>) -> JoinHandle<()> {
    let session_id = tail.session_id();
    tokio::spawn(async move {
        while let Some(event) = tail.next().await {
            let message = match event {
                TailEvent::Output(chunk) => ServerMessage::tail_output(session_id, chunk),
                TailEvent::Ended { exit } => ServerMessage::tail_ended(Some(session_id), None, exit),
                TailEvent::Gone { message } => {
                    ServerMessage::tail_ended(Some(session_id), Some(message), None)
                }
            };
            if outbound.send(message).await.is_err() {
                break;
            }
        }
    })
}
