//! Core relay server: admits sockets and runs the per-connection loops.
//!
//! One reader task per accepted socket plus one writer task draining the
//! connection's outbound queue, so no registry lock is ever held across a
//! network write. The relay never inspects `encryptedMessage` contents: it
//! stamps sender, timestamp, and id onto the frame and fans the bytes out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use sotto_core::messages::{ClientFrame, ServerFrame, MAX_CIPHERTEXT_BYTES, MAX_FRAME_BYTES};
use sotto_core::{message_id, timestamp_now, ChatError, ChatResult};

use crate::admission::AdmissionController;
use crate::config::ServerConfig;
use crate::presence::PresenceManager;
use crate::registry::{ConnectionId, SessionRegistry};
use crate::router::{Audience, MessageRouter};

/// The single WebSocket endpoint the relay serves.
pub const WS_PATH: &str = "/ws";

/// Capacity of each connection's outbound queue.
const OUTBOUND_QUEUE: usize = 64;

/// The sotto relay server.
pub struct ChatServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    router: MessageRouter,
    presence: PresenceManager,
    admission: AdmissionController,
}

impl ChatServer {
    /// Create a server instance from resolved configuration.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let router = MessageRouter::new(registry.clone());
        let presence = PresenceManager::new(registry.clone(), router.clone());
        let admission = AdmissionController::new(
            config.admission_max_attempts,
            config.admission_window_secs,
        );
        Self {
            config,
            registry,
            router,
            presence,
            admission,
        }
    }

    /// Bind the configured address and serve until the process stops.
    pub async fn run(self) -> ChatResult<()> {
        let addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ChatError::Transport(format!("bind {addr} failed: {e}")))?;
        info!(addr = %addr, path = WS_PATH, "relay listening");
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> ChatResult<()> {
        let server = Arc::new(self);

        // Defensive cleanup on a fixed interval, independent of connection
        // events: evict entries the disconnect path missed, announce their
        // departures, and drop elapsed admission windows.
        let sweeper = server.clone();
        let sweep_interval = Duration::from_secs(server.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                let removed = sweeper.registry.sweep_stale().await;
                if !removed.is_empty() {
                    sweeper.presence.announce_departures(removed).await;
                }
                sweeper.admission.gc();
            }
        });

        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let srv = server.clone();
                    tokio::spawn(async move {
                        if let Err(e) = srv.handle_connection(stream, remote).await {
                            debug!(remote = %remote, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "TCP accept failed");
                }
            }
        }
    }

    /// Upgrade one socket and run its read loop until it closes.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> ChatResult<()> {
        // Admission is decided per source address before the upgrade
        // completes; a denied attempt is answered at the HTTP level.
        let admitted = self.admission.check_and_record(&remote.ip().to_string());

        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() != WS_PATH {
                let mut reject = ErrorResponse::new(Some("not found".into()));
                *reject.status_mut() = StatusCode::NOT_FOUND;
                return Err(reject);
            }
            if !admitted {
                let mut reject = ErrorResponse::new(Some("rate limit exceeded".into()));
                *reject.status_mut() = StatusCode::TOO_MANY_REQUESTS;
                return Err(reject);
            }
            Ok(resp)
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                // Covers denied admission, wrong path, and plain non-WebSocket
                // requests on the endpoint.
                debug!(remote = %remote, error = %e, "WebSocket upgrade rejected");
                return Ok(());
            }
        };

        let (ws_sink, mut ws_read) = ws_stream.split();
        let (tx, rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let conn = self.registry.insert(tx.clone()).await;
        info!(remote = %remote, conn = %conn, "connection accepted");

        let writer = tokio::spawn(write_loop(ws_sink, rx));

        while let Some(msg) = ws_read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if text.len() > MAX_FRAME_BYTES {
                        self.send_error(&tx, "Message too large").await;
                        continue;
                    }
                    match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => self.dispatch(conn, &tx, frame).await,
                        Err(e) => {
                            debug!(conn = %conn, error = %e, "unparseable frame");
                            self.send_error(&tx, "Invalid message format").await;
                        }
                    }
                }
                Ok(Message::Ping(payload)) => {
                    let _ = tx.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(_)) => {
                    self.registry.mark_closing(conn).await;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(conn = %conn, error = %e, "socket read failed");
                    break;
                }
            }
        }

        // Idempotent: the sweep may already have evicted this entry.
        self.presence.handle_disconnect(conn).await;

        drop(tx);
        let _ = writer.await;
        Ok(())
    }

    /// Dispatch a parsed client frame.
    async fn dispatch(&self, conn: ConnectionId, tx: &mpsc::Sender<Message>, frame: ClientFrame) {
        match frame {
            ClientFrame::Join { username, public_key } => {
                self.presence.handle_join(conn, username, public_key).await;
            }
            ClientFrame::Message {
                encrypted_message,
                recipients,
            } => {
                self.relay_message(conn, tx, encrypted_message, recipients).await;
            }
            ClientFrame::Typing => self.presence.handle_typing(conn, false).await,
            ClientFrame::StopTyping => self.presence.handle_typing(conn, true).await,
            ClientFrame::Ping => {
                let pong = ServerFrame::Pong {
                    timestamp: timestamp_now(),
                };
                if let Ok(json) = serde_json::to_string(&pong) {
                    let _ = tx.send(Message::Text(json)).await;
                }
            }
        }
    }

    /// Relay an opaque encrypted payload to its audience.
    async fn relay_message(
        &self,
        conn: ConnectionId,
        tx: &mpsc::Sender<Message>,
        encrypted_message: String,
        recipients: Option<Vec<String>>,
    ) {
        let Some(username) = self.registry.username_of(conn).await else {
            self.send_error(tx, "Not authenticated").await;
            return;
        };

        if encrypted_message.is_empty() || encrypted_message.len() > MAX_CIPHERTEXT_BYTES {
            self.send_error(tx, "Invalid message").await;
            return;
        }

        let frame = ServerFrame::Message {
            username: username.clone(),
            encrypted_message,
            timestamp: timestamp_now(),
            message_id: message_id(),
        };

        let audience = match recipients {
            Some(names) if !names.is_empty() => Audience::Users(names),
            _ => Audience::Everyone,
        };

        let report = self.router.route(&frame, audience, Some(conn)).await;
        info!(conn = %conn, username = %username,
            delivered = report.delivered, failed = report.failed.len(),
            "relayed encrypted message");
    }

    async fn send_error(&self, tx: &mpsc::Sender<Message>, message: &str) {
        let frame = ServerFrame::Error {
            message: message.to_string(),
            timestamp: timestamp_now(),
        };
        if let Ok(json) = serde_json::to_string(&frame) {
            let _ = tx.send(Message::Text(json)).await;
        }
    }
}

/// Drain a connection's outbound queue into its socket.
///
/// Ends when every sender is gone (clean disconnect) or a write fails (dead
/// socket); closing the receiver is what the sweep detects for stale
/// entries.
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            debug!(error = %e, "socket write failed");
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}
