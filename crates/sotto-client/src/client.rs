//! The async chat client.
//!
//! `ChatClient` owns the socket lifecycle for one login: it connects,
//! announces the session's public key with the join request, then runs a
//! dispatch loop that feeds the key directory from presence frames,
//! decrypts incoming envelopes, and surfaces everything as typed events.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use sotto_core::messages::{ClientFrame, ServerFrame, UserEntry};
use sotto_core::{ChatError, ChatResult};

use crate::session::CipherSession;

/// What the dispatch loop reports back to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// The private presence snapshot received after joining.
    Roster { users: Vec<String> },
    /// A peer joined; carries the refreshed roster.
    PeerJoined { username: String, users: Vec<String> },
    /// A peer left; carries the refreshed roster.
    PeerLeft { username: String, users: Vec<String> },
    /// A decrypted (or placeholder) chat message.
    Message {
        username: String,
        text: String,
        message_id: String,
        timestamp: String,
        own: bool,
    },
    Typing { username: String },
    StopTyping { username: String },
    Pong { timestamp: String },
    /// An `error` frame from the relay.
    ServerError { message: String },
    /// The socket closed; the reconnect supervisor takes it from here.
    Disconnected,
}

/// Handle to a connected chat session.
pub struct ChatClient {
    outgoing: mpsc::Sender<ClientFrame>,
    session: Arc<CipherSession>,
}

impl ChatClient {
    /// Connect to the relay, join under the session's username, and start
    /// the dispatch loop. Returns the client handle and the event stream.
    pub async fn connect(
        url: &str,
        session: Arc<CipherSession>,
    ) -> ChatResult<(Self, mpsc::Receiver<ChatEvent>)> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ChatError::Transport(format!("WebSocket connect failed: {e}")))?;
        debug!(url, username = session.username(), "connected to relay");

        let (mut sink, stream) = ws.split();

        // Join first: the public key must be on the wire before any peer
        // could try to address us.
        let join = ClientFrame::Join {
            username: session.username().to_string(),
            public_key: Some(session.export_public()),
        };
        sink.send(Message::Text(serde_json::to_string(&join)?))
            .await
            .map_err(|e| ChatError::Transport(format!("join send failed: {e}")))?;

        let (out_tx, out_rx) = mpsc::channel::<ClientFrame>(64);
        let (event_tx, event_rx) = mpsc::channel::<ChatEvent>(256);

        let loop_session = session.clone();
        tokio::spawn(async move {
            dispatch_loop(sink, stream, out_rx, event_tx, loop_session).await;
        });

        Ok((
            Self {
                outgoing: out_tx,
                session,
            },
            event_rx,
        ))
    }

    /// Encrypt and send a message to every peer in the key directory.
    pub async fn send_chat(&self, text: &str) -> ChatResult<()> {
        let encrypted_message = self.session.encrypt(text).await?;
        self.send_frame(ClientFrame::Message {
            encrypted_message,
            recipients: None,
        })
        .await
    }

    /// Encrypt and send a message addressed to specific users only.
    ///
    /// The envelope still wraps for every known peer; the relay restricts
    /// delivery to the named recipients.
    pub async fn send_chat_to(&self, text: &str, recipients: Vec<String>) -> ChatResult<()> {
        let encrypted_message = self.session.encrypt(text).await?;
        self.send_frame(ClientFrame::Message {
            encrypted_message,
            recipients: Some(recipients),
        })
        .await
    }

    /// Signal that this user started or stopped typing.
    pub async fn set_typing(&self, typing: bool) -> ChatResult<()> {
        self.send_frame(if typing {
            ClientFrame::Typing
        } else {
            ClientFrame::StopTyping
        })
        .await
    }

    /// Application-level keepalive.
    pub async fn ping(&self) -> ChatResult<()> {
        self.send_frame(ClientFrame::Ping).await
    }

    /// The cipher session this client encrypts with.
    pub fn session(&self) -> &Arc<CipherSession> {
        &self.session
    }

    /// Close the connection. Dropping the handle has the same effect.
    pub fn close(self) {}

    async fn send_frame(&self, frame: ClientFrame) -> ChatResult<()> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| ChatError::Transport("connection closed".into()))
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;
type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
>;

async fn dispatch_loop(
    mut sink: WsSink,
    mut stream: WsStream,
    mut out_rx: mpsc::Receiver<ClientFrame>,
    event_tx: mpsc::Sender<ChatEvent>,
    session: Arc<CipherSession>,
) {
    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize outbound frame");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            debug!(error = %e, "socket write failed");
                            break;
                        }
                    }
                    None => {
                        // Client handle dropped: clean close.
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => {
                                if let Some(event) = handle_frame(frame, &session).await {
                                    if event_tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "ignoring unparseable frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "socket read failed");
                        break;
                    }
                }
            }
        }
    }

    let _ = event_tx.send(ChatEvent::Disconnected).await;
    debug!(username = session.username(), "dispatch loop ended");
}

/// Apply one server frame to the session and translate it into an event.
async fn handle_frame(frame: ServerFrame, session: &CipherSession) -> Option<ChatEvent> {
    match frame {
        ServerFrame::Users { users } => {
            session.ingest_roster(&users).await;
            Some(ChatEvent::Roster {
                users: usernames(&users),
            })
        }
        ServerFrame::Join {
            username,
            public_key,
            users,
            ..
        } => {
            if let Some(key) = public_key.as_deref() {
                if let Err(e) = session.learn_key(&username, key).await {
                    warn!(username = %username, error = %e, "ignoring unusable peer key");
                }
            }
            session.ingest_roster(&users).await;
            Some(ChatEvent::PeerJoined {
                username,
                users: usernames(&users),
            })
        }
        ServerFrame::Leave { username, users, .. } => Some(ChatEvent::PeerLeft {
            username,
            users: usernames(&users),
        }),
        ServerFrame::Message {
            username,
            encrypted_message,
            timestamp,
            message_id,
        } => {
            let text = session.decrypt(&encrypted_message, &username).await;
            let own = username == session.username();
            Some(ChatEvent::Message {
                username,
                text,
                message_id,
                timestamp,
                own,
            })
        }
        ServerFrame::Typing { username, .. } => Some(ChatEvent::Typing { username }),
        ServerFrame::StopTyping { username, .. } => Some(ChatEvent::StopTyping { username }),
        ServerFrame::Pong { timestamp } => Some(ChatEvent::Pong { timestamp }),
        ServerFrame::Error { message, .. } => Some(ChatEvent::ServerError { message }),
    }
}

fn usernames(users: &[UserEntry]) -> Vec<String> {
    users.iter().map(|u| u.username.clone()).collect()
}
