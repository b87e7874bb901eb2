//! WebSocket client for the collaboration server.
//!
//! Thin typed wrapper used by tools and the integration tests: connect,
//! join a room (with the 3-second ack ceiling clients are expected to
//! honor), send drawing events, and consume the server's event stream.

use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientEvent, ProtocolError, RoomInfo, ServerEvent, UserInfo};

/// How long a joiner waits for its ack before giving up.
pub const JOIN_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client-side errors.
#[derive(Debug, Clone)]
pub enum ClientError {
    /// The WebSocket connection could not be established.
    Connect(String),
    Protocol(ProtocolError),
    /// The server denied admission; carries the short error code.
    JoinDenied(String),
    /// No ack within [`JOIN_ACK_TIMEOUT`].
    AckTimeout,
    NotConnected,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "connect failed: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::JoinDenied(code) => write!(f, "join denied: {code}"),
            Self::AckTimeout => write!(f, "no join ack within {JOIN_ACK_TIMEOUT:?}"),
            Self::NotConnected => write!(f, "not connected"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// The collaboration client.
pub struct CollabClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: mpsc::Receiver<ServerEvent>,
    event_tx: mpsc::Sender<ServerEvent>,
    user: Option<UserInfo>,
}

impl CollabClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx,
            event_tx,
            user: None,
        }
    }

    /// Identity assigned by the server after a successful join.
    pub fn user(&self) -> Option<&UserInfo> {
        self.user.as_ref()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Open the WebSocket and spawn the connection task.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.server_url)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(outgoing_tx);

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        *state.write().await = ConnectionState::Connected;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    out = outgoing_rx.recv() => {
                        match out {
                            Some(bytes) => {
                                if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                                    break;
                                }
                            }
                            // Client dropped its sender: clean shutdown.
                            None => {
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }

                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                match ServerEvent::decode(&bytes) {
                                    Ok(event) => {
                                        if event_tx.send(event).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => log::warn!("client failed to decode frame: {e}"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                log::warn!("client websocket error: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
            *state.write().await = ConnectionState::Disconnected;
        });

        Ok(())
    }

    /// Send one event to the server.
    pub async fn send(&self, event: &ClientEvent) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        let bytes = event.encode()?;
        tx.send(bytes)
            .await
            .map_err(|_| ClientError::Protocol(ProtocolError::ConnectionClosed))
    }

    /// Next server event, in arrival order.
    pub async fn recv_event(&mut self) -> Option<ServerEvent> {
        self.event_rx.recv().await
    }

    /// Join a room and wait for the ack, up to [`JOIN_ACK_TIMEOUT`].
    pub async fn join_room(
        &mut self,
        room_id: impl Into<String>,
        username: Option<String>,
    ) -> Result<(UserInfo, RoomInfo), ClientError> {
        self.send(&ClientEvent::JoinRoom {
            room_id: room_id.into(),
            username,
        })
        .await?;

        let deadline = tokio::time::Instant::now() + JOIN_ACK_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.recv_event())
                .await
                .map_err(|_| ClientError::AckTimeout)?
                .ok_or(ClientError::Protocol(ProtocolError::ConnectionClosed))?;

            match event {
                ServerEvent::JoinAck {
                    success: true,
                    user: Some(user),
                    room: Some(room),
                    ..
                } => {
                    self.user = Some(user.clone());
                    return Ok((user, room));
                }
                ServerEvent::JoinAck { error, .. } => {
                    return Err(ClientError::JoinDenied(
                        error.unwrap_or_else(|| "unknown".to_string()),
                    ));
                }
                // The ack is the first frame after a join, but be tolerant
                // of stray presence traffic.
                _ => continue,
            }
        }
    }

    /// Drop the outbound channel, letting the connection task close the
    /// socket.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }
}
