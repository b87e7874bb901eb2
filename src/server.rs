//! WebSocket collaboration server.
//!
//! ```text
//! Client A ──┐
//!             ├── SessionDispatcher ── Room (log + membership)
//! Client B ──┘          │                 │
//!                  RoomManager ───────────┤
//!                       │                 │ fan-out
//!                    reaper          SendQueue per connection
//! ```
//!
//! One task per connection. Each task selects over three things: the
//! inbound WebSocket stream (decode → dispatch), the connection's
//! outbound queue (pop → send), and a heartbeat timer that closes
//! connections silent for longer than the configured timeout. Room
//! mutation happens inside the dispatcher under the room's writer lock;
//! the connection task itself never blocks on another peer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::manager::{ManagerConfig, RoomManager};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::session::{SendQueue, SessionDispatcher};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket bind address.
    pub bind_addr: String,
    /// HTTP side-channel bind address (`/health`, `/stats`).
    pub http_addr: String,
    /// Admission cap per room.
    pub max_users_per_room: usize,
    /// Operation log cap per room.
    pub max_operations: usize,
    /// Outbound frames buffered per connection before droppable frames
    /// are shed.
    pub send_queue_capacity: usize,
    /// Close connections with no inbound traffic for this long.
    pub heartbeat_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9100".to_string(),
            http_addr: "127.0.0.1:9101".to_string(),
            max_users_per_room: 20,
            max_operations: crate::oplog::MAX_OPERATIONS,
            send_queue_capacity: 256,
            heartbeat_timeout_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Build from environment variables, logging and defaulting when
    /// unset or malformed: `PORT`, `HTTP_PORT`, `MAX_USERS_PER_ROOM`,
    /// `MAX_OPERATIONS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_var::<u16>("PORT") {
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(port) = env_var::<u16>("HTTP_PORT") {
            config.http_addr = format!("0.0.0.0:{port}");
        }
        if let Some(max) = env_var("MAX_USERS_PER_ROOM") {
            config.max_users_per_room = max;
        }
        if let Some(max) = env_var("MAX_OPERATIONS") {
            config.max_operations = max;
        }

        config
    }

    /// Manager settings derived from this server configuration.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_users_per_room: self.max_users_per_room,
            max_operations: self.max_operations,
            ..ManagerConfig::default()
        }
    }
}

fn env_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring malformed {name}={raw}");
            None
        }
    }
}

/// Server-wide counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames shed by per-connection queues under backpressure.
    pub frames_dropped: u64,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    manager: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    next_conn: AtomicU64,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        let manager = Arc::new(RoomManager::new(config.manager_config()));
        Self {
            config,
            manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn manager(&self) -> &Arc<RoomManager> {
        &self.manager
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn stats_handle(&self) -> Arc<RwLock<ServerStats>> {
        self.stats.clone()
    }

    /// Accept connections forever. Spawns the room reaper first.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let _reaper = self.manager.spawn_reaper();

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let conn = self.next_conn.fetch_add(1, Ordering::SeqCst);
            let manager = self.manager.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, conn, manager, stats, config).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Drive a single WebSocket connection to completion.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        conn: u64,
        manager: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection {conn} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let queue = Arc::new(SendQueue::new(config.send_queue_capacity));
        let dispatcher = SessionDispatcher::new(manager, conn, queue.clone());

        let heartbeat_timeout = Duration::from_secs(config.heartbeat_timeout_secs);
        let mut heartbeat = tokio::time::interval(heartbeat_timeout / 4);
        heartbeat.tick().await; // immediate first tick
        let mut last_traffic = Instant::now();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            last_traffic = Instant::now();
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            match ClientEvent::decode(&bytes) {
                                Ok(event) => dispatcher.dispatch(event).await,
                                Err(e) => {
                                    log::warn!("failed to decode message from {addr}: {e}");
                                    if let Ok(reply) = (ServerEvent::ServerError {
                                        message: "malformed frame".to_string(),
                                    })
                                    .encode()
                                    {
                                        queue.push(Arc::new(reply), false);
                                    }
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            last_traffic = Instant::now();
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection {conn} closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = queue.pop() => {
                    match frame {
                        Some(bytes) => {
                            ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                        }
                        // Queue closed (stale sweep); wind the connection down.
                        None => break,
                    }
                }

                _ = heartbeat.tick() => {
                    if last_traffic.elapsed() >= heartbeat_timeout {
                        log::warn!("connection {conn} timed out after {heartbeat_timeout:?} of silence");
                        break;
                    }
                }
            }
        }

        dispatcher.disconnect().await;
        queue.close();

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.frames_dropped += queue.dropped_count();
        }

        Ok(())
    }
}
