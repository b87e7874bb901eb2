//! Binary wire protocol for room-based canvas collaboration.
//!
//! Every frame on the wire is one of two serde enums, bincode-encoded:
//!
//! ```text
//! client ──ClientEvent──► server          server ──ServerEvent──► client
//!
//! JoinRoom, DrawStart, DrawBatch,         JoinAck, UserJoined, UserLeft,
//! DrawEnd, Undo, Redo, ClearCanvas,       UsersList, RemoteDrawBatch,
//! CursorMove, MergeOps, Ping              RemoteDrawEnd, RemoteUndo,
//!                                         RemoteRedo, RemoteClear,
//!                                         RemoteCursor, SyncState,
//!                                         ServerError, Pong
//! ```
//!
//! The enum discriminant plays the role of the event name; the variant
//! fields are the payload. Per-connection FIFO and message boundaries come
//! from the WebSocket transport.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::oplog::Operation;

/// Current wall time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A single sampled point of an in-progress or finished stroke.
///
/// Coordinates are canvas-local. `pressure` is in `[0, 1]` and defaults to
/// zero for clients that do not report it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub pressure: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, pressure: 0.0 }
    }
}

/// Drawing tool selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tool {
    Brush,
    Eraser,
}

/// A completed (or completing) stroke as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    /// Sampled points, at least one.
    pub points: Vec<Point>,
    /// RGB hex color, e.g. `"#e6194b"`.
    pub color: String,
    /// Brush width in pixels, `1..=50`.
    pub width: u32,
    pub tool: Tool,
    /// Whether the client considers the stroke finished.
    pub is_complete: bool,
}

/// Public identity of a room member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    /// RGB hex color assigned by the room.
    pub color: String,
}

/// Room summary carried in the join ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: String,
    pub user_count: usize,
    pub operation_count: usize,
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// Request admission to a room. Always acked with [`ServerEvent::JoinAck`].
    JoinRoom {
        room_id: String,
        username: Option<String>,
    },
    /// First point of a stroke. Ephemeral, fanned out to others.
    DrawStart {
        x: f64,
        y: f64,
        color: String,
        width: u32,
        tool: Tool,
        timestamp: u64,
    },
    /// A batch of in-progress stroke points. Ephemeral.
    DrawBatch { points: Vec<Point>, timestamp: u64 },
    /// Stroke finished. This is the only drawing message that reaches the log.
    DrawEnd { stroke: Stroke, timestamp: u64 },
    /// Undo a specific operation, or the newest active one when `None`.
    Undo {
        operation_id: Option<String>,
        timestamp: u64,
    },
    /// Redo a specific operation, or the newest undone one when `None`.
    Redo {
        operation_id: Option<String>,
        timestamp: u64,
    },
    /// Clear the canvas: logged, tombstones everything active.
    ClearCanvas { timestamp: u64 },
    /// Cursor presence. Ephemeral, never logged.
    CursorMove { x: f64, y: f64, timestamp: u64 },
    /// Backfill of locally-held operations from a rejoining client.
    MergeOps { operations: Vec<Operation> },
    /// Heartbeat.
    Ping,
}

/// Messages the server sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Reply to [`ClientEvent::JoinRoom`]. Exactly one per join attempt.
    JoinAck {
        success: bool,
        user: Option<UserInfo>,
        room: Option<RoomInfo>,
        error: Option<String>,
    },
    /// A new member was admitted (sent to everyone else).
    UserJoined { user: UserInfo },
    /// A member left or disconnected (sent to the remainder).
    UserLeft { user: UserInfo },
    /// Full roster, targeted at one member.
    UsersList { users: Vec<UserInfo> },
    /// In-progress stroke points from a peer.
    RemoteDrawBatch {
        user_id: String,
        points: Vec<Point>,
        color: Option<String>,
        width: Option<u32>,
        tool: Option<Tool>,
        timestamp: u64,
    },
    /// A peer finished a stroke; `operation_id` names the log entry.
    RemoteDrawEnd {
        user_id: String,
        stroke: Stroke,
        operation_id: String,
        timestamp: u64,
    },
    /// Authoritative undo, sent to the whole room including the actor.
    RemoteUndo {
        user_id: String,
        operation_id: String,
        timestamp: u64,
    },
    /// Authoritative redo, sent to the whole room including the actor.
    RemoteRedo {
        user_id: String,
        operation_id: String,
        timestamp: u64,
    },
    /// Authoritative clear, sent to the whole room including the actor.
    RemoteClear { user_id: String, timestamp: u64 },
    /// Peer cursor position.
    RemoteCursor {
        user_id: String,
        x: f64,
        y: f64,
        timestamp: u64,
    },
    /// Ordered operation history for a joiner or after a merge.
    SyncState {
        operations: Vec<Operation>,
        timestamp: u64,
    },
    /// Targeted error string.
    ServerError { message: String },
    /// Heartbeat reply.
    Pong,
}

impl ServerEvent {
    /// Whether this frame may be dropped under send-queue backpressure.
    ///
    /// Only in-flight drawing and cursor presence are droppable; every
    /// authoritative or roster-bearing frame must survive.
    pub fn droppable(&self) -> bool {
        matches!(
            self,
            ServerEvent::RemoteDrawBatch { .. } | ServerEvent::RemoteCursor { .. }
        )
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl ClientEvent {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

impl ServerEvent {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Build a successful join ack.
    pub fn join_ok(user: UserInfo, room: RoomInfo) -> Self {
        Self::JoinAck {
            success: true,
            user: Some(user),
            room: Some(room),
            error: None,
        }
    }

    /// Build a failed join ack carrying a short error code.
    pub fn join_denied(error: impl Into<String>) -> Self {
        Self::JoinAck {
            success: false,
            user: None,
            room: None,
            error: Some(error.into()),
        }
    }
}
