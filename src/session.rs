//! Per-connection state: the bounded outbound queue and the event
//! dispatcher.
//!
//! ```text
//! ws recv ──decode──► SessionDispatcher ──mutate──► Room
//!                                                    │ fan-out
//!                             SendQueue ◄────────────┘
//! ws send ◄──pop──────────────┘   (bounded, drop-oldest-droppable)
//! ```
//!
//! The queue is the backpressure boundary: room writers push without
//! blocking, the connection's writer half pops at whatever pace the peer
//! sustains. On overflow the oldest droppable frame (in-progress strokes,
//! cursors) is shed first; authoritative frames are never dropped, even
//! if that lets the queue run past its capacity temporarily.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::manager::RoomManager;
use crate::protocol::{now_ms, ClientEvent, Point, ServerEvent, Stroke, Tool, UserInfo};

/// Process-unique connection identifier.
pub type ConnId = u64;

struct QueuedFrame {
    bytes: Arc<Vec<u8>>,
    droppable: bool,
}

struct QueueInner {
    frames: VecDeque<QueuedFrame>,
    closed: bool,
}

/// Bounded per-connection outbound queue.
pub struct SendQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity.min(256)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an encoded frame. Never blocks.
    ///
    /// Returns `false` when the frame was shed (queue closed, or full of
    /// critical frames and this one was droppable).
    pub fn push(&self, bytes: Arc<Vec<u8>>, droppable: bool) -> bool {
        let mut inner = self.inner.lock().expect("send queue poisoned");
        if inner.closed {
            return false;
        }

        if inner.frames.len() >= self.capacity {
            if let Some(pos) = inner.frames.iter().position(|f| f.droppable) {
                inner.frames.remove(pos);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            } else if droppable {
                // Every queued frame is critical; shed the newcomer.
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        inner.frames.push_back(QueuedFrame { bytes, droppable });
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Wait for the next frame. Drains remaining frames after close, then
    /// yields `None`.
    pub async fn pop(&self) -> Option<Arc<Vec<u8>>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("send queue poisoned");
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame.bytes);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue; pending frames stay poppable, new pushes fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("send queue poisoned");
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("send queue poisoned").frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames shed under backpressure since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Server-side binding between a connection and a room membership.
pub struct Session {
    pub user: UserInfo,
    pub conn: ConnId,
    pub room_id: String,
    pub joined_at: u64,
    last_activity: AtomicU64,
    queue: Arc<SendQueue>,
}

impl Session {
    pub fn new(conn: ConnId, queue: Arc<SendQueue>, user: UserInfo, room_id: String) -> Self {
        let now = now_ms();
        Self {
            user,
            conn,
            room_id,
            joined_at: now,
            last_activity: AtomicU64::new(now),
            queue,
        }
    }

    pub fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Enqueue a pre-encoded frame for this member.
    pub fn push(&self, bytes: Arc<Vec<u8>>, droppable: bool) -> bool {
        self.queue.push(bytes, droppable)
    }

    /// Encode and enqueue a targeted event.
    pub fn send(&self, event: &ServerEvent) -> bool {
        match event.encode() {
            Ok(bytes) => self.queue.push(Arc::new(bytes), event.droppable()),
            Err(e) => {
                log::error!("failed to encode event for {}: {e}", self.user.id);
                false
            }
        }
    }

    /// Close the member's outbound queue (stale sweep, shutdown).
    pub fn close(&self) {
        self.queue.close();
    }
}

/// Per-connection translation of wire events into room mutations.
///
/// Every handler resolves the session first; events from connections that
/// never joined (or whose room was reaped) are silently ignored. Log
/// failures on undo/redo are equally silent — concurrent duplicates are
/// expected and must stay idempotent.
pub struct SessionDispatcher {
    manager: Arc<RoomManager>,
    conn: ConnId,
    queue: Arc<SendQueue>,
}

impl SessionDispatcher {
    pub fn new(manager: Arc<RoomManager>, conn: ConnId, queue: Arc<SendQueue>) -> Self {
        Self {
            manager,
            conn,
            queue,
        }
    }

    /// Route one decoded client event.
    pub async fn dispatch(&self, event: ClientEvent) {
        match event {
            ClientEvent::JoinRoom { room_id, username } => self.on_join(room_id, username).await,
            ClientEvent::DrawStart {
                x,
                y,
                color,
                width,
                tool,
                timestamp,
            } => self.on_draw_start(x, y, color, width, tool, timestamp).await,
            ClientEvent::DrawBatch { points, timestamp } => {
                self.on_draw_batch(points, timestamp).await
            }
            ClientEvent::DrawEnd { stroke, timestamp } => self.on_draw_end(stroke, timestamp).await,
            ClientEvent::Undo { operation_id, .. } => self.on_undo(operation_id).await,
            ClientEvent::Redo { operation_id, .. } => self.on_redo(operation_id).await,
            ClientEvent::ClearCanvas { .. } => self.on_clear().await,
            ClientEvent::CursorMove { x, y, timestamp } => {
                self.on_cursor_move(x, y, timestamp).await
            }
            ClientEvent::MergeOps { operations } => self.on_merge(operations).await,
            ClientEvent::Ping => self.on_ping().await,
        }
    }

    /// Tear down on transport close: leave the room; the departure
    /// broadcast (`user_left` + fresh roster) happens inside the room.
    pub async fn disconnect(&self) {
        if let Some((session, room)) = self.manager.leave(self.conn).await {
            log::debug!(
                "connection {} disconnected from room {} as {}",
                self.conn,
                room.id(),
                session.user.id
            );
        }
    }

    async fn on_join(&self, room_id: String, username: Option<String>) {
        match self
            .manager
            .join(self.conn, self.queue.clone(), &room_id, username)
            .await
        {
            // The room already delivered the ack, roster, and history.
            Ok(_outcome) => {}
            Err(e) => {
                log::warn!("join to {room_id} denied for connection {}: {e}", self.conn);
                self.reply(&ServerEvent::join_denied(e.code()));
            }
        }
    }

    async fn on_draw_start(
        &self,
        x: f64,
        y: f64,
        color: String,
        width: u32,
        tool: Tool,
        timestamp: u64,
    ) {
        let Some((session, room)) = self.manager.lookup(self.conn).await else {
            return;
        };
        session.touch();
        room.touch();
        room.broadcast_ephemeral(
            &ServerEvent::RemoteDrawBatch {
                user_id: session.user.id.clone(),
                points: vec![Point::new(x, y)],
                color: Some(color),
                width: Some(width),
                tool: Some(tool),
                timestamp,
            },
            Some(self.conn),
        )
        .await;
    }

    async fn on_draw_batch(&self, points: Vec<Point>, timestamp: u64) {
        let Some((session, room)) = self.manager.lookup(self.conn).await else {
            return;
        };
        session.touch();
        room.touch();
        room.broadcast_ephemeral(
            &ServerEvent::RemoteDrawBatch {
                user_id: session.user.id.clone(),
                points,
                color: None,
                width: None,
                tool: None,
                timestamp,
            },
            Some(self.conn),
        )
        .await;
    }

    async fn on_draw_end(&self, stroke: Stroke, _timestamp: u64) {
        let Some((session, room)) = self.manager.lookup(self.conn).await else {
            return;
        };
        session.touch();
        let op = room
            .apply_draw_end(&session.user.id, stroke, self.conn)
            .await;
        log::debug!("stroke {} logged in room {}", op.id, room.id());
    }

    async fn on_undo(&self, operation_id: Option<String>) {
        let Some((session, room)) = self.manager.lookup(self.conn).await else {
            return;
        };
        session.touch();
        room.apply_undo(&session.user.id, operation_id).await;
    }

    async fn on_redo(&self, operation_id: Option<String>) {
        let Some((session, room)) = self.manager.lookup(self.conn).await else {
            return;
        };
        session.touch();
        room.apply_redo(&session.user.id, operation_id).await;
    }

    async fn on_clear(&self) {
        let Some((session, room)) = self.manager.lookup(self.conn).await else {
            return;
        };
        session.touch();
        room.apply_clear(&session.user.id).await;
    }

    async fn on_cursor_move(&self, x: f64, y: f64, timestamp: u64) {
        let Some((session, room)) = self.manager.lookup(self.conn).await else {
            return;
        };
        session.touch();
        room.broadcast_ephemeral(
            &ServerEvent::RemoteCursor {
                user_id: session.user.id.clone(),
                x,
                y,
                timestamp,
            },
            Some(self.conn),
        )
        .await;
    }

    async fn on_merge(&self, operations: Vec<crate::oplog::Operation>) {
        let Some((session, room)) = self.manager.lookup(self.conn).await else {
            return;
        };
        session.touch();
        let outcome = room.apply_merge(operations).await;
        log::debug!(
            "merged {} ops into room {} ({} total)",
            outcome.merged_count,
            room.id(),
            outcome.total_count
        );
    }

    async fn on_ping(&self) {
        self.manager.touch(self.conn).await;
        self.reply(&ServerEvent::Pong);
    }

    fn reply(&self, event: &ServerEvent) {
        if let Ok(bytes) = event.encode() {
            self.queue.push(Arc::new(bytes), event.droppable());
        }
    }
}
