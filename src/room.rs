//! A collaborative room: one operation log, one membership, one palette.
//!
//! Concurrency contract: the log, the membership map, and the color seed
//! live behind a single writer lock, and every authoritative event
//! (stroke end, undo, redo, clear, join, leave) mutates and enqueues its
//! broadcast while holding that lock. Append order, state transitions,
//! and broadcast enqueue order therefore form one linear sequence per
//! room — every member observes the same relative order, including
//! `user_joined` relative to `draw_end`. Enqueueing is a non-blocking
//! push into each member's bounded send queue, so a slow peer never
//! blocks the writer.
//!
//! Ephemeral traffic (in-progress strokes, cursors) only takes the read
//! lock and is best-effort.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::oplog::{ExportedLog, LogSnapshot, MergeOutcome, OpData, Operation, OperationLog};
use crate::protocol::{now_ms, RoomInfo, ServerEvent, Stroke, UserInfo};
use crate::session::{ConnId, SendQueue, Session};

/// The fixed ten-color member palette.
pub const PALETTE: [&str; 10] = [
    "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6",
    "#bcf60c", "#008080",
];

/// Golden-angle hue rotation for members past the palette, converted from
/// HSL with high saturation so overflow colors stay distinct.
fn overflow_color(seed: usize) -> String {
    let hue = ((seed as f32) * 137.508) % 360.0 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0) as u8,
        (g * 255.0) as u8,
        (b * 255.0) as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Admission failure: the room is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomFull;

impl std::fmt::Display for RoomFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "room is full")
    }
}

impl std::error::Error for RoomFull {}

struct RoomState {
    members: HashMap<String, Arc<Session>>,
    log: OperationLog,
}

/// One collaborative session scope.
pub struct Room {
    id: String,
    created_at: u64,
    last_activity: AtomicU64,
    max_members: usize,
    color_seed: AtomicUsize,
    state: RwLock<RoomState>,
}

impl Room {
    pub fn new(id: impl Into<String>, max_members: usize, max_operations: usize) -> Self {
        let id = id.into();
        Self {
            created_at: now_ms(),
            last_activity: AtomicU64::new(now_ms()),
            max_members,
            color_seed: AtomicUsize::new(0),
            state: RwLock::new(RoomState {
                members: HashMap::new(),
                log: OperationLog::with_capacity(id.as_str(), max_operations),
            }),
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Millis since the last member-originated event.
    pub fn idle_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_activity.load(Ordering::Relaxed))
    }

    /// Bump the activity clock.
    pub fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.state.read().await.members.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.members.is_empty()
    }

    pub async fn operation_count(&self) -> usize {
        self.state.read().await.log.len()
    }

    pub async fn roster(&self) -> Vec<UserInfo> {
        let state = self.state.read().await;
        state.members.values().map(|s| s.user.clone()).collect()
    }

    /// Current member sessions (a snapshot; safe to iterate while the
    /// membership mutates).
    pub async fn members(&self) -> Vec<Arc<Session>> {
        self.state.read().await.members.values().cloned().collect()
    }

    /// First palette color no current member holds, falling back to a
    /// rotating golden-angle hue once the palette is exhausted.
    ///
    /// Availability is derived from the membership map on every call, so
    /// a departed member's color is free again without bookkeeping.
    fn assign_color(state: &RoomState, color_seed: &AtomicUsize) -> String {
        let used: Vec<&str> = state.members.values().map(|s| s.user.color.as_str()).collect();
        for color in PALETTE {
            if !used.contains(&color) {
                return color.to_string();
            }
        }
        overflow_color(color_seed.fetch_add(1, Ordering::Relaxed))
    }

    /// Admit a new member and deliver the whole join sequence while the
    /// writer lock is held: ack to the joiner, `user_joined` to everyone
    /// else, the roster to the joiner, and — when the log is non-empty —
    /// a full `sync_state`. Nothing can interleave between the snapshot
    /// and its delivery.
    pub async fn admit(
        &self,
        conn: ConnId,
        queue: Arc<SendQueue>,
        user_id: String,
        name: String,
    ) -> Result<Arc<Session>, RoomFull> {
        let mut state = self.state.write().await;
        if state.members.len() >= self.max_members {
            return Err(RoomFull);
        }

        let color = Self::assign_color(&state, &self.color_seed);
        let user = UserInfo {
            id: user_id,
            name,
            color,
        };
        let session = Arc::new(Session::new(conn, queue, user.clone(), self.id.clone()));
        state.members.insert(user.id.clone(), session.clone());
        self.touch();

        let room_info = RoomInfo {
            id: self.id.clone(),
            user_count: state.members.len(),
            operation_count: state.log.len(),
        };
        session.send(&ServerEvent::join_ok(user.clone(), room_info));
        Self::fan_out(&state, &ServerEvent::UserJoined { user }, Some(conn));

        let roster: Vec<UserInfo> = state.members.values().map(|s| s.user.clone()).collect();
        session.send(&ServerEvent::UsersList { users: roster });
        if !state.log.is_empty() {
            session.send(&ServerEvent::SyncState {
                operations: state.log.snapshot().operations,
                timestamp: now_ms(),
            });
        }

        Ok(session)
    }

    /// Remove a member and tell the remainder, under one writer section.
    /// Returns the departed session, or `None` if the user was not here.
    pub async fn depart(&self, user_id: &str) -> Option<Arc<Session>> {
        let mut state = self.state.write().await;
        let session = state.members.remove(user_id)?;
        self.touch();

        Self::fan_out(
            &state,
            &ServerEvent::UserLeft {
                user: session.user.clone(),
            },
            None,
        );
        let users: Vec<UserInfo> = state.members.values().map(|s| s.user.clone()).collect();
        Self::fan_out(&state, &ServerEvent::UsersList { users }, None);

        Some(session)
    }

    /// Log a finished stroke and broadcast it to everyone but the author.
    pub async fn apply_draw_end(&self, user_id: &str, stroke: Stroke, exclude: ConnId) -> Operation {
        let mut state = self.state.write().await;
        self.touch();
        let op = state.log.append(user_id, OpData::Stroke(stroke.clone()));
        Self::fan_out(
            &state,
            &ServerEvent::RemoteDrawEnd {
                user_id: user_id.to_string(),
                stroke,
                operation_id: op.id.clone(),
                timestamp: op.timestamp,
            },
            Some(exclude),
        );
        op
    }

    /// Undo `operation_id` (or the newest active op when `None`) and tell
    /// the whole room, the actor included — the echo is how the actor's
    /// own client applies the authoritative state change.
    ///
    /// A missing target or an op already undone is a silent no-op: no
    /// broadcast, no error. Duplicate undos from concurrent clients are
    /// expected traffic.
    pub async fn apply_undo(&self, user_id: &str, operation_id: Option<String>) -> Option<Operation> {
        let mut state = self.state.write().await;
        self.touch();

        let target = match operation_id {
            Some(id) => id,
            None => state.log.last_active()?.id.clone(),
        };

        match state.log.undo(&target, user_id) {
            Ok(op) => {
                Self::fan_out(
                    &state,
                    &ServerEvent::RemoteUndo {
                        user_id: user_id.to_string(),
                        operation_id: op.id.clone(),
                        timestamp: now_ms(),
                    },
                    None,
                );
                Some(op)
            }
            Err(e) => {
                log::debug!("undo ignored in room {}: {e}", self.id);
                None
            }
        }
    }

    /// Redo counterpart of [`Self::apply_undo`].
    pub async fn apply_redo(&self, user_id: &str, operation_id: Option<String>) -> Option<Operation> {
        let mut state = self.state.write().await;
        self.touch();

        let target = match operation_id {
            Some(id) => id,
            None => state.log.last_undone()?.id.clone(),
        };

        match state.log.redo(&target, user_id) {
            Ok(op) => {
                Self::fan_out(
                    &state,
                    &ServerEvent::RemoteRedo {
                        user_id: user_id.to_string(),
                        operation_id: op.id.clone(),
                        timestamp: now_ms(),
                    },
                    None,
                );
                Some(op)
            }
            Err(e) => {
                log::debug!("redo ignored in room {}: {e}", self.id);
                None
            }
        }
    }

    /// Clear the canvas and tell the whole room, the actor included.
    pub async fn apply_clear(&self, user_id: &str) -> Operation {
        let mut state = self.state.write().await;
        self.touch();
        let op = state.log.clear(user_id);
        Self::fan_out(
            &state,
            &ServerEvent::RemoteClear {
                user_id: user_id.to_string(),
                timestamp: op.timestamp,
            },
            None,
        );
        op
    }

    /// Merge a rejoining peer's local history, then resync the whole room
    /// with the rebuilt ordered log.
    pub async fn apply_merge(&self, operations: Vec<Operation>) -> MergeOutcome {
        let mut state = self.state.write().await;
        self.touch();
        let outcome = state.log.merge(operations);
        if outcome.merged_count > 0 {
            let snapshot = state.log.snapshot();
            Self::fan_out(
                &state,
                &ServerEvent::SyncState {
                    operations: snapshot.operations,
                    timestamp: now_ms(),
                },
                None,
            );
        }
        outcome
    }

    /// Best-effort fan-out for ephemeral traffic (in-progress strokes,
    /// cursors). Takes only the read lock; frames are droppable under
    /// backpressure.
    pub async fn broadcast_ephemeral(&self, event: &ServerEvent, exclude: Option<ConnId>) {
        let members: Vec<Arc<Session>> = {
            let state = self.state.read().await;
            state.members.values().cloned().collect()
        };
        if let Ok(bytes) = event.encode() {
            let bytes = Arc::new(bytes);
            for session in members {
                if Some(session.conn) == exclude {
                    continue;
                }
                session.push(bytes.clone(), true);
            }
        }
    }

    /// Broadcast an authoritative event to current members. Public entry
    /// for callers outside the writer sections above (e.g. targeted
    /// resyncs); takes the read lock.
    pub async fn broadcast(&self, event: &ServerEvent, exclude: Option<ConnId>) {
        let state = self.state.read().await;
        Self::fan_out(&state, event, exclude);
    }

    /// Snapshot of the log for joiners and diagnostics.
    pub async fn log_snapshot(&self) -> LogSnapshot {
        self.state.read().await.log.snapshot()
    }

    /// Export the log for an external store.
    pub async fn export_log(&self) -> ExportedLog {
        self.state.read().await.log.export()
    }

    /// Encode once, push to every member queue except `exclude`.
    fn fan_out(state: &RoomState, event: &ServerEvent, exclude: Option<ConnId>) {
        let bytes = match event.encode() {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                log::error!("failed to encode broadcast: {e}");
                return;
            }
        };
        let droppable = event.droppable();
        for session in state.members.values() {
            if Some(session.conn) == exclude {
                continue;
            }
            session.push(bytes.clone(), droppable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Point, ServerEvent, Tool};
    use crate::session::SendQueue;

    fn stroke() -> Stroke {
        Stroke {
            points: vec![Point::new(0.0, 0.0)],
            color: "#e6194b".to_string(),
            width: 2,
            tool: Tool::Brush,
            is_complete: true,
        }
    }

    async fn admit(room: &Room, conn: ConnId, name: &str) -> (Arc<Session>, Arc<SendQueue>) {
        let queue = Arc::new(SendQueue::new(64));
        let admission = room
            .admit(conn, queue.clone(), format!("user_{conn}"), name.to_string())
            .await
            .unwrap();
        (admission, queue)
    }

    async fn next_event(queue: &SendQueue) -> ServerEvent {
        let bytes = queue.pop().await.expect("queue closed");
        ServerEvent::decode(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_admission_sequence() {
        let room = Room::new("r1", 20, 100);
        let (_a, queue_a) = admit(&room, 1, "alice").await;

        // Joiner sees ack then roster; the log is empty so no sync_state.
        assert!(matches!(
            next_event(&queue_a).await,
            ServerEvent::JoinAck { success: true, .. }
        ));
        match next_event(&queue_a).await {
            ServerEvent::UsersList { users } => assert_eq!(users.len(), 1),
            other => panic!("expected UsersList, got {other:?}"),
        }
        assert_eq!(queue_a.len(), 0);
    }

    #[tokio::test]
    async fn test_second_joiner_gets_sync_state() {
        let room = Room::new("r1", 20, 100);
        let (a, queue_a) = admit(&room, 1, "alice").await;
        room.apply_draw_end(&a.user.id, stroke(), 1).await;

        let (_b, queue_b) = admit(&room, 2, "bob").await;
        // Ack, roster, then the non-empty history.
        assert!(matches!(
            next_event(&queue_b).await,
            ServerEvent::JoinAck { success: true, .. }
        ));
        assert!(matches!(next_event(&queue_b).await, ServerEvent::UsersList { .. }));
        match next_event(&queue_b).await {
            ServerEvent::SyncState { operations, .. } => assert_eq!(operations.len(), 1),
            other => panic!("expected SyncState, got {other:?}"),
        }

        // Alice saw bob's arrival.
        // (skip her own join frames first)
        let _ = next_event(&queue_a).await; // JoinAck
        let _ = next_event(&queue_a).await; // UsersList
        assert!(matches!(next_event(&queue_a).await, ServerEvent::UserJoined { .. }));
    }

    #[tokio::test]
    async fn test_room_full() {
        let room = Room::new("r1", 2, 100);
        admit(&room, 1, "a").await;
        admit(&room, 2, "b").await;

        let queue = Arc::new(SendQueue::new(64));
        let result = room
            .admit(3, queue, "user_3".to_string(), "c".to_string())
            .await;
        assert!(matches!(result, Err(RoomFull)));
        assert_eq!(room.member_count().await, 2);

        // Departure restores admission.
        room.depart("user_1").await.unwrap();
        let queue = Arc::new(SendQueue::new(64));
        assert!(room
            .admit(3, queue, "user_3".to_string(), "c".to_string())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_no_duplicate_colors_within_palette() {
        let room = Room::new("r1", 20, 100);
        let mut colors = Vec::new();
        for conn in 0..PALETTE.len() as u64 {
            let (adm, _q) = admit(&room, conn, "u").await;
            colors.push(adm.user.color.clone());
        }
        let unique: std::collections::HashSet<_> = colors.iter().collect();
        assert_eq!(unique.len(), colors.len());
    }

    #[tokio::test]
    async fn test_color_returns_to_pool_on_departure() {
        let room = Room::new("r1", 20, 100);
        let (a, _qa) = admit(&room, 1, "a").await;
        let first_color = a.user.color.clone();

        room.depart(&a.user.id).await.unwrap();
        let (b, _qb) = admit(&room, 2, "b").await;
        assert_eq!(b.user.color, first_color);
    }

    #[tokio::test]
    async fn test_overflow_color_past_palette() {
        let room = Room::new("r1", 20, 100);
        for conn in 0..PALETTE.len() as u64 {
            admit(&room, conn, "u").await;
        }
        let (extra, _q) = admit(&room, 99, "extra").await;
        assert!(!PALETTE.contains(&extra.user.color.as_str()));
        assert!(extra.user.color.starts_with('#'));
    }

    #[tokio::test]
    async fn test_undo_echoes_to_actor() {
        let room = Room::new("r1", 20, 100);
        let (a, queue_a) = admit(&room, 1, "alice").await;
        let _ = next_event(&queue_a).await; // JoinAck
        let _ = next_event(&queue_a).await; // UsersList

        let op = room.apply_draw_end(&a.user.id, stroke(), 1).await;
        // The author is excluded from its own draw_end...
        assert_eq!(queue_a.len(), 0);

        // ...but undo comes back to everyone including the actor.
        let undone = room.apply_undo(&a.user.id, None).await.unwrap();
        assert_eq!(undone.id, op.id);
        match next_event(&queue_a).await {
            ServerEvent::RemoteUndo { operation_id, .. } => assert_eq!(operation_id, op.id),
            other => panic!("expected RemoteUndo, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_undo_is_silent() {
        let room = Room::new("r1", 20, 100);
        let (a, queue_a) = admit(&room, 1, "alice").await;
        let _ = next_event(&queue_a).await;
        let _ = next_event(&queue_a).await;

        let op = room.apply_draw_end(&a.user.id, stroke(), 1).await;
        assert!(room
            .apply_undo(&a.user.id, Some(op.id.clone()))
            .await
            .is_some());
        let _ = next_event(&queue_a).await; // RemoteUndo

        // Second identical undo: nothing happens, nothing is sent.
        assert!(room.apply_undo(&a.user.id, Some(op.id)).await.is_none());
        assert_eq!(queue_a.len(), 0);
    }

    #[tokio::test]
    async fn test_export_matches_snapshot() {
        let room = Room::new("r1", 20, 100);
        let (a, _qa) = admit(&room, 1, "alice").await;
        room.apply_draw_end(&a.user.id, stroke(), 1).await;
        room.apply_clear(&a.user.id).await;

        let snapshot = room.log_snapshot().await;
        let exported = room.export_log().await;
        assert_eq!(exported.room_id, "r1");
        assert_eq!(exported.operations, snapshot.operations);
        assert_eq!(exported.vector_clock, snapshot.vector_clock);
    }

    #[tokio::test]
    async fn test_merge_resyncs_room() {
        let room = Room::new("r1", 20, 100);
        let (_a, queue_a) = admit(&room, 1, "alice").await;
        let _ = next_event(&queue_a).await;
        let _ = next_event(&queue_a).await;

        let mut remote = OperationLog::new("r1");
        let remote_op = remote.append("ghost", OpData::Stroke(stroke()));

        let outcome = room.apply_merge(vec![remote_op]).await;
        assert_eq!(outcome.merged_count, 1);
        match next_event(&queue_a).await {
            ServerEvent::SyncState { operations, .. } => assert_eq!(operations.len(), 1),
            other => panic!("expected SyncState, got {other:?}"),
        }

        // Idempotent: merging nothing new emits nothing.
        let outcome = room.apply_merge(Vec::new()).await;
        assert_eq!(outcome.merged_count, 0);
        assert_eq!(queue_a.len(), 0);
    }
}
