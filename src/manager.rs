//! Process-wide directory of rooms and sessions.
//!
//! ```text
//! connection ──join──► RoomManager ──get-or-create──► Room
//!                           │                           │
//!                     sessions: conn → Session    members: user → Session
//! ```
//!
//! Invariant: every session referenced by a room's membership is also in
//! the global session index and vice-versa. `join` and `leave` maintain
//! both sides; the reaper removes both sides when it sweeps an inhabited
//! stale room.
//!
//! Lifecycle timers:
//! - a room left empty gets a deletion check after a 60 s grace period,
//!   which deletes only if it is still empty and still idle;
//! - the reaper runs every 5 minutes and deletes rooms empty for ≥ 5
//!   minutes, plus any room with no activity for ≥ 1 hour even if it
//!   still has members (stale-session sweep).
//!
//! Deletion tasks hold only the manager maps, never a room, so a deleted
//! room is collected as soon as its last connection drops.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{now_ms, ServerEvent};
use crate::room::{Room, RoomFull};
use crate::session::{ConnId, SendQueue, Session};

const NAME_ADJECTIVES: [&str; 12] = [
    "brisk", "mellow", "quiet", "dapper", "plucky", "wobbly", "zesty", "drowsy", "jaunty", "spry",
    "velvet", "amber",
];

const NAME_CREATURES: [&str; 12] = [
    "otter", "heron", "lynx", "badger", "puffin", "newt", "marmot", "ibis", "gecko", "wombat",
    "stoat", "plover",
];

/// Opaque `user_<timestamp>_<nonce>` identifier.
fn generate_user_id() -> (String, u128) {
    let nonce = Uuid::new_v4().as_u128();
    (format!("user_{}_{:08x}", now_ms(), (nonce as u32)), nonce)
}

/// Display name for clients that join without one, stable per identity.
fn whimsical_name(seed: u128) -> String {
    let adjective = NAME_ADJECTIVES[(seed as usize) % NAME_ADJECTIVES.len()];
    let creature =
        NAME_CREATURES[((seed >> 32) as usize) % NAME_CREATURES.len()];
    format!("{adjective} {creature}")
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Admission cap per room.
    pub max_users_per_room: usize,
    /// Operation log cap per room.
    pub max_operations: usize,
    /// How long an empty room survives after its last member leaves.
    pub empty_room_grace: Duration,
    /// Reaper rule: delete rooms empty at least this long.
    pub empty_room_reap: Duration,
    /// Reaper rule: delete rooms idle at least this long, members or not.
    pub stale_room_reap: Duration,
    /// Reaper cadence.
    pub reap_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_users_per_room: 20,
            max_operations: crate::oplog::MAX_OPERATIONS,
            empty_room_grace: Duration::from_secs(60),
            empty_room_reap: Duration::from_secs(5 * 60),
            stale_room_reap: Duration::from_secs(60 * 60),
            reap_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Admission errors, surfaced to the joiner via the ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    RoomFull,
    AlreadyJoined,
}

impl JoinError {
    /// Short grepable code carried in the ack.
    pub fn code(&self) -> &'static str {
        match self {
            JoinError::RoomFull => "room_full",
            JoinError::AlreadyJoined => "already_joined",
        }
    }
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinError::RoomFull => write!(f, "room is full"),
            JoinError::AlreadyJoined => write!(f, "connection already joined a room"),
        }
    }
}

impl std::error::Error for JoinError {}

/// A successful admission.
pub struct JoinOutcome {
    pub session: Arc<Session>,
    pub room: Arc<Room>,
}

/// Per-room stats entry.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub id: String,
    pub user_count: usize,
    pub operation_count: usize,
    pub created_at: u64,
    pub idle_ms: u64,
}

/// Manager-wide stats, served by the HTTP side channel.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub room_count: usize,
    pub session_count: usize,
    pub rooms: Vec<RoomStats>,
}

/// The room and session directory.
pub struct RoomManager {
    config: ManagerConfig,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    sessions: RwLock<HashMap<ConnId, Arc<Session>>>,
}

impl RoomManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ManagerConfig::default())
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Admit a connection into a room, creating the room lazily.
    ///
    /// On success the joiner's queue already holds the ack, the roster,
    /// and the history sync; everyone else already holds `user_joined`.
    pub async fn join(
        self: &Arc<Self>,
        conn: ConnId,
        queue: Arc<SendQueue>,
        room_id: &str,
        username: Option<String>,
    ) -> Result<JoinOutcome, JoinError> {
        if self.sessions.read().await.contains_key(&conn) {
            return Err(JoinError::AlreadyJoined);
        }

        let room = self.get_or_create(room_id).await;

        let (user_id, nonce) = generate_user_id();
        let name = username
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| whimsical_name(nonce));

        let session = room
            .admit(conn, queue, user_id, name)
            .await
            .map_err(|RoomFull| JoinError::RoomFull)?;

        // Re-index under the write lock: a grace-period deletion may have
        // raced the admission, and re-inserting the same Arc revives the
        // room under its original id with its log intact.
        {
            let mut rooms = self.rooms.write().await;
            rooms.entry(room_id.to_string()).or_insert_with(|| room.clone());
        }

        self.sessions.write().await.insert(conn, session.clone());

        log::info!(
            "{} ({}) joined room {room_id}",
            session.user.name,
            session.user.id
        );

        Ok(JoinOutcome { session, room })
    }

    /// Remove a connection from both indices. If the room ends up empty,
    /// schedule the grace-period deletion check.
    pub async fn leave(self: &Arc<Self>, conn: ConnId) -> Option<(Arc<Session>, Arc<Room>)> {
        let session = self.sessions.write().await.remove(&conn)?;
        let room = self.rooms.read().await.get(&session.room_id).cloned()?;

        room.depart(&session.user.id).await;
        log::info!(
            "{} ({}) left room {}",
            session.user.name,
            session.user.id,
            room.id()
        );

        if room.is_empty().await {
            let manager = Arc::clone(self);
            let room_id = session.room_id.clone();
            let grace = self.config.empty_room_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                manager.delete_if_abandoned(&room_id).await;
            });
        }

        Some((session, room))
    }

    /// Bump activity clocks for a connection and its room.
    pub async fn touch(&self, conn: ConnId) {
        let session = match self.sessions.read().await.get(&conn) {
            Some(s) => s.clone(),
            None => return,
        };
        session.touch();
        if let Some(room) = self.rooms.read().await.get(&session.room_id) {
            room.touch();
        }
    }

    /// Session for a connection, if it has joined.
    pub async fn session(&self, conn: ConnId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&conn).cloned()
    }

    /// Room by id.
    pub async fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Session plus its room for a connection. `None` (silently) when the
    /// connection never joined or the room has been reaped.
    pub async fn lookup(&self, conn: ConnId) -> Option<(Arc<Session>, Arc<Room>)> {
        let session = self.session(conn).await?;
        let room = self.room(&session.room_id).await?;
        Some((session, room))
    }

    /// Broadcast to one room. Unknown rooms are a silent no-op — a
    /// straggling broadcast after the reaper ran must not fail.
    pub async fn broadcast_to_room(
        &self,
        room_id: &str,
        event: &ServerEvent,
        exclude: Option<ConnId>,
    ) {
        if let Some(room) = self.room(room_id).await {
            room.broadcast(event, exclude).await;
        }
    }

    /// Broadcast to every room.
    pub async fn broadcast_to_all(&self, event: &ServerEvent) {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            room.broadcast(event, None).await;
        }
    }

    /// One reaper pass. Returns the number of rooms deleted.
    pub async fn reap(&self) -> usize {
        let empty_reap = self.config.empty_room_reap.as_millis() as u64;
        let stale_reap = self.config.stale_room_reap.as_millis() as u64;

        let mut removed = 0;
        let mut rooms = self.rooms.write().await;
        let candidates: Vec<Arc<Room>> = rooms.values().cloned().collect();

        for room in candidates {
            let empty = room.is_empty().await;
            let idle = room.idle_ms();

            let expired_empty = empty && idle >= empty_reap;
            let expired_stale = idle >= stale_reap;
            if !expired_empty && !expired_stale {
                continue;
            }

            rooms.remove(room.id());
            removed += 1;
            log::info!(
                "reaped room {} (empty: {empty}, idle {idle}ms)",
                room.id()
            );

            if !empty {
                // Stale-session sweep: drop the room's members from the
                // global index and close their queues so the connection
                // loops wind down.
                let mut sessions = self.sessions.write().await;
                for session in room.members().await {
                    sessions.remove(&session.conn);
                    session.close();
                }
            }
        }

        removed
    }

    /// Run the reaper on its configured cadence until the handle is
    /// dropped or aborted.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.reap_interval);
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                let removed = manager.reap().await;
                if removed > 0 {
                    log::debug!("reaper removed {removed} rooms");
                }
            }
        })
    }

    /// Current manager stats.
    pub async fn stats(&self) -> ManagerStats {
        let rooms = self.rooms.read().await;
        let mut entries = Vec::with_capacity(rooms.len());
        for room in rooms.values() {
            entries.push(RoomStats {
                id: room.id().to_string(),
                user_count: room.member_count().await,
                operation_count: room.operation_count().await,
                created_at: room.created_at(),
                idle_ms: room.idle_ms(),
            });
        }
        ManagerStats {
            room_count: rooms.len(),
            session_count: self.sessions.read().await.len(),
            rooms: entries,
        }
    }

    async fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let room = Arc::new(Room::new(
            room_id,
            self.config.max_users_per_room,
            self.config.max_operations,
        ));
        rooms.insert(room_id.to_string(), room.clone());
        log::info!("created room {room_id}");
        room
    }

    /// Grace-period deletion check: delete only if the room is still
    /// empty and still idle. A join during the grace window makes this a
    /// no-op, which is how a pending deletion is "cancelled".
    async fn delete_if_abandoned(&self, room_id: &str) {
        let grace = self.config.empty_room_grace.as_millis() as u64;
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.is_empty().await && room.idle_ms() >= grace {
                rooms.remove(room_id);
                log::info!("deleted empty room {room_id} after grace period");
            }
        }
    }
}
