//! Append-only, tombstoned operation log — one per room.
//!
//! ```text
//! append(stroke) ──► [op1 active] [op2 active] [op3 active]
//! undo(op2)      ──► [op1 active] [op2 undone] [op3 active]
//! clear          ──► [op1 undone] [op2 undone] [op3 undone] [op4 clear, active]
//! redo(op2)      ──► [op1 undone] [op2 active] [op3 undone] [op4 clear, active]
//! ```
//!
//! Undo never removes anything: an undone operation stays in the log as a
//! tombstone so it can be redone, replayed to late joiners, and merged
//! across participants. Flipping an already-undone op to undone is a no-op,
//! which keeps duplicate messages from concurrent clients idempotent.
//! A stack-based undo cannot offer any of this without inventing inverse
//! operations.
//!
//! The log is capped: once `max_operations` is reached, appends drop the
//! oldest entry regardless of its state. A trimmed undone op is permanently
//! unredoable; callers see `not found` and stay silent. This is the
//! documented contract, not an accident.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock::{Causality, VectorClock};
use crate::protocol::{now_ms, Stroke};

/// Log capacity before front-trimming, per room.
pub const MAX_OPERATIONS: usize = 1000;

static OP_NONCE: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of an operation. The only mutable field after append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpState {
    Active,
    Undone,
}

/// Payload of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpData {
    Stroke(Stroke),
    /// Canvas clear; records how many operations it tombstoned.
    Clear { cleared: usize },
}

/// A durable record of a user-initiated canvas mutation.
///
/// Everything except `state` and the undo/redo audit fields is frozen at
/// append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Opaque id, unique within the room. Never parsed, only compared.
    pub id: String,
    pub user_id: String,
    pub data: OpData,
    pub state: OpState,
    /// Snapshot of the room clock at creation.
    pub clock: VectorClock,
    /// Wall-clock millis at creation. Tiebreaker for concurrent ops only.
    pub timestamp: u64,
    pub undone_by: Option<String>,
    pub undone_at: Option<u64>,
    pub redone_by: Option<String>,
    pub redone_at: Option<u64>,
}

impl Operation {
    pub fn is_active(&self) -> bool {
        self.state == OpState::Active
    }
}

/// Outcome of [`OperationLog::merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Operations that were new to this log.
    pub merged_count: usize,
    /// Log size after merge and trim.
    pub total_count: usize,
}

/// Ordered history plus clock, as sent to joiners and exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSnapshot {
    pub operations: Vec<Operation>,
    pub vector_clock: VectorClock,
    pub created_at: u64,
}

/// Serialized form of a whole log, for the export/import hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedLog {
    pub room_id: String,
    pub operations: Vec<Operation>,
    pub vector_clock: VectorClock,
    pub created_at: u64,
}

/// Log errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// No operation with this id (possibly trimmed away).
    NotFound(String),
    /// The operation exists but is not in the state the transition needs.
    WrongState(String),
    /// Import attempted with a snapshot from a different room.
    RoomMismatch { expected: String, found: String },
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::NotFound(id) => write!(f, "operation not found: {id}"),
            LogError::WrongState(id) => write!(f, "operation in wrong state: {id}"),
            LogError::RoomMismatch { expected, found } => {
                write!(f, "log import room mismatch: expected {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for LogError {}

/// Sort operations causally: happens-before first, concurrent ops broken
/// by timestamp, then id. Stable and deterministic — resorting a sorted
/// slice is a no-op.
pub fn sort_causal(ops: &mut [Operation]) {
    ops.sort_by(|a, b| match a.clock.causality(&b.clock) {
        Causality::Before => std::cmp::Ordering::Less,
        Causality::After => std::cmp::Ordering::Greater,
        Causality::Concurrent => a
            .timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.id.cmp(&b.id)),
    });
}

/// The per-room operation log.
pub struct OperationLog {
    room_id: String,
    ops: Vec<Operation>,
    clock: VectorClock,
    created_at: u64,
    max_operations: usize,
}

impl OperationLog {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self::with_capacity(room_id, MAX_OPERATIONS)
    }

    pub fn with_capacity(room_id: impl Into<String>, max_operations: usize) -> Self {
        Self {
            room_id: room_id.into(),
            ops: Vec::new(),
            clock: VectorClock::new(),
            created_at: now_ms(),
            max_operations,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Current room clock.
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Append a new operation authored by `user_id`.
    ///
    /// Increments the author's clock component, stamps the op with the
    /// resulting snapshot and current wall time, then trims from the front
    /// if the cap is exceeded.
    pub fn append(&mut self, user_id: &str, data: OpData) -> Operation {
        let now = now_ms();
        let clock = self.clock.increment(user_id);
        let nonce = OP_NONCE.fetch_add(1, Ordering::SeqCst);

        let op = Operation {
            id: format!("{user_id}_{now}_{nonce}"),
            user_id: user_id.to_string(),
            data,
            state: OpState::Active,
            clock,
            timestamp: now,
            undone_by: None,
            undone_at: None,
            redone_by: None,
            redone_at: None,
        };

        self.ops.push(op.clone());
        self.trim();
        op
    }

    /// Tombstone an active operation. Fails when the id is unknown
    /// (possibly trimmed) or the op is already undone.
    pub fn undo(&mut self, operation_id: &str, acting_user: &str) -> Result<Operation, LogError> {
        let op = self
            .ops
            .iter_mut()
            .find(|op| op.id == operation_id)
            .ok_or_else(|| LogError::NotFound(operation_id.to_string()))?;

        if op.state != OpState::Active {
            return Err(LogError::WrongState(operation_id.to_string()));
        }

        op.state = OpState::Undone;
        op.undone_by = Some(acting_user.to_string());
        op.undone_at = Some(now_ms());
        Ok(op.clone())
    }

    /// Re-activate an undone operation. Symmetric to [`Self::undo`].
    pub fn redo(&mut self, operation_id: &str, acting_user: &str) -> Result<Operation, LogError> {
        let op = self
            .ops
            .iter_mut()
            .find(|op| op.id == operation_id)
            .ok_or_else(|| LogError::NotFound(operation_id.to_string()))?;

        if op.state != OpState::Undone {
            return Err(LogError::WrongState(operation_id.to_string()));
        }

        op.state = OpState::Active;
        op.redone_by = Some(acting_user.to_string());
        op.redone_at = Some(now_ms());
        Ok(op.clone())
    }

    /// Clear the canvas: tombstone every currently-active op (attributed to
    /// `acting_user`), then append a clear op recording how many were
    /// flipped.
    ///
    /// The clear op itself is active, and undoable/redoable like any other.
    /// Redoing a clear re-activates only the clear op — the ops it
    /// tombstoned stay tombstoned. The post-clear state is what the clear
    /// records as "cleared".
    pub fn clear(&mut self, acting_user: &str) -> Operation {
        let now = now_ms();
        let mut cleared = 0;
        for op in &mut self.ops {
            if op.state == OpState::Active {
                op.state = OpState::Undone;
                op.undone_by = Some(acting_user.to_string());
                op.undone_at = Some(now);
                cleared += 1;
            }
        }
        self.append(acting_user, OpData::Clear { cleared })
    }

    /// Newest active operation, scanning backward. Used when a client
    /// sends `undo` without an id — global undo, regardless of author.
    pub fn last_active(&self) -> Option<&Operation> {
        self.ops.iter().rev().find(|op| op.state == OpState::Active)
    }

    /// Newest undone operation, scanning backward. The `redo` counterpart.
    pub fn last_undone(&self) -> Option<&Operation> {
        self.ops.iter().rev().find(|op| op.state == OpState::Undone)
    }

    /// Look up an operation by id.
    pub fn get(&self, operation_id: &str) -> Option<&Operation> {
        self.ops.iter().find(|op| op.id == operation_id)
    }

    /// Merge externally-held operations (a rejoining peer's local history).
    ///
    /// Deduplicates by id; new ops merge their clocks into the room clock.
    /// The whole log is then resorted causally — late-arriving ops may
    /// precede local ones — and trimmed to the cap. Idempotent by id.
    pub fn merge(&mut self, external: Vec<Operation>) -> MergeOutcome {
        let known: HashSet<String> = self.ops.iter().map(|op| op.id.clone()).collect();
        let mut merged_count = 0;

        for op in external {
            if known.contains(&op.id) {
                continue;
            }
            self.clock.merge(&op.clock);
            self.ops.push(op);
            merged_count += 1;
        }

        if merged_count > 0 {
            sort_causal(&mut self.ops);
            self.trim();
        }

        MergeOutcome {
            merged_count,
            total_count: self.ops.len(),
        }
    }

    /// Ordered history for on-join sync and export.
    pub fn snapshot(&self) -> LogSnapshot {
        LogSnapshot {
            operations: self.ops.clone(),
            vector_clock: self.clock.clone(),
            created_at: self.created_at,
        }
    }

    /// Serialize the whole log for a future store.
    pub fn export(&self) -> ExportedLog {
        ExportedLog {
            room_id: self.room_id.clone(),
            operations: self.ops.clone(),
            vector_clock: self.clock.clone(),
            created_at: self.created_at,
        }
    }

    /// Restore a previously exported log. The export must come from the
    /// same room.
    pub fn import(&mut self, exported: ExportedLog) -> Result<(), LogError> {
        if exported.room_id != self.room_id {
            return Err(LogError::RoomMismatch {
                expected: self.room_id.clone(),
                found: exported.room_id,
            });
        }
        self.ops = exported.operations;
        self.clock = exported.vector_clock;
        self.created_at = exported.created_at;
        self.trim();
        Ok(())
    }

    fn trim(&mut self) {
        if self.ops.len() > self.max_operations {
            let excess = self.ops.len() - self.max_operations;
            self.ops.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Point, Tool};

    fn stroke() -> OpData {
        OpData::Stroke(Stroke {
            points: vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)],
            color: "#e6194b".to_string(),
            width: 3,
            tool: Tool::Brush,
            is_complete: true,
        })
    }

    #[test]
    fn test_append_stamps_clock_and_id() {
        let mut log = OperationLog::new("r1");
        let op1 = log.append("alice", stroke());
        let op2 = log.append("alice", stroke());
        let op3 = log.append("bob", stroke());

        assert_eq!(op1.clock.get("alice"), 1);
        assert_eq!(op2.clock.get("alice"), 2);
        assert_eq!(op3.clock.get("alice"), 2);
        assert_eq!(op3.clock.get("bob"), 1);

        // Each op's author component is at least 1 and the room clock
        // dominates every stamped snapshot.
        assert!(op1.clock.get("alice") >= 1);
        assert!(log.clock().dominates(&op1.clock));
        assert!(log.clock().dominates(&op3.clock));

        // Ids unique.
        assert_ne!(op1.id, op2.id);
        assert_ne!(op2.id, op3.id);
    }

    #[test]
    fn test_undo_redo_transitions() {
        let mut log = OperationLog::new("r1");
        let op = log.append("alice", stroke());

        let undone = log.undo(&op.id, "bob").unwrap();
        assert_eq!(undone.state, OpState::Undone);
        assert_eq!(undone.undone_by.as_deref(), Some("bob"));
        assert!(undone.undone_at.is_some());

        let redone = log.redo(&op.id, "alice").unwrap();
        assert_eq!(redone.state, OpState::Active);
        assert_eq!(redone.redone_by.as_deref(), Some("alice"));
    }

    #[test]
    fn test_undo_is_idempotent_failure() {
        let mut log = OperationLog::new("r1");
        let op = log.append("alice", stroke());

        log.undo(&op.id, "alice").unwrap();
        // Second undo finds the op already undone: structured failure,
        // state unchanged.
        assert_eq!(
            log.undo(&op.id, "alice"),
            Err(LogError::WrongState(op.id.clone()))
        );
        assert_eq!(log.get(&op.id).unwrap().state, OpState::Undone);
    }

    #[test]
    fn test_redo_requires_undone() {
        let mut log = OperationLog::new("r1");
        let op = log.append("alice", stroke());

        assert_eq!(
            log.redo(&op.id, "alice"),
            Err(LogError::WrongState(op.id.clone()))
        );

        log.undo(&op.id, "alice").unwrap();
        log.redo(&op.id, "alice").unwrap();
        assert_eq!(
            log.redo(&op.id, "alice"),
            Err(LogError::WrongState(op.id))
        );
    }

    #[test]
    fn test_unknown_id() {
        let mut log = OperationLog::new("r1");
        assert_eq!(
            log.undo("nope", "alice"),
            Err(LogError::NotFound("nope".to_string()))
        );
        assert_eq!(
            log.redo("nope", "alice"),
            Err(LogError::NotFound("nope".to_string()))
        );
    }

    #[test]
    fn test_clear_tombstones_everything_active() {
        let mut log = OperationLog::new("r1");
        let op1 = log.append("alice", stroke());
        let op2 = log.append("bob", stroke());
        log.undo(&op2.id, "bob").unwrap();

        let clear = log.clear("carol");
        assert_eq!(clear.data, OpData::Clear { cleared: 1 });
        assert!(clear.is_active());

        assert_eq!(log.get(&op1.id).unwrap().state, OpState::Undone);
        assert_eq!(log.get(&op1.id).unwrap().undone_by.as_deref(), Some("carol"));
        // op2 was already undone; untouched.
        assert_eq!(log.get(&op2.id).unwrap().undone_by.as_deref(), Some("bob"));
    }

    #[test]
    fn test_redo_of_clear_does_not_restore() {
        let mut log = OperationLog::new("r1");
        let op1 = log.append("alice", stroke());
        let clear = log.clear("alice");

        log.undo(&clear.id, "alice").unwrap();
        log.redo(&clear.id, "alice").unwrap();

        // The clear op is active again; what it cleared stays tombstoned.
        assert!(log.get(&clear.id).unwrap().is_active());
        assert_eq!(log.get(&op1.id).unwrap().state, OpState::Undone);
    }

    #[test]
    fn test_last_active_and_last_undone() {
        let mut log = OperationLog::new("r1");
        assert!(log.last_active().is_none());
        assert!(log.last_undone().is_none());

        let op1 = log.append("alice", stroke());
        let op2 = log.append("bob", stroke());

        assert_eq!(log.last_active().unwrap().id, op2.id);

        log.undo(&op2.id, "alice").unwrap();
        assert_eq!(log.last_active().unwrap().id, op1.id);
        assert_eq!(log.last_undone().unwrap().id, op2.id);

        log.undo(&op1.id, "alice").unwrap();
        assert!(log.last_active().is_none());
    }

    #[test]
    fn test_trim_drops_oldest() {
        let mut log = OperationLog::with_capacity("r1", 3);
        let op1 = log.append("a", stroke());
        log.append("a", stroke());
        log.append("a", stroke());
        assert_eq!(log.len(), 3);

        log.append("a", stroke());
        assert_eq!(log.len(), 3);
        assert!(log.get(&op1.id).is_none());

        // Undoing the trimmed id reports not-found.
        assert_eq!(log.undo(&op1.id, "a"), Err(LogError::NotFound(op1.id)));
    }

    #[test]
    fn test_merge_dedupes_and_is_idempotent() {
        let mut log = OperationLog::new("r1");
        log.append("a", stroke());

        // A disconnected peer's local history.
        let mut remote = OperationLog::new("r1");
        let r1 = remote.append("b", stroke());
        let r2 = remote.append("b", stroke());

        let outcome = log.merge(vec![r1.clone(), r2.clone()]);
        assert_eq!(outcome.merged_count, 2);
        assert_eq!(outcome.total_count, 3);
        assert_eq!(log.clock().get("b"), 2);

        // Same merge again: nothing new, log unchanged.
        let before = log.snapshot();
        let outcome = log.merge(vec![r1, r2]);
        assert_eq!(outcome.merged_count, 0);
        assert_eq!(log.snapshot(), before);
    }

    #[test]
    fn test_merge_resorts_causally() {
        let mut log = OperationLog::new("r1");

        // Remote ops created first (earlier timestamps, independent clock).
        let mut remote = OperationLog::new("r1");
        let r1 = remote.append("b", stroke());

        std::thread::sleep(std::time::Duration::from_millis(2));
        let local = log.append("a", stroke());

        log.merge(vec![r1.clone()]);
        let snap = log.snapshot();

        // Concurrent clocks: timestamp decides, so the remote op sorts first.
        assert_eq!(snap.operations[0].id, r1.id);
        assert_eq!(snap.operations[1].id, local.id);
    }

    #[test]
    fn test_sort_causal_stable_and_repeatable() {
        let mut log = OperationLog::new("r1");
        for _ in 0..5 {
            log.append("a", stroke());
        }
        let mut remote = OperationLog::new("r1");
        for _ in 0..5 {
            remote.append("b", stroke());
        }
        log.merge(remote.snapshot().operations);

        let mut once = log.snapshot().operations;
        sort_causal(&mut once);
        let mut twice = once.clone();
        sort_causal(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_export_import_roundtrip() {
        let mut log = OperationLog::new("r1");
        let op = log.append("alice", stroke());
        log.undo(&op.id, "alice").unwrap();
        log.clear("bob");

        let exported = log.export();
        let mut restored = OperationLog::new("r1");
        restored.import(exported).unwrap();
        assert_eq!(restored.snapshot(), log.snapshot());
    }

    #[test]
    fn test_import_rejects_other_room() {
        let log = OperationLog::new("r1");
        let exported = log.export();

        let mut other = OperationLog::new("r2");
        assert_eq!(
            other.import(exported),
            Err(LogError::RoomMismatch {
                expected: "r2".to_string(),
                found: "r1".to_string(),
            })
        );
    }

    #[test]
    fn test_state_is_only_mutable_field() {
        let mut log = OperationLog::new("r1");
        let op = log.append("alice", stroke());
        let before = log.get(&op.id).unwrap().clone();

        log.undo(&op.id, "bob").unwrap();
        let after = log.get(&op.id).unwrap();

        assert_eq!(after.id, before.id);
        assert_eq!(after.user_id, before.user_id);
        assert_eq!(after.data, before.data);
        assert_eq!(after.clock, before.clock);
        assert_eq!(after.timestamp, before.timestamp);
    }
}
