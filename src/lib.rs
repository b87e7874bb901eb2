//! # easel-collab — Real-time collaboration core for Easel
//!
//! The server-side room engine of a multi-user canvas drawing service:
//! it ingests drawing and control events from many concurrent clients,
//! serializes them into a causally-ordered, tombstoned operation log per
//! room, fans broadcasts out to all participants, and materializes
//! on-join snapshots for late joiners.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐      WebSocket      ┌──────────────────┐
//! │ CollabClient│ ◄─────────────────► │ CollabServer     │
//! │ (per user)  │     Binary Proto    │ (one task/conn)  │
//! └─────────────┘                     └────────┬─────────┘
//!                                              │
//!                                     SessionDispatcher
//!                                              │
//!                                        RoomManager
//!                                       ┌──────┴──────┐
//!                                       ▼             ▼
//!                                  Room "r1"      Room "r2"
//!                                ┌────────────┐ ┌────────────┐
//!                                │ membership │ │ membership │
//!                                │ OperationLog │ OperationLog
//!                                │ VectorClock│ │ VectorClock│
//!                                └────────────┘ └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded event enums)
//! - [`clock`] — Vector clocks and causal comparison
//! - [`oplog`] — Tombstoned, causally-sorted operation log
//! - [`room`] — Membership, palette, single-writer room engine
//! - [`manager`] — Room/session directory, admission, reaping
//! - [`session`] — Per-connection send queue and event dispatcher
//! - [`server`] — WebSocket accept loop
//! - [`client`] — Typed client for tools and tests
//! - [`http`] — `/health` and `/stats` side channels

pub mod protocol;
pub mod clock;
pub mod oplog;
pub mod room;
pub mod manager;
pub mod session;
pub mod server;
pub mod client;
pub mod http;

// Re-exports for convenience
pub use protocol::{
    ClientEvent, Point, ProtocolError, RoomInfo, ServerEvent, Stroke, Tool, UserInfo,
};
pub use clock::{Causality, VectorClock};
pub use oplog::{
    ExportedLog, LogError, LogSnapshot, MergeOutcome, OpData, OpState, Operation, OperationLog,
};
pub use room::{Room, RoomFull, PALETTE};
pub use manager::{JoinError, JoinOutcome, ManagerConfig, ManagerStats, RoomManager};
pub use session::{ConnId, SendQueue, Session, SessionDispatcher};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use client::{ClientError, CollabClient, ConnectionState};
