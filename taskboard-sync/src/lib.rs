//! # taskboard-sync — Real-time board server and client
//!
//! Applies board mutations against a durable store and fans the resulting
//! events out to every connection viewing the board.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ BoardClient │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                   ┌─────────────────┐
//! │ Reconciler  │                   │ MutationApplier │
//! │ (replica)   │                   │ (authority)     │
//! └─────────────┘                   └────┬───────┬────┘
//!                                        │       │
//!                              ┌─────────┴─┐   ┌─┴────────────┐
//!                              │ RecordStore│   │ RoomRegistry │
//!                              │ (RocksDB)  │   │ (fan-out)    │
//!                              └────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`] — Record store trait, RocksDB and in-memory backends
//! - [`applier`] — Validated, serialized board mutations
//! - [`broadcast`] — Per-board rooms with backpressure
//! - [`protocol`] — Binary wire protocol (bincode-encoded frames)
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client with optimistic replicas

pub mod applier;
pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use applier::{MovedTask, MutationApplier, DEFAULT_ACTIVITY_LIMIT, MAX_ACTIVITY_LIMIT};
pub use broadcast::{BroadcastError, BroadcastStats, Broadcaster, RoomRegistry, SharedFrame};
pub use client::{BoardClient, ClientError, ClientEvent, ConnectionState};
pub use protocol::{Command, Frame, FrameKind, ProtocolError, Reply};
pub use server::{dispatch, ServerConfig, ServerStats, SyncServer};
pub use storage::{
    AnyStore, Collection, Filter, MemoryStore, RawBatch, Record, RecordStore, RocksStore, Scope,
    StoreConfig, StoreError,
};
