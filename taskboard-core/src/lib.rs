//! Core model of the shared task board.
//!
//! Everything here is synchronous and storage agnostic: the record types,
//! the position ledger that orders lists and tasks, the move planner that
//! turns a drag into position updates, the canonical events, and the client
//! replica with its reconciler. `taskboard-sync` puts these behind a store,
//! a WebSocket server and a client.

pub mod error;
pub mod event;
pub mod ledger;
pub mod model;
pub mod planner;
pub mod reconciler;
pub mod replica;

pub use error::{BoardError, EntityKind};
pub use event::BoardEvent;
pub use ledger::{Position, Positioned};
pub use model::{
    Activity, ActivityAction, Board, BoardView, MoveTaskRequest, NewTask, Priority, Task,
    TaskList, TaskPatch, TaskView, User, UserSummary,
};
pub use planner::{plan_move, ContainerView, MovePlan, PlanError, PlanStep, PositionRange, Slot};
pub use reconciler::{
    CloseReason, LocalMutation, MergeOutcome, ReconcileError, Reconciler, ReplicaPhase, SyncState,
};
pub use replica::{BoardSnapshot, ListReplica};
