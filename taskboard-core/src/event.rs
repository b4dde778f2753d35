//! Canonical mutation events.
//!
//! One event is created per successful write, after persistence, and fanned
//! out to every viewer of the board. Embedded records are denormalized.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::Position;
use crate::model::{BoardView, TaskList, TaskView, UserSummary};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoardEvent {
    ListCreated {
        list: TaskList,
    },
    ListUpdated {
        list: TaskList,
    },
    ListMoved {
        list: TaskList,
        board_id: Uuid,
        position: Position,
    },
    ListDeleted {
        board_id: Uuid,
        list_id: Uuid,
    },
    TaskCreated {
        task: TaskView,
    },
    TaskUpdated {
        task: TaskView,
    },
    TaskDeleted {
        board_id: Uuid,
        task_id: Uuid,
        list_id: Uuid,
    },
    TaskMoved {
        task: TaskView,
        source_list_id: Uuid,
        dest_list_id: Uuid,
        position: Position,
    },
    BoardUpdated {
        board: BoardView,
    },
    BoardDeleted {
        board_id: Uuid,
    },
    MemberAdded {
        board: BoardView,
        member: UserSummary,
    },
    MemberRemoved {
        board: BoardView,
        removed_user_id: Uuid,
    },
}

impl BoardEvent {
    /// Wire name, e.g. `task:moved`.
    pub fn name(&self) -> &'static str {
        match self {
            BoardEvent::ListCreated { .. } => "list:created",
            BoardEvent::ListUpdated { .. } => "list:updated",
            BoardEvent::ListMoved { .. } => "list:moved",
            BoardEvent::ListDeleted { .. } => "list:deleted",
            BoardEvent::TaskCreated { .. } => "task:created",
            BoardEvent::TaskUpdated { .. } => "task:updated",
            BoardEvent::TaskDeleted { .. } => "task:deleted",
            BoardEvent::TaskMoved { .. } => "task:moved",
            BoardEvent::BoardUpdated { .. } => "board:updated",
            BoardEvent::BoardDeleted { .. } => "board:deleted",
            BoardEvent::MemberAdded { .. } => "member:added",
            BoardEvent::MemberRemoved { .. } => "member:removed",
        }
    }

    /// Board whose room receives the event.
    pub fn board_id(&self) -> Uuid {
        match self {
            BoardEvent::ListCreated { list } | BoardEvent::ListUpdated { list } => list.board_id,
            BoardEvent::ListMoved { board_id, .. }
            | BoardEvent::ListDeleted { board_id, .. }
            | BoardEvent::TaskDeleted { board_id, .. }
            | BoardEvent::BoardDeleted { board_id } => *board_id,
            BoardEvent::TaskCreated { task }
            | BoardEvent::TaskUpdated { task }
            | BoardEvent::TaskMoved { task, .. } => task.board_id,
            BoardEvent::BoardUpdated { board }
            | BoardEvent::MemberAdded { board, .. }
            | BoardEvent::MemberRemoved { board, .. } => board.id,
        }
    }

    /// Ids of the lists, tasks or board this event settles.
    pub fn affected(&self) -> Vec<Uuid> {
        match self {
            BoardEvent::ListCreated { list }
            | BoardEvent::ListUpdated { list }
            | BoardEvent::ListMoved { list, .. } => vec![list.id],
            BoardEvent::ListDeleted { list_id, .. } => vec![*list_id],
            BoardEvent::TaskCreated { task } | BoardEvent::TaskUpdated { task } => vec![task.id],
            BoardEvent::TaskDeleted { task_id, .. } => vec![*task_id],
            BoardEvent::TaskMoved { task, .. } => vec![task.id],
            BoardEvent::BoardUpdated { board }
            | BoardEvent::MemberAdded { board, .. }
            | BoardEvent::MemberRemoved { board, .. } => vec![board.id],
            BoardEvent::BoardDeleted { board_id } => vec![*board_id],
        }
    }
}
