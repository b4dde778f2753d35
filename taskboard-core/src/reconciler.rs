//! Client-side reconciliation of optimistic edits against canonical events.
//!
//! ```text
//!  local action            canonical event           request failed
//!  ────────────►  Local  ─────────────────► Confirmed      │
//!                   │                                      ▼
//!                   └──────────────────────────────►  Reverted ──► (fresh snapshot) ──► Confirmed
//! ```
//!
//! The reconciler owns the board replica. Local actions are applied
//! immediately; every canonical event for the board, whether it echoes our
//! own request or comes from another actor, is applied unconditionally.
//! Events are not correlated with the requests that caused them. A failed
//! request throws the whole replica away: the only way back is a fresh
//! snapshot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::event::BoardEvent;
use crate::ledger::Position;
use crate::model::TaskPatch;
use crate::replica::BoardSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Changed locally, not yet settled by a canonical event.
    Local,
    /// Matches the last canonical event received.
    Confirmed,
    /// A local change whose request failed; waiting for a snapshot.
    Reverted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaPhase {
    /// No snapshot installed yet.
    Empty,
    Live,
    /// Replica discarded after a failed request.
    Reverted,
    /// Board deleted or access lost.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    BoardDeleted,
    RemovedFromBoard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    /// Event for another board, or no live replica to merge into.
    Ignored,
    Closed(CloseReason),
}

/// A user action applied optimistically before the server answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalMutation {
    MoveTask {
        task_id: Uuid,
        dest_list_id: Uuid,
        index: usize,
    },
    MoveList {
        list_id: Uuid,
        index: usize,
    },
    UpdateTask {
        task_id: Uuid,
        patch: TaskPatch,
    },
    RenameList {
        list_id: Uuid,
        title: String,
    },
    DeleteTask {
        task_id: Uuid,
    },
    DeleteList {
        list_id: Uuid,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("no live replica for board {0}")]
    NotLive(Uuid),

    #[error("task {0} is not in the replica")]
    UnknownTask(Uuid),

    #[error("list {0} is not in the replica")]
    UnknownList(Uuid),

    #[error("snapshot for board {got} does not belong to board {expected}")]
    WrongBoard { expected: Uuid, got: Uuid },
}

/// Owner of one board replica on a client.
#[derive(Debug)]
pub struct Reconciler {
    board_id: Uuid,
    user_id: Uuid,
    phase: ReplicaPhase,
    replica: Option<BoardSnapshot>,
    states: HashMap<Uuid, SyncState>,
}

impl Reconciler {
    pub fn new(board_id: Uuid, user_id: Uuid) -> Self {
        Self {
            board_id,
            user_id,
            phase: ReplicaPhase::Empty,
            replica: None,
            states: HashMap::new(),
        }
    }

    pub fn board_id(&self) -> Uuid {
        self.board_id
    }

    pub fn phase(&self) -> ReplicaPhase {
        self.phase
    }

    pub fn replica(&self) -> Option<&BoardSnapshot> {
        self.replica.as_ref()
    }

    pub fn sync_state(&self, id: Uuid) -> Option<SyncState> {
        self.states.get(&id).copied()
    }

    /// True until a snapshot is installed, and again after a failure.
    pub fn needs_snapshot(&self) -> bool {
        matches!(self.phase, ReplicaPhase::Empty | ReplicaPhase::Reverted)
    }

    /// Replace the replica with a fetched snapshot. Everything in it is
    /// `Confirmed`.
    pub fn install_snapshot(&mut self, snapshot: BoardSnapshot) -> Result<(), ReconcileError> {
        if snapshot.board.id != self.board_id {
            return Err(ReconcileError::WrongBoard {
                expected: self.board_id,
                got: snapshot.board.id,
            });
        }
        self.states.clear();
        self.states.insert(snapshot.board.id, SyncState::Confirmed);
        for list in &snapshot.lists {
            self.states.insert(list.list.id, SyncState::Confirmed);
            for task in &list.tasks {
                self.states.insert(task.id, SyncState::Confirmed);
            }
        }
        log::debug!(
            "Installed snapshot for board {} ({} lists)",
            self.board_id,
            snapshot.lists.len()
        );
        self.replica = Some(snapshot);
        self.phase = ReplicaPhase::Live;
        Ok(())
    }

    /// Apply a user action to the replica before the server confirms it.
    pub fn apply_local(&mut self, mutation: &LocalMutation) -> Result<(), ReconcileError> {
        if self.phase != ReplicaPhase::Live {
            return Err(ReconcileError::NotLive(self.board_id));
        }
        let replica = self
            .replica
            .as_mut()
            .ok_or(ReconcileError::NotLive(self.board_id))?;

        let touched = match mutation {
            LocalMutation::MoveTask {
                task_id,
                dest_list_id,
                index,
            } => {
                let task = replica
                    .task(*task_id)
                    .cloned()
                    .ok_or(ReconcileError::UnknownTask(*task_id))?;
                if replica.list(*dest_list_id).is_none() {
                    return Err(ReconcileError::UnknownList(*dest_list_id));
                }
                replica.move_task(task, *dest_list_id, *index);
                *task_id
            }
            LocalMutation::MoveList { list_id, index } => {
                let list = replica
                    .list(*list_id)
                    .map(|l| l.list.clone())
                    .ok_or(ReconcileError::UnknownList(*list_id))?;
                replica.move_list(list, *index);
                *list_id
            }
            LocalMutation::UpdateTask { task_id, patch } => {
                let mut task = replica
                    .task(*task_id)
                    .cloned()
                    .ok_or(ReconcileError::UnknownTask(*task_id))?;
                task.apply_patch(patch);
                replica.merge_task(task);
                *task_id
            }
            LocalMutation::RenameList { list_id, title } => {
                let mut list = replica
                    .list(*list_id)
                    .map(|l| l.list.clone())
                    .ok_or(ReconcileError::UnknownList(*list_id))?;
                list.title = title.clone();
                replica.merge_list(list);
                *list_id
            }
            LocalMutation::DeleteTask { task_id } => {
                replica
                    .remove_task(*task_id)
                    .ok_or(ReconcileError::UnknownTask(*task_id))?;
                *task_id
            }
            LocalMutation::DeleteList { list_id } => {
                replica
                    .remove_list(*list_id)
                    .ok_or(ReconcileError::UnknownList(*list_id))?;
                *list_id
            }
        };
        self.states.insert(touched, SyncState::Local);
        Ok(())
    }

    /// Merge a canonical event. Applying the same event twice has the same
    /// effect as applying it once.
    pub fn apply_event(&mut self, event: &BoardEvent) -> MergeOutcome {
        if event.board_id() != self.board_id || self.phase != ReplicaPhase::Live {
            return MergeOutcome::Ignored;
        }
        match event {
            BoardEvent::BoardDeleted { .. } => return self.close(CloseReason::BoardDeleted),
            BoardEvent::MemberRemoved {
                removed_user_id, ..
            } if *removed_user_id == self.user_id => {
                return self.close(CloseReason::RemovedFromBoard)
            }
            _ => {}
        }
        let Some(replica) = self.replica.as_mut() else {
            return MergeOutcome::Ignored;
        };

        match event {
            BoardEvent::BoardDeleted { .. } => {}
            BoardEvent::BoardUpdated { board }
            | BoardEvent::MemberAdded { board, .. }
            | BoardEvent::MemberRemoved { board, .. } => replica.merge_board(board.clone()),
            BoardEvent::ListCreated { list } | BoardEvent::ListUpdated { list } => {
                replica.merge_list(list.clone())
            }
            BoardEvent::ListMoved { list, position, .. } => {
                replica.move_list(list.clone(), index_of(*position))
            }
            BoardEvent::ListDeleted { list_id, .. } => {
                replica.remove_list(*list_id);
            }
            BoardEvent::TaskCreated { task } | BoardEvent::TaskUpdated { task } => {
                replica.merge_task(task.clone())
            }
            BoardEvent::TaskDeleted { task_id, .. } => {
                replica.remove_task(*task_id);
            }
            BoardEvent::TaskMoved {
                task,
                dest_list_id,
                position,
                ..
            } => replica.move_task(task.clone(), *dest_list_id, index_of(*position)),
        }

        for id in event.affected() {
            self.states.insert(id, SyncState::Confirmed);
        }
        log::trace!("Merged {} into board {}", event.name(), self.board_id);
        MergeOutcome::Applied
    }

    /// One of our requests failed. Drop the replica; only a fresh snapshot
    /// brings it back.
    pub fn request_failed(&mut self) {
        if self.phase == ReplicaPhase::Closed {
            return;
        }
        log::warn!(
            "Request for board {} failed, discarding local replica",
            self.board_id
        );
        for state in self.states.values_mut() {
            if *state == SyncState::Local {
                *state = SyncState::Reverted;
            }
        }
        self.replica = None;
        self.phase = ReplicaPhase::Reverted;
    }

    /// Navigating away. A later rejoin starts from an empty replica.
    pub fn leave(&mut self) {
        self.replica = None;
        self.states.clear();
        self.phase = ReplicaPhase::Empty;
    }

    fn close(&mut self, reason: CloseReason) -> MergeOutcome {
        log::info!("Board {} closed: {reason:?}", self.board_id);
        self.replica = None;
        self.states.clear();
        self.phase = ReplicaPhase::Closed;
        MergeOutcome::Closed(reason)
    }
}

fn index_of(position: Position) -> usize {
    position.max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoardView, Task, TaskList, User, UserSummary};
    use crate::replica::ListReplica;

    struct Fixture {
        owner: UserSummary,
        snapshot: BoardSnapshot,
        todo: Uuid,
        done: Uuid,
    }

    fn fixture() -> Fixture {
        let owner = User::new("Owner", "owner@example.com").summary();
        let board_id = Uuid::new_v4();
        let mut snapshot = BoardSnapshot::new(BoardView {
            id: board_id,
            title: "Sprint".into(),
            description: String::new(),
            created_by: owner.clone(),
            members: vec![owner.clone()],
            created_at: 0,
            updated_at: 0,
        });
        let mut todo = ListReplica::new(TaskList::new(board_id, "To Do", 0));
        for (i, title) in ["A", "B", "C"].iter().enumerate() {
            todo.tasks
                .push(Task::new(board_id, todo.list.id, *title, i as Position).view(|_| None));
        }
        let done = ListReplica::new(TaskList::new(board_id, "Done", 1));
        let (todo_id, done_id) = (todo.list.id, done.list.id);
        snapshot.lists = vec![todo, done];
        Fixture {
            owner,
            snapshot,
            todo: todo_id,
            done: done_id,
        }
    }

    fn live(f: &Fixture) -> Reconciler {
        let mut r = Reconciler::new(f.snapshot.board.id, f.owner.id);
        r.install_snapshot(f.snapshot.clone()).unwrap();
        r
    }

    fn moved_event(f: &Fixture, task_index: usize, dest: Uuid, position: Position) -> BoardEvent {
        let mut task = f.snapshot.lists[0].tasks[task_index].clone();
        task.list_id = dest;
        task.position = position;
        BoardEvent::TaskMoved {
            task,
            source_list_id: f.todo,
            dest_list_id: dest,
            position,
        }
    }

    #[test]
    fn test_local_then_confirmed() {
        let f = fixture();
        let mut r = live(&f);
        let c = f.snapshot.lists[0].tasks[2].id;

        r.apply_local(&LocalMutation::MoveTask {
            task_id: c,
            dest_list_id: f.done,
            index: 0,
        })
        .unwrap();
        assert_eq!(r.sync_state(c), Some(SyncState::Local));
        assert_eq!(r.replica().unwrap().list_of(c), Some(f.done));

        let outcome = r.apply_event(&moved_event(&f, 2, f.done, 0));
        assert_eq!(outcome, MergeOutcome::Applied);
        assert_eq!(r.sync_state(c), Some(SyncState::Confirmed));
        let replica = r.replica().unwrap();
        assert_eq!(replica.list(f.todo).unwrap().tasks.len(), 2);
        assert_eq!(replica.list(f.done).unwrap().task_ids(), vec![c]);
        replica.assert_ordered();
    }

    #[test]
    fn test_same_event_twice_is_idempotent() {
        let f = fixture();
        let mut r = live(&f);
        let event = moved_event(&f, 0, f.done, 0);

        r.apply_event(&event);
        let once = r.replica().cloned();
        r.apply_event(&event);
        assert_eq!(r.replica().cloned(), once);
    }

    #[test]
    fn test_remote_event_overrides_local_guess() {
        let f = fixture();
        let mut r = live(&f);
        let a = f.snapshot.lists[0].tasks[0].id;

        r.apply_local(&LocalMutation::MoveTask {
            task_id: a,
            dest_list_id: f.todo,
            index: 2,
        })
        .unwrap();
        // Another actor's move of A to Done lands last and wins.
        r.apply_event(&moved_event(&f, 0, f.done, 0));
        assert_eq!(r.replica().unwrap().list_of(a), Some(f.done));
    }

    #[test]
    fn test_failed_request_reverts_until_snapshot() {
        let f = fixture();
        let mut r = live(&f);
        let b = f.snapshot.lists[0].tasks[1].id;

        r.apply_local(&LocalMutation::DeleteTask { task_id: b }).unwrap();
        r.request_failed();
        assert_eq!(r.phase(), ReplicaPhase::Reverted);
        assert!(r.replica().is_none());
        assert_eq!(r.sync_state(b), Some(SyncState::Reverted));
        assert!(r.needs_snapshot());
        assert_eq!(
            r.apply_event(&moved_event(&f, 0, f.done, 0)),
            MergeOutcome::Ignored
        );

        r.install_snapshot(f.snapshot.clone()).unwrap();
        assert_eq!(r.sync_state(b), Some(SyncState::Confirmed));
        assert_eq!(r.replica().unwrap().list(f.todo).unwrap().tasks.len(), 3);
    }

    #[test]
    fn test_local_mutation_without_replica_fails() {
        let f = fixture();
        let mut r = Reconciler::new(f.snapshot.board.id, f.owner.id);
        let err = r
            .apply_local(&LocalMutation::DeleteList { list_id: f.todo })
            .unwrap_err();
        assert_eq!(err, ReconcileError::NotLive(f.snapshot.board.id));
    }

    #[test]
    fn test_board_deleted_closes() {
        let f = fixture();
        let mut r = live(&f);
        let outcome = r.apply_event(&BoardEvent::BoardDeleted {
            board_id: f.snapshot.board.id,
        });
        assert_eq!(outcome, MergeOutcome::Closed(CloseReason::BoardDeleted));
        assert_eq!(r.phase(), ReplicaPhase::Closed);
        assert!(!r.needs_snapshot());
    }

    #[test]
    fn test_removed_member_closes_only_for_self() {
        let f = fixture();
        let mut r = live(&f);
        let other = Uuid::new_v4();

        let outcome = r.apply_event(&BoardEvent::MemberRemoved {
            board: f.snapshot.board.clone(),
            removed_user_id: other,
        });
        assert_eq!(outcome, MergeOutcome::Applied);

        let outcome = r.apply_event(&BoardEvent::MemberRemoved {
            board: f.snapshot.board.clone(),
            removed_user_id: f.owner.id,
        });
        assert_eq!(outcome, MergeOutcome::Closed(CloseReason::RemovedFromBoard));
    }

    #[test]
    fn test_events_for_other_boards_are_ignored() {
        let f = fixture();
        let mut r = live(&f);
        let outcome = r.apply_event(&BoardEvent::BoardDeleted {
            board_id: Uuid::new_v4(),
        });
        assert_eq!(outcome, MergeOutcome::Ignored);
        assert_eq!(r.phase(), ReplicaPhase::Live);
    }

    #[test]
    fn test_rename_and_move_list_locally() {
        let f = fixture();
        let mut r = live(&f);

        r.apply_local(&LocalMutation::RenameList {
            list_id: f.done,
            title: "Shipped".into(),
        })
        .unwrap();
        r.apply_local(&LocalMutation::MoveList {
            list_id: f.done,
            index: 0,
        })
        .unwrap();

        let replica = r.replica().unwrap();
        assert_eq!(replica.lists[0].list.title, "Shipped");
        assert_eq!(replica.lists[1].list.id, f.todo);
        replica.assert_ordered();
        assert_eq!(r.sync_state(f.done), Some(SyncState::Local));
    }

    #[test]
    fn test_wrong_board_snapshot_rejected() {
        let f = fixture();
        let mut r = Reconciler::new(Uuid::new_v4(), f.owner.id);
        assert!(matches!(
            r.install_snapshot(f.snapshot.clone()),
            Err(ReconcileError::WrongBoard { .. })
        ));
    }
}
