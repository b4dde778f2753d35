//! Board snapshots and the merge functions that keep a client-side copy of a
//! board in step with canonical events.
//!
//! Every merge is idempotent: applying the same event twice leaves the
//! snapshot exactly as applying it once.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::{self, Position, Positioned};
use crate::model::{BoardView, TaskList, TaskView};

/// A list together with its tasks in read order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListReplica {
    pub list: TaskList,
    pub tasks: Vec<TaskView>,
}

impl ListReplica {
    pub fn new(list: TaskList) -> Self {
        Self {
            list,
            tasks: Vec::new(),
        }
    }

    pub fn task_ids(&self) -> Vec<Uuid> {
        self.tasks.iter().map(|t| t.id).collect()
    }
}

impl Positioned for ListReplica {
    fn id(&self) -> Uuid {
        self.list.id
    }

    fn position(&self) -> Position {
        self.list.position
    }

    fn set_position(&mut self, position: Position) {
        self.list.position = position;
    }
}

/// Full ordered state of one board, as served on fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub board: BoardView,
    pub lists: Vec<ListReplica>,
}

impl BoardSnapshot {
    pub fn new(board: BoardView) -> Self {
        Self {
            board,
            lists: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// List ids with their task ids, both in display order.
    pub fn projection(&self) -> Vec<(Uuid, Vec<Uuid>)> {
        self.lists
            .iter()
            .map(|l| (l.list.id, l.task_ids()))
            .collect()
    }

    pub fn list(&self, list_id: Uuid) -> Option<&ListReplica> {
        self.lists.iter().find(|l| l.list.id == list_id)
    }

    fn list_mut(&mut self, list_id: Uuid) -> Option<&mut ListReplica> {
        self.lists.iter_mut().find(|l| l.list.id == list_id)
    }

    pub fn task(&self, task_id: Uuid) -> Option<&TaskView> {
        self.lists
            .iter()
            .flat_map(|l| l.tasks.iter())
            .find(|t| t.id == task_id)
    }

    /// List currently holding `task_id`.
    pub fn list_of(&self, task_id: Uuid) -> Option<Uuid> {
        self.lists
            .iter()
            .find(|l| l.tasks.iter().any(|t| t.id == task_id))
            .map(|l| l.list.id)
    }

    /// Panic unless every container is in valid ledger order.
    pub fn assert_ordered(&self) {
        ledger::assert_valid(&self.lists);
        for list in &self.lists {
            ledger::assert_valid(&list.tasks);
        }
    }

    // ─── Merges ───────────────────────────────────────────────────────

    pub fn merge_board(&mut self, board: BoardView) {
        self.board = board;
    }

    /// Insert or replace a list record, keeping its tasks.
    pub fn merge_list(&mut self, list: TaskList) {
        match self.list(list.id).map(|l| l.list.position) {
            Some(position) if position == list.position => {
                if let Some(existing) = self.list_mut(list.id) {
                    existing.list = list;
                }
            }
            Some(_) => {
                let tasks = self.take_list(list.id).map(|l| l.tasks).unwrap_or_default();
                self.insert_list_sorted(ListReplica { list, tasks });
            }
            None => self.insert_list_sorted(ListReplica::new(list)),
        }
    }

    /// Move a list to `index`, then renumber the board's lists to `0..n`.
    pub fn move_list(&mut self, list: TaskList, index: usize) {
        let tasks = self.take_list(list.id).map(|l| l.tasks).unwrap_or_default();
        let at = index.min(self.lists.len());
        self.lists.insert(at, ListReplica { list, tasks });
        ledger::compact(&mut self.lists);
    }

    pub fn remove_list(&mut self, list_id: Uuid) -> Option<ListReplica> {
        self.take_list(list_id)
    }

    /// Insert or replace a task. A task reported in a different list than the
    /// one holding it locally is moved there.
    pub fn merge_task(&mut self, task: TaskView) {
        if self.list_of(task.id) == Some(task.list_id) {
            let slot = self
                .lists
                .iter_mut()
                .flat_map(|l| l.tasks.iter_mut())
                .find(|t| t.id == task.id);
            if let Some(slot) = slot.filter(|t| t.position == task.position) {
                *slot = task;
                return;
            }
        }
        self.remove_task(task.id);
        if let Some(list) = self.list_mut(task.list_id) {
            let at = list
                .tasks
                .partition_point(|t| ledger::read_order(t, &task).is_lt());
            list.tasks.insert(at, task);
        }
    }

    /// Place `task` at `index` of `dest_list_id`, wherever it currently is,
    /// then renumber the lists it left and joined to `0..n`.
    pub fn move_task(&mut self, mut task: TaskView, dest_list_id: Uuid, index: usize) {
        let source = self.list_of(task.id);
        self.remove_task(task.id);
        task.list_id = dest_list_id;

        if let Some(list_id) = source {
            if let Some(list) = self.list_mut(list_id) {
                ledger::compact(&mut list.tasks);
            }
        }
        if let Some(list) = self.list_mut(dest_list_id) {
            let at = index.min(list.tasks.len());
            list.tasks.insert(at, task);
            ledger::compact(&mut list.tasks);
        }
    }

    pub fn remove_task(&mut self, task_id: Uuid) -> Option<TaskView> {
        for list in &mut self.lists {
            if let Some(at) = list.tasks.iter().position(|t| t.id == task_id) {
                return Some(list.tasks.remove(at));
            }
        }
        None
    }

    fn take_list(&mut self, list_id: Uuid) -> Option<ListReplica> {
        let at = self.lists.iter().position(|l| l.list.id == list_id)?;
        Some(self.lists.remove(at))
    }

    fn insert_list_sorted(&mut self, list: ListReplica) {
        let at = self
            .lists
            .partition_point(|l| ledger::read_order(l, &list).is_lt());
        self.lists.insert(at, list);
    }
}
