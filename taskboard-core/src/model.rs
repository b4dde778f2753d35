//! Board, list, task and user records plus their denormalized views.
//!
//! Records are what the store persists (member and assignee references are
//! plain ids). Views are what travels in events and snapshots: every user
//! reference is resolved to a [`UserSummary`] so a receiver never needs a
//! follow-up fetch.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BoardError;
use crate::ledger::{Position, Positioned};

pub const MAX_BOARD_TITLE: usize = 100;
pub const MAX_BOARD_DESCRIPTION: usize = 500;
pub const MAX_LIST_TITLE: usize = 100;
pub const MAX_TASK_TITLE: usize = 200;
pub const MAX_TASK_DESCRIPTION: usize = 2000;
pub const MAX_USER_NAME: usize = 100;

/// Seconds since the unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Trim `raw` and check it is non-empty and within `max` characters.
pub fn clean_title(field: &str, raw: &str, max: usize) -> Result<String, BoardError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(BoardError::Validation(format!("{field} is required")));
    }
    clean_text(field, trimmed, max)
}

/// Trim `raw` and check it is within `max` characters. Empty is allowed.
pub fn clean_text(field: &str, raw: &str, max: usize) -> Result<String, BoardError> {
    let trimmed = raw.trim();
    if trimmed.chars().count() > max {
        return Err(BoardError::Validation(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Trim and lowercase an email address and check its basic shape.
pub fn clean_email(raw: &str) -> Result<String, BoardError> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(BoardError::Validation(format!("invalid email address: {}", raw.trim())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub created_at: u64,
}

impl User {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: email.into(),
            created_at: now_secs(),
        }
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

/// A user resolved to name and email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub created_by: Uuid,
    /// Always contains `created_by`.
    pub members: Vec<Uuid>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Board {
    pub fn new(owner: Uuid, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = now_secs();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            created_by: owner,
            members: vec![owner],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_member(&self, user_id: Uuid) -> bool {
        self.members.contains(&user_id)
    }

    pub fn is_owner(&self, user_id: Uuid) -> bool {
        self.created_by == user_id
    }
}

/// Board with owner and members resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardView {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub created_by: UserSummary,
    pub members: Vec<UserSummary>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl BoardView {
    pub fn has_member(&self, user_id: Uuid) -> bool {
        self.members.iter().any(|m| m.id == user_id)
    }
}

/// A list on a board. Lists are the containers of tasks and are themselves
/// ordered within their board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskList {
    pub id: Uuid,
    pub board_id: Uuid,
    pub title: String,
    pub position: Position,
    pub created_at: u64,
    pub updated_at: u64,
}

impl TaskList {
    pub fn new(board_id: Uuid, title: impl Into<String>, position: Position) -> Self {
        let now = now_secs();
        Self {
            id: Uuid::new_v4(),
            board_id,
            title: title.into(),
            position,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Positioned for TaskList {
    fn id(&self) -> Uuid {
        self.id
    }

    fn position(&self) -> Position {
        self.position
    }

    fn set_position(&mut self, position: Position) {
        self.position = position;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub board_id: Uuid,
    pub list_id: Uuid,
    pub title: String,
    pub description: String,
    pub position: Position,
    pub assignees: Vec<Uuid>,
    pub priority: Priority,
    /// Unix seconds.
    pub due_date: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Task {
    pub fn new(board_id: Uuid, list_id: Uuid, title: impl Into<String>, position: Position) -> Self {
        let now = now_secs();
        Self {
            id: Uuid::new_v4(),
            board_id,
            list_id,
            title: title.into(),
            description: String::new(),
            position,
            assignees: Vec::new(),
            priority: Priority::default(),
            due_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Resolve assignees with `lookup`. Unknown ids are dropped.
    pub fn view(&self, lookup: impl Fn(Uuid) -> Option<UserSummary>) -> TaskView {
        TaskView {
            id: self.id,
            board_id: self.board_id,
            list_id: self.list_id,
            title: self.title.clone(),
            description: self.description.clone(),
            position: self.position,
            assignees: self.assignees.iter().filter_map(|id| lookup(*id)).collect(),
            priority: self.priority,
            due_date: self.due_date,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl Positioned for Task {
    fn id(&self) -> Uuid {
        self.id
    }

    fn position(&self) -> Position {
        self.position
    }

    fn set_position(&mut self, position: Position) {
        self.position = position;
    }
}

/// Task with assignees resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: Uuid,
    pub board_id: Uuid,
    pub list_id: Uuid,
    pub title: String,
    pub description: String,
    pub position: Position,
    pub assignees: Vec<UserSummary>,
    pub priority: Priority,
    pub due_date: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl TaskView {
    /// Apply the fields present in `patch` without validation. Used for
    /// optimistic edits; the server validates the real request.
    pub fn apply_patch(&mut self, patch: &TaskPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(due_date) = patch.due_date {
            self.due_date = due_date;
        }
    }
}

impl Positioned for TaskView {
    fn id(&self) -> Uuid {
        self.id
    }

    fn position(&self) -> Position {
        self.position
    }

    fn set_position(&mut self, position: Position) {
        self.position = position;
    }
}

/// Fields for a new task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub due_date: Option<u64>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Partial task update. `None` leaves a field untouched; `due_date:
/// Some(None)` clears the due date.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub due_date: Option<Option<u64>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.due_date.is_none()
    }
}

/// Request to move a task. `position` is a zero-based destination index
/// within the (possibly new) list, not a raw ledger value. `list_id: None`
/// keeps the task in its current list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveTaskRequest {
    pub list_id: Option<Uuid>,
    pub position: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityAction {
    BoardCreated,
    BoardUpdated,
    ListCreated,
    ListUpdated,
    ListMoved,
    ListDeleted,
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    TaskMoved,
    MemberAdded,
    MemberRemoved,
    TaskAssigned,
    TaskUnassigned,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityAction::BoardCreated => "board_created",
            ActivityAction::BoardUpdated => "board_updated",
            ActivityAction::ListCreated => "list_created",
            ActivityAction::ListUpdated => "list_updated",
            ActivityAction::ListMoved => "list_moved",
            ActivityAction::ListDeleted => "list_deleted",
            ActivityAction::TaskCreated => "task_created",
            ActivityAction::TaskUpdated => "task_updated",
            ActivityAction::TaskDeleted => "task_deleted",
            ActivityAction::TaskMoved => "task_moved",
            ActivityAction::MemberAdded => "member_added",
            ActivityAction::MemberRemoved => "member_removed",
            ActivityAction::TaskAssigned => "task_assigned",
            ActivityAction::TaskUnassigned => "task_unassigned",
        }
    }
}

impl fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit entry, one per mutation. Ids are time-ordered, so
/// entries written in the same second still sort in write order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub board_id: Uuid,
    pub task_id: Option<Uuid>,
    pub actor: Uuid,
    pub action: ActivityAction,
    pub details: BTreeMap<String, String>,
    pub created_at: u64,
}

impl Activity {
    pub fn new(board_id: Uuid, actor: Uuid, action: ActivityAction) -> Self {
        Self {
            id: Uuid::now_v7(),
            board_id,
            task_id: None,
            actor,
            action,
            details: BTreeMap::new(),
            created_at: now_secs(),
        }
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_owner_is_member() {
        let owner = Uuid::new_v4();
        let board = Board::new(owner, "Roadmap", "");
        assert!(board.is_owner(owner));
        assert!(board.is_member(owner));
        assert!(!board.is_member(Uuid::new_v4()));
    }

    #[test]
    fn test_clean_email() {
        assert_eq!(clean_email("  Ada@Example.COM ").unwrap(), "ada@example.com");
        assert!(clean_email("ada").is_err());
        assert!(clean_email("@example.com").is_err());
        assert!(clean_email("ada@localhost").is_err());
    }

    #[test]
    fn test_clean_title_trims_and_rejects_empty() {
        assert_eq!(clean_title("Task title", "  Ship it ", 10).unwrap(), "Ship it");
        assert!(matches!(
            clean_title("Task title", "   ", 10),
            Err(BoardError::Validation(_))
        ));
        assert!(clean_title("Task title", "x".repeat(11).as_str(), 10).is_err());
    }

    #[test]
    fn test_task_view_drops_unknown_assignees() {
        let alice = User::new("Alice", "alice@example.com");
        let mut task = Task::new(Uuid::new_v4(), Uuid::new_v4(), "Write docs", 0);
        task.assignees = vec![alice.id, Uuid::new_v4()];

        let view = task.view(|id| (id == alice.id).then(|| alice.summary()));
        assert_eq!(view.assignees, vec![alice.summary()]);
        assert_eq!(view.title, "Write docs");
    }

    #[test]
    fn test_patch_applies_only_present_fields() {
        let mut view = Task::new(Uuid::new_v4(), Uuid::new_v4(), "Old", 0).view(|_| None);
        view.due_date = Some(100);
        let patch = TaskPatch {
            priority: Some(Priority::Urgent),
            due_date: Some(None),
            ..TaskPatch::default()
        };
        view.apply_patch(&patch);
        assert_eq!(view.title, "Old");
        assert_eq!(view.priority, Priority::Urgent);
        assert_eq!(view.due_date, None);
        assert!(TaskPatch::default().is_empty());
    }

    #[test]
    fn test_activity_action_tags() {
        assert_eq!(ActivityAction::TaskMoved.to_string(), "task_moved");
        let entry = Activity::new(Uuid::new_v4(), Uuid::new_v4(), ActivityAction::ListCreated)
            .detail("title", "Done");
        assert_eq!(entry.details.get("title").map(String::as_str), Some("Done"));
        assert!(entry.task_id.is_none());
    }
}
