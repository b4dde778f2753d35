use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Kind of record a [`BoardError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Board,
    List,
    Task,
    User,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Board => "Board",
            EntityKind::List => "List",
            EntityKind::Task => "Task",
            EntityKind::User => "User",
        };
        f.write_str(s)
    }
}

/// Failure of a board operation as seen by the caller.
///
/// Every variant carries a human-readable message. None of them is retried
/// by the server; clients recover by re-fetching the board snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum BoardError {
    /// Missing or malformed input, rejected before any store write.
    #[error("{0}")]
    Validation(String),

    /// Referenced record is absent. Nothing was written.
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: Uuid },

    /// Actor is not a member, or not the owner for an owner-only operation.
    #[error("{0}")]
    AccessDenied(String),

    /// A multi-step store update failed after `completed_steps` steps had
    /// already been applied. Those steps are not rolled back.
    #[error("update of {item} partially applied ({completed_steps} steps done): {reason}")]
    PartialApply {
        item: Uuid,
        completed_steps: usize,
        reason: String,
    },

    /// Store failure before anything was written.
    #[error("store error: {0}")]
    Store(String),
}

impl BoardError {
    pub fn not_found(kind: EntityKind, id: Uuid) -> Self {
        BoardError::NotFound { kind, id }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BoardError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_readable() {
        let id = Uuid::nil();
        assert_eq!(
            BoardError::not_found(EntityKind::Task, id).to_string(),
            format!("Task not found: {id}")
        );
        assert_eq!(
            BoardError::AccessDenied("Access denied".into()).to_string(),
            "Access denied"
        );
        let partial = BoardError::PartialApply {
            item: id,
            completed_steps: 1,
            reason: "disk full".into(),
        };
        assert!(partial.to_string().contains("1 steps done"));
    }
}
