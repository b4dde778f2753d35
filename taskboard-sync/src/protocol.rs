//! Binary wire protocol between board clients and the sync server.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────┬──────────┬──────────┬────────────┬──────────┐
//! │ kind │ actor_id │ board_id │ request_id │ payload  │
//! │ 1 B  │ 16 bytes │ 16 bytes │ varint     │ variable │
//! └──────┴──────────┴──────────┴────────────┴──────────┘
//! ```
//!
//! Every client frame except `Ping` carries a request id that the server
//! echoes in exactly one `Response`. `Event` frames are unsolicited and carry
//! request id 0. Payloads are bincode too: a [`Command`] in `Request`, a
//! `Result<Reply, BoardError>` in `Response`, a [`BoardEvent`] in `Event`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use taskboard_core::model::{
    Activity, BoardView, MoveTaskRequest, NewTask, TaskList, TaskPatch, TaskView, UserSummary,
};
use taskboard_core::{BoardError, BoardEvent, BoardSnapshot, LocalMutation, Position};

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Client identifies its actor
    Hello = 1,
    /// Subscribe to a board's room
    Join = 2,
    /// Unsubscribe from a board's room
    Leave = 3,
    /// Client command
    Request = 4,
    /// Server answer to Hello, Join, Leave or Request
    Response = 5,
    /// Canonical board event fanned out to a room
    Event = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Operations a client can ask of the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    RegisterUser {
        name: String,
        email: String,
    },
    CreateBoard {
        title: String,
        description: String,
    },
    ListBoards,
    FetchBoard {
        board_id: Uuid,
    },
    UpdateBoard {
        board_id: Uuid,
        title: Option<String>,
        description: Option<String>,
    },
    DeleteBoard {
        board_id: Uuid,
    },
    AddMember {
        board_id: Uuid,
        email: String,
    },
    RemoveMember {
        board_id: Uuid,
        user_id: Uuid,
    },
    CreateList {
        board_id: Uuid,
        title: String,
    },
    RenameList {
        list_id: Uuid,
        title: String,
    },
    MoveList {
        list_id: Uuid,
        position: Position,
    },
    DeleteList {
        list_id: Uuid,
    },
    CreateTask {
        list_id: Uuid,
        task: NewTask,
    },
    UpdateTask {
        task_id: Uuid,
        patch: TaskPatch,
    },
    DeleteTask {
        task_id: Uuid,
    },
    MoveTask {
        task_id: Uuid,
        request: MoveTaskRequest,
    },
    AssignTask {
        task_id: Uuid,
        user_id: Uuid,
    },
    UnassignTask {
        task_id: Uuid,
        user_id: Uuid,
    },
    RecentActivity {
        board_id: Uuid,
        limit: usize,
    },
}

impl Command {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::RegisterUser { .. } => "register_user",
            Command::CreateBoard { .. } => "create_board",
            Command::ListBoards => "list_boards",
            Command::FetchBoard { .. } => "fetch_board",
            Command::UpdateBoard { .. } => "update_board",
            Command::DeleteBoard { .. } => "delete_board",
            Command::AddMember { .. } => "add_member",
            Command::RemoveMember { .. } => "remove_member",
            Command::CreateList { .. } => "create_list",
            Command::RenameList { .. } => "rename_list",
            Command::MoveList { .. } => "move_list",
            Command::DeleteList { .. } => "delete_list",
            Command::CreateTask { .. } => "create_task",
            Command::UpdateTask { .. } => "update_task",
            Command::DeleteTask { .. } => "delete_task",
            Command::MoveTask { .. } => "move_task",
            Command::AssignTask { .. } => "assign_task",
            Command::UnassignTask { .. } => "unassign_task",
            Command::RecentActivity { .. } => "recent_activity",
        }
    }

    /// Commands that need a prior `Hello`.
    pub fn needs_actor(&self) -> bool {
        !matches!(self, Command::RegisterUser { .. })
    }
}

impl From<&LocalMutation> for Command {
    fn from(mutation: &LocalMutation) -> Self {
        match mutation.clone() {
            LocalMutation::MoveTask {
                task_id,
                dest_list_id,
                index,
            } => Command::MoveTask {
                task_id,
                request: MoveTaskRequest {
                    list_id: Some(dest_list_id),
                    position: index as Position,
                },
            },
            LocalMutation::MoveList { list_id, index } => Command::MoveList {
                list_id,
                position: index as Position,
            },
            LocalMutation::UpdateTask { task_id, patch } => Command::UpdateTask { task_id, patch },
            LocalMutation::RenameList { list_id, title } => Command::RenameList { list_id, title },
            LocalMutation::DeleteTask { task_id } => Command::DeleteTask { task_id },
            LocalMutation::DeleteList { list_id } => Command::DeleteList { list_id },
        }
    }
}

/// Successful answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Welcome(UserSummary),
    Joined { board_id: Uuid },
    Left { board_id: Uuid },
    User(UserSummary),
    Board(BoardView),
    Boards(Vec<BoardView>),
    Snapshot(BoardSnapshot),
    List(TaskList),
    Task(TaskView),
    TaskMoved {
        task: TaskView,
        source_list_id: Uuid,
        dest_list_id: Uuid,
        position: Position,
    },
    Activity(Vec<Activity>),
    Deleted { id: Uuid },
}

/// Top-level protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    pub actor_id: Uuid,
    pub board_id: Uuid,
    pub request_id: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    fn bare(kind: FrameKind, actor_id: Uuid, board_id: Uuid, request_id: u64) -> Self {
        Self {
            kind,
            actor_id,
            board_id,
            request_id,
            payload: Vec::new(),
        }
    }

    pub fn hello(actor_id: Uuid, request_id: u64) -> Self {
        Self::bare(FrameKind::Hello, actor_id, Uuid::nil(), request_id)
    }

    pub fn join(actor_id: Uuid, board_id: Uuid, request_id: u64) -> Self {
        Self::bare(FrameKind::Join, actor_id, board_id, request_id)
    }

    pub fn leave(actor_id: Uuid, board_id: Uuid, request_id: u64) -> Self {
        Self::bare(FrameKind::Leave, actor_id, board_id, request_id)
    }

    pub fn request(actor_id: Uuid, request_id: u64, command: &Command) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(command)?,
            ..Self::bare(FrameKind::Request, actor_id, Uuid::nil(), request_id)
        })
    }

    pub fn response(
        request_id: u64,
        result: &Result<Reply, BoardError>,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(result)?,
            ..Self::bare(FrameKind::Response, Uuid::nil(), Uuid::nil(), request_id)
        })
    }

    pub fn event(event: &BoardEvent) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(event)?,
            ..Self::bare(FrameKind::Event, Uuid::nil(), event.board_id(), 0)
        })
    }

    pub fn ping(actor_id: Uuid) -> Self {
        Self::bare(FrameKind::Ping, actor_id, Uuid::nil(), 0)
    }

    pub fn pong() -> Self {
        Self::bare(FrameKind::Pong, Uuid::nil(), Uuid::nil(), 0)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }

    /// Parse the command of a `Request` frame.
    pub fn command(&self) -> Result<Command, ProtocolError> {
        self.expect(FrameKind::Request)?;
        decode_payload(&self.payload)
    }

    /// Parse the result carried by a `Response` frame.
    pub fn reply(&self) -> Result<Result<Reply, BoardError>, ProtocolError> {
        self.expect(FrameKind::Response)?;
        decode_payload(&self.payload)
    }

    /// Parse the event of an `Event` frame.
    pub fn board_event(&self) -> Result<BoardEvent, ProtocolError> {
        self.expect(FrameKind::Event)?;
        decode_payload(&self.payload)
    }

    fn expect(&self, kind: FrameKind) -> Result<(), ProtocolError> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedFrame {
                expected: kind,
                got: self.kind,
            })
        }
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Expected {expected:?} frame, got {got:?}")]
    UnexpectedFrame { expected: FrameKind, got: FrameKind },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskboard_core::model::Task;

    #[test]
    fn test_local_move_becomes_move_command() {
        let task_id = Uuid::new_v4();
        let dest_list_id = Uuid::new_v4();
        let command = Command::from(&LocalMutation::MoveTask {
            task_id,
            dest_list_id,
            index: 3,
        });
        assert_eq!(
            command,
            Command::MoveTask {
                task_id,
                request: MoveTaskRequest {
                    list_id: Some(dest_list_id),
                    position: 3,
                },
            }
        );
        assert!(command.needs_actor());
    }

    #[test]
    fn test_request_carries_command() {
        let actor = Uuid::new_v4();
        let command = Command::MoveTask {
            task_id: Uuid::new_v4(),
            request: MoveTaskRequest {
                list_id: Some(Uuid::new_v4()),
                position: 0,
            },
        };

        let frame = Frame::request(actor, 7, &command).unwrap();
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, FrameKind::Request);
        assert_eq!(decoded.actor_id, actor);
        assert_eq!(decoded.request_id, 7);
        assert_eq!(decoded.command().unwrap(), command);
    }

    #[test]
    fn test_response_carries_errors() {
        let missing = Uuid::new_v4();
        let result: Result<Reply, BoardError> = Err(BoardError::not_found(
            taskboard_core::EntityKind::Task,
            missing,
        ));

        let frame = Frame::response(3, &result).unwrap();
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.request_id, 3);
        assert_eq!(decoded.reply().unwrap(), result);
    }

    #[test]
    fn test_event_frame_routes_to_board() {
        let board_id = Uuid::new_v4();
        let task = Task::new(board_id, Uuid::new_v4(), "Ship", 0).view(|_| None);
        let event = BoardEvent::TaskCreated { task };

        let frame = Frame::event(&event).unwrap();
        assert_eq!(frame.board_id, board_id);
        assert_eq!(frame.request_id, 0);
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.board_event().unwrap(), event);
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let frame = Frame::ping(Uuid::new_v4());
        assert_eq!(
            frame.command(),
            Err(ProtocolError::UnexpectedFrame {
                expected: FrameKind::Request,
                got: FrameKind::Ping,
            })
        );
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            Frame::decode(&[0xFF, 0xFF, 0xFF]),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_register_is_the_only_anonymous_command() {
        let register = Command::RegisterUser {
            name: "Ada".into(),
            email: "ada@example.com".into(),
        };
        assert!(!register.needs_actor());
        assert!(Command::ListBoards.needs_actor());
        assert_eq!(Command::ListBoards.name(), "list_boards");
    }
}
