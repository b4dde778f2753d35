//! WebSocket server routing board commands to the mutation applier.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── RecordStore (RocksDB | memory)
//!             ├── connection task ── MutationApplier
//! Client B ──┘        │                  └── RoomRegistry ── Room (board_id)
//!                     │                                         │
//!                     └──────────── outbox ◄── forward ◄────────┘
//! ```
//!
//! Each connection runs one task that reads frames, dispatches requests and
//! writes both responses and room events. A connection must say hello as a
//! registered user before anything but `RegisterUser` is accepted, and must
//! join a board's room to receive its events. The originating connection
//! receives its own mutation's event like every other viewer.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use taskboard_core::model::Board;
use taskboard_core::BoardError;

use crate::applier::{MutationApplier, MovedTask};
use crate::broadcast::{RoomRegistry, SharedFrame};
use crate::protocol::{Command, Frame, FrameKind, Reply};
use crate::storage::{AnyStore, Filter, MemoryStore, RecordStore, RocksStore, StoreConfig, StoreError};

type Applier = MutationApplier<AnyStore, RoomRegistry>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Frames queued per connection before room forwarding waits
    pub outbox_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            outbox_capacity: 256,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TASKBOARD_BIND`, `TASKBOARD_DATA_DIR` and
    /// `TASKBOARD_BROADCAST_CAPACITY`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("TASKBOARD_BIND") {
            config.bind_addr = addr;
        }
        if let Ok(dir) = std::env::var("TASKBOARD_DATA_DIR") {
            config.storage_path = Some(PathBuf::from(dir));
        }
        if let Ok(raw) = std::env::var("TASKBOARD_BROADCAST_CAPACITY") {
            match raw.parse() {
                Ok(capacity) => config.broadcast_capacity = capacity,
                Err(_) => log::warn!("Ignoring invalid TASKBOARD_BROADCAST_CAPACITY={raw}"),
            }
        }
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_bytes: u64,
}

/// The board server.
pub struct SyncServer {
    config: ServerConfig,
    applier: Arc<Applier>,
    rooms: Arc<RoomRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening persistent storage if configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => AnyStore::Rocks(RocksStore::open(StoreConfig::at(path))?),
            None => AnyStore::Memory(MemoryStore::new()),
        };
        let rooms = Arc::new(RoomRegistry::new(config.broadcast_capacity));
        let applier = Arc::new(MutationApplier::new(Arc::new(store), rooms.clone()));

        Ok(Self {
            config,
            applier,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Result<Self, StoreError> {
        Self::new(ServerConfig::default())
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Count the boards already in storage. Records are read on demand, so
    /// this only reports what a restarted server will serve.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let store = self.applier.store();
        if !store.is_persistent() {
            return Ok(0);
        }
        let boards = store.find_many::<Board>(&Filter::all())?.len();
        log::info!("Recovery complete: {boards} boards in storage");
        Ok(boards)
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.recover()?;

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Board server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let applier = self.applier.clone();
            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let outbox_capacity = self.config.outbox_capacity;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, applier, rooms, stats, outbox_capacity)
                        .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        applier: Arc<Applier>,
        rooms: Arc<RoomRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        outbox_capacity: usize,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let connection_id = Uuid::new_v4();
        let mut actor: Option<Uuid> = None;
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<SharedFrame>(outbox_capacity);

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                stats.write().await.total_bytes += data.len() as u64;
                                let frame = match Frame::decode(&data) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        continue;
                                    }
                                };
                                let reply = Self::handle_frame(
                                    &applier,
                                    &rooms,
                                    &stats,
                                    connection_id,
                                    &mut actor,
                                    &outbox_tx,
                                    frame,
                                )
                                .await?;
                                if let Some(reply) = reply {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    Some(frame) = outbox_rx.recv() => {
                        ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        let left = rooms.unsubscribe_all(connection_id).await;
        log::debug!("Connection {connection_id} left {left} rooms");
        stats.write().await.active_connections -= 1;
        result
    }

    /// Process one inbound frame. Returns the frame to send back, if any.
    async fn handle_frame(
        applier: &Applier,
        rooms: &RoomRegistry,
        stats: &RwLock<ServerStats>,
        connection_id: Uuid,
        actor: &mut Option<Uuid>,
        outbox: &mpsc::Sender<SharedFrame>,
        frame: Frame,
    ) -> Result<Option<Frame>, BoxError> {
        let request_id = frame.request_id;
        let result = match frame.kind {
            FrameKind::Hello => match applier.user(frame.actor_id).await {
                Ok(user) => {
                    log::info!("Connection {connection_id} is {} ({})", user.name, user.id);
                    *actor = Some(user.id);
                    Ok(Reply::Welcome(user))
                }
                Err(e) => Err(e),
            },

            FrameKind::Join => match signed_in(*actor) {
                Ok(actor_id) => match applier.ensure_member(actor_id, frame.board_id).await {
                    Ok(()) => {
                        rooms
                            .subscribe(frame.board_id, connection_id, actor_id, outbox.clone())
                            .await;
                        Ok(Reply::Joined {
                            board_id: frame.board_id,
                        })
                    }
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            },

            FrameKind::Leave => {
                rooms.unsubscribe(frame.board_id, connection_id).await;
                Ok(Reply::Left {
                    board_id: frame.board_id,
                })
            }

            FrameKind::Request => {
                let result = match frame.command() {
                    Ok(command) => {
                        log::debug!("Request {request_id}: {}", command.name());
                        dispatch(applier, *actor, command).await
                    }
                    Err(e) => Err(BoardError::Validation(format!("Malformed request: {e}"))),
                };
                let mut s = stats.write().await;
                s.total_requests += 1;
                if result.is_err() {
                    s.failed_requests += 1;
                }
                result
            }

            FrameKind::Ping => return Ok(Some(Frame::pong())),

            other => {
                log::debug!("Ignoring {other:?} frame from connection {connection_id}");
                return Ok(None);
            }
        };

        if let Err(e) = &result {
            log::debug!("Request {request_id} failed: {e}");
        }
        Ok(Some(Frame::response(request_id, &result)?))
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn applier(&self) -> &Arc<Applier> {
        &self.applier
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }
}

fn signed_in(actor: Option<Uuid>) -> Result<Uuid, BoardError> {
    actor.ok_or_else(|| BoardError::AccessDenied("Say hello as a registered user first".into()))
}

/// Route a command to the applier on behalf of `actor`.
pub async fn dispatch<S, B>(
    applier: &MutationApplier<S, B>,
    actor: Option<Uuid>,
    command: Command,
) -> Result<Reply, BoardError>
where
    S: RecordStore,
    B: crate::broadcast::Broadcaster,
{
    let actor = if command.needs_actor() {
        signed_in(actor)?
    } else {
        Uuid::nil()
    };

    match command {
        Command::RegisterUser { name, email } => {
            applier.register_user(&name, &email).await.map(Reply::User)
        }
        Command::CreateBoard { title, description } => applier
            .create_board(actor, &title, &description)
            .await
            .map(Reply::Board),
        Command::ListBoards => applier.list_boards(actor).await.map(Reply::Boards),
        Command::FetchBoard { board_id } => {
            applier.fetch_board(actor, board_id).await.map(Reply::Snapshot)
        }
        Command::UpdateBoard {
            board_id,
            title,
            description,
        } => applier
            .update_board(actor, board_id, title.as_deref(), description.as_deref())
            .await
            .map(Reply::Board),
        Command::DeleteBoard { board_id } => applier
            .delete_board(actor, board_id)
            .await
            .map(|()| Reply::Deleted { id: board_id }),
        Command::AddMember { board_id, email } => applier
            .add_member(actor, board_id, &email)
            .await
            .map(Reply::Board),
        Command::RemoveMember { board_id, user_id } => applier
            .remove_member(actor, board_id, user_id)
            .await
            .map(Reply::Board),
        Command::CreateList { board_id, title } => applier
            .create_list(actor, board_id, &title)
            .await
            .map(Reply::List),
        Command::RenameList { list_id, title } => applier
            .rename_list(actor, list_id, &title)
            .await
            .map(Reply::List),
        Command::MoveList { list_id, position } => applier
            .move_list(actor, list_id, position)
            .await
            .map(Reply::List),
        Command::DeleteList { list_id } => applier
            .delete_list(actor, list_id)
            .await
            .map(|()| Reply::Deleted { id: list_id }),
        Command::CreateTask { list_id, task } => applier
            .create_task(actor, list_id, &task)
            .await
            .map(Reply::Task),
        Command::UpdateTask { task_id, patch } => applier
            .update_task(actor, task_id, &patch)
            .await
            .map(Reply::Task),
        Command::DeleteTask { task_id } => applier
            .delete_task(actor, task_id)
            .await
            .map(|()| Reply::Deleted { id: task_id }),
        Command::MoveTask { task_id, request } => {
            let MovedTask {
                task,
                source_list_id,
                dest_list_id,
                position,
            } = applier.move_task(actor, task_id, request).await?;
            Ok(Reply::TaskMoved {
                task,
                source_list_id,
                dest_list_id,
                position,
            })
        }
        Command::AssignTask { task_id, user_id } => applier
            .assign_task(actor, task_id, user_id)
            .await
            .map(Reply::Task),
        Command::UnassignTask { task_id, user_id } => applier
            .unassign_task(actor, task_id, user_id)
            .await
            .map(Reply::Task),
        Command::RecentActivity { board_id, limit } => applier
            .recent_activity(actor, board_id, limit)
            .await
            .map(Reply::Activity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskboard_core::model::{MoveTaskRequest, NewTask};
    use taskboard_core::EntityKind;

    fn memory_applier() -> Applier {
        MutationApplier::new(
            Arc::new(AnyStore::Memory(MemoryStore::new())),
            Arc::new(RoomRegistry::new(16)),
        )
    }

    async fn registered(applier: &Applier, name: &str, email: &str) -> Uuid {
        match dispatch(
            applier,
            None,
            Command::RegisterUser {
                name: name.into(),
                email: email.into(),
            },
        )
        .await
        {
            Ok(Reply::User(user)) => user.id,
            other => panic!("expected a user, got {other:?}"),
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.outbox_capacity, 256);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults().unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(!server.applier().store().is_persistent());
        assert_eq!(server.recover().unwrap(), 0);
    }

    #[test]
    fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::with_storage("127.0.0.1:0", dir.path().join("db")).unwrap();
        assert!(server.applier().store().is_persistent());
        assert_eq!(server.recover().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults().unwrap();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.failed_requests, 0);
        assert_eq!(server.rooms().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_requires_actor() {
        let applier = memory_applier();
        let err = dispatch(&applier, None, Command::ListBoards).await.unwrap_err();
        assert!(matches!(err, BoardError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn test_dispatch_board_workflow() {
        let applier = memory_applier();
        let ada = registered(&applier, "Ada", "ada@example.com").await;

        let board = match dispatch(
            &applier,
            Some(ada),
            Command::CreateBoard {
                title: "Launch".into(),
                description: String::new(),
            },
        )
        .await
        {
            Ok(Reply::Board(board)) => board,
            other => panic!("expected a board, got {other:?}"),
        };
        let list = match dispatch(
            &applier,
            Some(ada),
            Command::CreateList {
                board_id: board.id,
                title: "To Do".into(),
            },
        )
        .await
        {
            Ok(Reply::List(list)) => list,
            other => panic!("expected a list, got {other:?}"),
        };
        let task = match dispatch(
            &applier,
            Some(ada),
            Command::CreateTask {
                list_id: list.id,
                task: NewTask::titled("Write docs"),
            },
        )
        .await
        {
            Ok(Reply::Task(task)) => task,
            other => panic!("expected a task, got {other:?}"),
        };

        let reply = dispatch(
            &applier,
            Some(ada),
            Command::MoveTask {
                task_id: task.id,
                request: MoveTaskRequest {
                    list_id: None,
                    position: 5,
                },
            },
        )
        .await
        .unwrap();
        match reply {
            Reply::TaskMoved {
                source_list_id,
                dest_list_id,
                position,
                ..
            } => {
                assert_eq!(source_list_id, list.id);
                assert_eq!(dest_list_id, list.id);
                assert_eq!(position, 0);
            }
            other => panic!("expected task moved, got {other:?}"),
        }

        match dispatch(&applier, Some(ada), Command::FetchBoard { board_id: board.id }).await {
            Ok(Reply::Snapshot(snapshot)) => {
                assert_eq!(snapshot.lists.len(), 1);
                assert_eq!(snapshot.lists[0].tasks[0].title, "Write docs");
            }
            other => panic!("expected a snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_missing_task() {
        let applier = memory_applier();
        let ada = registered(&applier, "Ada", "ada@example.com").await;
        let missing = Uuid::new_v4();
        let err = dispatch(&applier, Some(ada), Command::DeleteTask { task_id: missing })
            .await
            .unwrap_err();
        assert_eq!(err, BoardError::not_found(EntityKind::Task, missing));
    }
}
