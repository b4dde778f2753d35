//! WebSocket client keeping optimistic board replicas in sync.
//!
//! Provides:
//! - Connection lifecycle and request/response correlation by request id
//! - One [`Reconciler`] per open board, fed by room events
//! - Optimistic local mutations with resync on rejection
//!
//! Snapshots are installed by the reader task before it reads the next
//! frame, so no event that follows a snapshot on the wire can be merged
//! into the stale replica or dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use taskboard_core::model::UserSummary;
use taskboard_core::{
    BoardError, BoardEvent, BoardSnapshot, CloseReason, LocalMutation, MergeOutcome,
    ReconcileError, Reconciler, ReplicaPhase, SyncState,
};

use crate::protocol::{Command, Frame, FrameKind, ProtocolError, Reply};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the board client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A canonical event was merged into an open board
    Merged(BoardEvent),
    /// An open board was deleted or we were removed from it
    Closed { board_id: Uuid, reason: CloseReason },
    /// A rejected mutation discarded the replica; a fresh snapshot follows
    Reverted { board_id: Uuid },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("request rejected: {0}")]
    Rejected(#[from] BoardError),

    #[error(transparent)]
    Replica(#[from] ReconcileError),

    #[error("not connected")]
    NotConnected,

    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),
}

type Replies = Arc<Mutex<HashMap<u64, Pending>>>;
type Boards = Arc<Mutex<HashMap<Uuid, Reconciler>>>;

/// A request awaiting its response.
struct Pending {
    tx: oneshot::Sender<Result<Reply, BoardError>>,
    /// Board whose replica a snapshot reply replaces
    install: Option<Uuid>,
}

/// Board client.
pub struct BoardClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Registered user we act as, set by `hello`
    user: Option<UserSummary>,
    next_request: AtomicU64,
    pending: Replies,
    boards: Boards,
    request_timeout: Duration,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl BoardClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            user: None,
            next_request: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            boards: Arc::new(Mutex::new(HashMap::new())),
            request_timeout: Duration::from_secs(5),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route responses and merge events
        let pending = self.pending.clone();
        let boards = self.boards.clone();
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match Frame::decode(&data) {
                        Ok(frame) => handle_frame(frame, &pending, &boards, &event_tx).await,
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: outstanding requests fail with ConnectionClosed
            *state.write().await = ConnectionState::Disconnected;
            pending.lock().await.clear();
            notify(&event_tx, ClientEvent::Disconnected);
        });

        *self.state.write().await = ConnectionState::Connected;
        notify(&self.event_tx, ClientEvent::Connected);
        log::info!("Connected to {}", self.server_url);
        Ok(())
    }

    /// Close the connection. The reader task reports `Disconnected`.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    async fn roundtrip(&self, frame: Frame, install: Option<Uuid>) -> Result<Reply, ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let request_id = frame.request_id;
        self.pending.lock().await.insert(
            request_id,
            Pending {
                tx: reply_tx,
                install,
            },
        );

        if tx.send(frame.encode()?).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(ProtocolError::ConnectionClosed.into());
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(ProtocolError::Timeout.into())
            }
        }
    }

    fn next_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    fn actor_id(&self) -> Uuid {
        self.user.as_ref().map_or(Uuid::nil(), |user| user.id)
    }

    /// Send a command and wait for its reply.
    pub async fn request(&self, command: &Command) -> Result<Reply, ClientError> {
        let frame = Frame::request(self.actor_id(), self.next_id(), command)?;
        self.roundtrip(frame, None).await
    }

    /// Register a new user. Does not sign in; call [`hello`](Self::hello).
    pub async fn register(&self, name: &str, email: &str) -> Result<UserSummary, ClientError> {
        let command = Command::RegisterUser {
            name: name.to_string(),
            email: email.to_string(),
        };
        match self.request(&command).await? {
            Reply::User(user) => Ok(user),
            _ => Err(ClientError::UnexpectedReply("register_user")),
        }
    }

    /// Act as `user_id` on this connection.
    pub async fn hello(&mut self, user_id: Uuid) -> Result<UserSummary, ClientError> {
        match self.roundtrip(Frame::hello(user_id, self.next_id()), None).await? {
            Reply::Welcome(user) => {
                self.user = Some(user.clone());
                Ok(user)
            }
            _ => Err(ClientError::UnexpectedReply("hello")),
        }
    }

    /// Join a board's room and load its snapshot into a fresh replica.
    pub async fn open_board(&self, board_id: Uuid) -> Result<BoardSnapshot, ClientError> {
        match self
            .roundtrip(Frame::join(self.actor_id(), board_id, self.next_id()), None)
            .await?
        {
            Reply::Joined { .. } => {}
            _ => return Err(ClientError::UnexpectedReply("join")),
        }
        self.boards
            .lock()
            .await
            .insert(board_id, Reconciler::new(board_id, self.actor_id()));
        self.resync(board_id).await
    }

    /// Fetch a fresh snapshot and install it into the board's replica.
    pub async fn resync(&self, board_id: Uuid) -> Result<BoardSnapshot, ClientError> {
        let frame = Frame::request(
            self.actor_id(),
            self.next_id(),
            &Command::FetchBoard { board_id },
        )?;
        match self.roundtrip(frame, Some(board_id)).await? {
            Reply::Snapshot(snapshot) => Ok(snapshot),
            _ => Err(ClientError::UnexpectedReply("fetch_board")),
        }
    }

    /// Leave a board's room and drop its replica.
    pub async fn leave_board(&self, board_id: Uuid) -> Result<(), ClientError> {
        if let Some(mut reconciler) = self.boards.lock().await.remove(&board_id) {
            reconciler.leave();
        }
        match self
            .roundtrip(Frame::leave(self.actor_id(), board_id, self.next_id()), None)
            .await?
        {
            Reply::Left { .. } => Ok(()),
            _ => Err(ClientError::UnexpectedReply("leave")),
        }
    }

    /// Apply a mutation optimistically, then ask the server for it.
    ///
    /// On rejection the replica is discarded and refetched before the
    /// error is returned.
    pub async fn apply(&self, board_id: Uuid, mutation: LocalMutation) -> Result<Reply, ClientError> {
        {
            let mut boards = self.boards.lock().await;
            let reconciler = boards
                .get_mut(&board_id)
                .ok_or(ReconcileError::NotLive(board_id))?;
            reconciler.apply_local(&mutation)?;
        }

        match self.request(&Command::from(&mutation)).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                log::warn!("Mutation on board {board_id} failed: {e}");
                if let Some(reconciler) = self.boards.lock().await.get_mut(&board_id) {
                    reconciler.request_failed();
                }
                notify(&self.event_tx, ClientEvent::Reverted { board_id });
                if let Err(resync) = self.resync(board_id).await {
                    log::warn!("Resync of board {board_id} failed: {resync}");
                }
                Err(e)
            }
        }
    }

    /// Application-level ping; the server answers with `Pong`.
    pub async fn send_ping(&self) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Frame::ping(self.actor_id()).encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        Ok(())
    }

    /// Current replica of an open board.
    pub async fn replica(&self, board_id: Uuid) -> Option<BoardSnapshot> {
        self.boards
            .lock()
            .await
            .get(&board_id)
            .and_then(|reconciler| reconciler.replica().cloned())
    }

    pub async fn phase(&self, board_id: Uuid) -> Option<ReplicaPhase> {
        self.boards.lock().await.get(&board_id).map(Reconciler::phase)
    }

    pub async fn sync_state(&self, board_id: Uuid, id: Uuid) -> Option<SyncState> {
        self.boards
            .lock()
            .await
            .get(&board_id)
            .and_then(|reconciler| reconciler.sync_state(id))
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn user(&self) -> Option<&UserSummary> {
        self.user.as_ref()
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

fn notify(event_tx: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    if event_tx.try_send(event).is_err() {
        log::debug!("Client event dropped: receiver full or gone");
    }
}

async fn handle_frame(
    frame: Frame,
    pending: &Mutex<HashMap<u64, Pending>>,
    boards: &Mutex<HashMap<Uuid, Reconciler>>,
    event_tx: &mpsc::Sender<ClientEvent>,
) {
    match frame.kind {
        FrameKind::Response => {
            let result = match frame.reply() {
                Ok(result) => result,
                Err(e) => {
                    log::warn!("Bad response {}: {e}", frame.request_id);
                    return;
                }
            };
            let Some(waiter) = pending.lock().await.remove(&frame.request_id) else {
                log::debug!("Response {} has no waiter", frame.request_id);
                return;
            };
            if let (Some(board_id), Ok(Reply::Snapshot(snapshot))) = (waiter.install, &result) {
                if let Some(reconciler) = boards.lock().await.get_mut(&board_id) {
                    if let Err(e) = reconciler.install_snapshot(snapshot.clone()) {
                        log::warn!("Snapshot not installed: {e}");
                    }
                }
            }
            let _ = waiter.tx.send(result);
        }

        FrameKind::Event => {
            let event = match frame.board_event() {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("Bad event frame: {e}");
                    return;
                }
            };
            let board_id = event.board_id();
            let outcome = match boards.lock().await.get_mut(&board_id) {
                Some(reconciler) => reconciler.apply_event(&event),
                None => MergeOutcome::Ignored,
            };
            match outcome {
                MergeOutcome::Applied => notify(event_tx, ClientEvent::Merged(event)),
                MergeOutcome::Closed(reason) => {
                    notify(event_tx, ClientEvent::Closed { board_id, reason })
                }
                MergeOutcome::Ignored => log::trace!("Ignored {} for {board_id}", event.name()),
            }
        }

        FrameKind::Pong => log::trace!("Pong"),

        other => log::debug!("Unexpected {other:?} frame from server"),
    }
}
