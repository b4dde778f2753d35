//! Board rooms: fan-out of canonical events to every subscribed connection.
//!
//! Each board with at least one subscriber has a room holding a tokio
//! broadcast channel. An event is encoded once and sent to the channel; every
//! subscription owns a receiver and a small forwarder task that copies frames
//! into the connection's outbox. The originator of a mutation is subscribed
//! like everyone else and receives its own echo.
//!
//! Delivery is at-most-once per subscription and in emit order. A room keeps
//! no backlog: a late subscriber sees only events emitted after it joined.
//! Empty rooms are removed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use uuid::Uuid;

use taskboard_core::BoardEvent;

use crate::protocol::{Frame, ProtocolError};

/// Encoded frame shared by every receiver of one emit.
pub type SharedFrame = Arc<Vec<u8>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub events_dropped: u64,
    pub active_rooms: usize,
    pub subscriptions: usize,
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcaster is shut down")]
    Unavailable,

    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// Outbound side of the real-time channel, as seen by the mutation applier.
pub trait Broadcaster: Send + Sync {
    /// Deliver `event` to every subscriber of its board. Returns how many
    /// subscriptions it reached.
    fn emit(&self, event: &BoardEvent) -> impl Future<Output = Result<usize, BroadcastError>> + Send;

    /// Drop the room of a deleted board once queued events are delivered.
    fn close_room(&self, board_id: Uuid) -> impl Future<Output = usize> + Send;

    /// Unsubscribe every connection of `actor_id` from a board.
    fn evict(&self, board_id: Uuid, actor_id: Uuid) -> impl Future<Output = usize> + Send;
}

struct Subscriber {
    actor_id: Uuid,
    /// Dropping this stops the forwarder after it drains what is queued.
    _stop: oneshot::Sender<()>,
}

struct Room {
    sender: broadcast::Sender<SharedFrame>,
    subscribers: HashMap<Uuid, Subscriber>,
}

struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
}

/// Registry of rooms keyed by board id.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Room>>,
    /// Frames buffered per subscription before a slow peer starts lagging
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
    shut_down: AtomicBool,
}

impl RoomRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: Arc::new(AtomicBroadcastStats {
                events_sent: AtomicU64::new(0),
                events_dropped: AtomicU64::new(0),
            }),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Subscribe `connection_id` to a board's room, creating the room if
    /// needed. Frames go to `outbox`. Returns false if already subscribed.
    pub async fn subscribe(
        &self,
        board_id: Uuid,
        connection_id: Uuid,
        actor_id: Uuid,
        outbox: mpsc::Sender<SharedFrame>,
    ) -> bool {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(board_id).or_insert_with(|| {
            log::debug!("Room {board_id} opened");
            Room {
                sender: broadcast::channel(self.capacity).0,
                subscribers: HashMap::new(),
            }
        });
        if room.subscribers.contains_key(&connection_id) {
            return false;
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let rx = room.sender.subscribe();
        tokio::spawn(forward(rx, stop_rx, outbox, self.stats.clone(), connection_id));
        room.subscribers.insert(
            connection_id,
            Subscriber {
                actor_id,
                _stop: stop_tx,
            },
        );
        log::debug!("Connection {connection_id} joined room {board_id}");
        true
    }

    /// Returns false if the connection was not subscribed.
    pub async fn unsubscribe(&self, board_id: Uuid, connection_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&board_id) else {
            return false;
        };
        let removed = room.subscribers.remove(&connection_id).is_some();
        if room.subscribers.is_empty() {
            rooms.remove(&board_id);
            log::debug!("Room {board_id} removed (empty)");
        }
        removed
    }

    /// Drop every subscription of a connection. Called on disconnect.
    pub async fn unsubscribe_all(&self, connection_id: Uuid) -> usize {
        let mut rooms = self.rooms.write().await;
        let mut removed = 0;
        rooms.retain(|_, room| {
            if room.subscribers.remove(&connection_id).is_some() {
                removed += 1;
            }
            !room.subscribers.is_empty()
        });
        removed
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn subscriber_count(&self, board_id: Uuid) -> usize {
        self.rooms
            .read()
            .await
            .get(&board_id)
            .map_or(0, |room| room.subscribers.len())
    }

    pub async fn is_subscribed(&self, board_id: Uuid, connection_id: Uuid) -> bool {
        self.rooms
            .read()
            .await
            .get(&board_id)
            .is_some_and(|room| room.subscribers.contains_key(&connection_id))
    }

    /// Stop accepting events. Later emits fail with
    /// [`BroadcastError::Unavailable`].
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    pub async fn stats(&self) -> BroadcastStats {
        let rooms = self.rooms.read().await;
        BroadcastStats {
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            active_rooms: rooms.len(),
            subscriptions: rooms.values().map(|room| room.subscribers.len()).sum(),
        }
    }
}

impl Broadcaster for RoomRegistry {
    async fn emit(&self, event: &BoardEvent) -> Result<usize, BroadcastError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BroadcastError::Unavailable);
        }
        let encoded: SharedFrame = Arc::new(Frame::event(event)?.encode()?);

        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(&event.board_id()) else {
            return Ok(0);
        };
        let reached = room.sender.send(encoded).unwrap_or(0);
        self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Emitted {} to board {} ({reached} subscribers)",
            event.name(),
            event.board_id()
        );
        Ok(reached)
    }

    async fn close_room(&self, board_id: Uuid) -> usize {
        // Dropping the sender lets each forwarder drain and then stop.
        let room = self.rooms.write().await.remove(&board_id);
        let closed = room.map_or(0, |room| room.subscribers.len());
        if closed > 0 {
            log::info!("Room {board_id} closed ({closed} subscribers)");
        }
        closed
    }

    async fn evict(&self, board_id: Uuid, actor_id: Uuid) -> usize {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&board_id) else {
            return 0;
        };
        let before = room.subscribers.len();
        room.subscribers.retain(|_, s| s.actor_id != actor_id);
        let evicted = before - room.subscribers.len();
        if room.subscribers.is_empty() {
            rooms.remove(&board_id);
        }
        evicted
    }
}

/// Copy frames from a room into one connection's outbox until the room
/// closes, the subscription is dropped, or the connection goes away.
async fn forward(
    mut rx: broadcast::Receiver<SharedFrame>,
    mut stop: oneshot::Receiver<()>,
    outbox: mpsc::Sender<SharedFrame>,
    stats: Arc<AtomicBroadcastStats>,
    connection_id: Uuid,
) {
    loop {
        tokio::select! {
            // Queued frames go out before a stop is honoured.
            biased;
            msg = rx.recv() => match msg {
                Ok(frame) => {
                    if outbox.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    stats.events_dropped.fetch_add(n, Ordering::Relaxed);
                    log::warn!("Connection {connection_id} lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut stop => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskboard_core::model::TaskList;
    use tokio::time::{timeout, Duration};

    fn list_event(board_id: Uuid, title: &str) -> BoardEvent {
        BoardEvent::ListCreated {
            list: TaskList::new(board_id, title, 0),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<SharedFrame>) -> Option<BoardEvent> {
        let frame = timeout(Duration::from_millis(500), rx.recv()).await.ok()??;
        Frame::decode(&frame).ok()?.board_event().ok()
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let registry = RoomRegistry::new(16);
        let (board, conn) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx, _rx) = mpsc::channel(16);

        assert!(registry.subscribe(board, conn, Uuid::new_v4(), tx.clone()).await);
        assert!(!registry.subscribe(board, conn, Uuid::new_v4(), tx).await);
        assert!(registry.is_subscribed(board, conn).await);
        assert_eq!(registry.room_count().await, 1);

        assert!(registry.unsubscribe(board, conn).await);
        assert!(!registry.unsubscribe(board, conn).await);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber_in_order() {
        let registry = RoomRegistry::new(16);
        let board = Uuid::new_v4();
        let (tx1, mut rx1) = mpsc::channel(16);
        let (tx2, mut rx2) = mpsc::channel(16);
        registry.subscribe(board, Uuid::new_v4(), Uuid::new_v4(), tx1).await;
        registry.subscribe(board, Uuid::new_v4(), Uuid::new_v4(), tx2).await;

        let first = list_event(board, "first");
        let second = list_event(board, "second");
        assert_eq!(registry.emit(&first).await.unwrap(), 2);
        assert_eq!(registry.emit(&second).await.unwrap(), 2);

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(next_event(rx).await, Some(first.clone()));
            assert_eq!(next_event(rx).await, Some(second.clone()));
        }
        assert_eq!(registry.stats().await.events_sent, 2);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let registry = RoomRegistry::new(16);
        let (board_a, board_b) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx, mut rx) = mpsc::channel(16);
        registry.subscribe(board_a, Uuid::new_v4(), Uuid::new_v4(), tx).await;

        assert_eq!(registry.emit(&list_event(board_b, "elsewhere")).await.unwrap(), 0);
        assert!(next_event(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_no_backlog_for_late_subscriber() {
        let registry = RoomRegistry::new(16);
        let board = Uuid::new_v4();
        let (early_tx, _early_rx) = mpsc::channel(16);
        registry.subscribe(board, Uuid::new_v4(), Uuid::new_v4(), early_tx).await;
        registry.emit(&list_event(board, "before")).await.unwrap();

        let (late_tx, mut late_rx) = mpsc::channel(16);
        registry.subscribe(board, Uuid::new_v4(), Uuid::new_v4(), late_tx).await;
        let after = list_event(board, "after");
        registry.emit(&after).await.unwrap();

        assert_eq!(next_event(&mut late_rx).await, Some(after));
    }

    #[tokio::test]
    async fn test_close_room_delivers_queued_event() {
        let registry = RoomRegistry::new(16);
        let board = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(16);
        registry.subscribe(board, Uuid::new_v4(), Uuid::new_v4(), tx).await;

        let deleted = BoardEvent::BoardDeleted { board_id: board };
        registry.emit(&deleted).await.unwrap();
        assert_eq!(registry.close_room(board).await, 1);

        assert_eq!(next_event(&mut rx).await, Some(deleted));
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_evict_removes_only_that_actor() {
        let registry = RoomRegistry::new(16);
        let board = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx, _rx) = mpsc::channel(16);
        registry.subscribe(board, Uuid::new_v4(), alice, tx.clone()).await;
        registry.subscribe(board, Uuid::new_v4(), alice, tx.clone()).await;
        registry.subscribe(board, Uuid::new_v4(), bob, tx).await;

        assert_eq!(registry.evict(board, alice).await, 2);
        assert_eq!(registry.subscriber_count(board).await, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_on_disconnect() {
        let registry = RoomRegistry::new(16);
        let conn = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(16);
        for _ in 0..3 {
            registry.subscribe(Uuid::new_v4(), conn, Uuid::new_v4(), tx.clone()).await;
        }
        assert_eq!(registry.unsubscribe_all(conn).await, 3);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_emit_after_shutdown_fails() {
        let registry = RoomRegistry::new(16);
        registry.shutdown();
        assert!(matches!(
            registry.emit(&list_event(Uuid::new_v4(), "x")).await,
            Err(BroadcastError::Unavailable)
        ));
    }
}
