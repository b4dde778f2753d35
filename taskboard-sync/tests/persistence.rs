//! Persistence integration tests.
//!
//! Verifies:
//! - Boards, lists, tasks and activity survive a store reopen
//! - Recovery reports the boards a restarted server will serve
//! - Moves on the RocksDB store keep clean ledgers
//! - Board deletion leaves nothing behind on disk, index included

use std::sync::Arc;

use tempfile::tempdir;
use uuid::Uuid;

use taskboard_core::model::{MoveTaskRequest, NewTask};
use taskboard_sync::storage::{Collection, RocksStore, StoreConfig};
use taskboard_sync::{MutationApplier, RoomRegistry, SyncServer};

// ─── Helpers ─────────────────────────────────────────────────────────────────

type RocksApplier = MutationApplier<RocksStore, RoomRegistry>;

fn open(path: &std::path::Path) -> RocksApplier {
    let store = RocksStore::open(StoreConfig::for_testing(path)).unwrap();
    MutationApplier::new(Arc::new(store), Arc::new(RoomRegistry::new(16)))
}

struct Seeded {
    owner: Uuid,
    board_id: Uuid,
    todo: Uuid,
    done: Uuid,
    tasks: Vec<Uuid>,
}

/// "To Do" [A, B, C] and an empty "Done".
async fn seed(applier: &RocksApplier) -> Seeded {
    let owner = applier
        .register_user("Ada", "ada@example.com")
        .await
        .unwrap()
        .id;
    let board_id = applier.create_board(owner, "Roadmap", "Q3").await.unwrap().id;
    let todo = applier.create_list(owner, board_id, "To Do").await.unwrap().id;
    let done = applier.create_list(owner, board_id, "Done").await.unwrap().id;
    let mut tasks = Vec::new();
    for title in ["A", "B", "C"] {
        let task = applier
            .create_task(owner, todo, &NewTask::titled(title))
            .await
            .unwrap();
        tasks.push(task.id);
    }
    Seeded {
        owner,
        board_id,
        todo,
        done,
        tasks,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_board_survives_reopen() {
    let dir = tempdir().unwrap();
    let seeded = {
        let applier = open(dir.path());
        let seeded = seed(&applier).await;
        applier
            .move_task(
                seeded.owner,
                seeded.tasks[2],
                MoveTaskRequest {
                    list_id: Some(seeded.done),
                    position: 0,
                },
            )
            .await
            .unwrap();
        applier.store().sync().unwrap();
        seeded
    };

    let applier = open(dir.path());
    let snapshot = applier.fetch_board(seeded.owner, seeded.board_id).await.unwrap();
    snapshot.assert_ordered();
    assert_eq!(snapshot.board.title, "Roadmap");
    assert_eq!(snapshot.board.created_by.name, "Ada");
    assert_eq!(snapshot.list(seeded.todo).unwrap().task_ids(), seeded.tasks[..2].to_vec());
    assert_eq!(snapshot.list(seeded.done).unwrap().task_ids(), vec![seeded.tasks[2]]);

    let activity = applier
        .recent_activity(seeded.owner, seeded.board_id, 100)
        .await
        .unwrap();
    assert_eq!(activity.len(), 7);
}

#[tokio::test]
async fn test_server_recovery_counts_boards() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    {
        let applier = open(&db_path);
        seed(&applier).await;
        let owner = applier
            .register_user("Bob", "bob@example.com")
            .await
            .unwrap()
            .id;
        applier.create_board(owner, "Second", "").await.unwrap();
        applier.store().sync().unwrap();
    }

    let server = SyncServer::with_storage("127.0.0.1:0", &db_path).unwrap();
    assert_eq!(server.recover().unwrap(), 2);
}

#[tokio::test]
async fn test_reorders_keep_ledger_clean_on_disk() {
    let dir = tempdir().unwrap();
    let applier = open(dir.path());
    let seeded = seed(&applier).await;

    for (task, index) in [(0, 2), (1, 0), (2, 1), (0, 0)] {
        applier
            .move_task(
                seeded.owner,
                seeded.tasks[task],
                MoveTaskRequest {
                    list_id: None,
                    position: index,
                },
            )
            .await
            .unwrap();
    }

    let snapshot = applier.fetch_board(seeded.owner, seeded.board_id).await.unwrap();
    let positions: Vec<i64> = snapshot
        .list(seeded.todo)
        .unwrap()
        .tasks
        .iter()
        .map(|t| t.position)
        .collect();
    assert_eq!(positions, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_board_deletion_clears_store() {
    let dir = tempdir().unwrap();
    let applier = open(dir.path());
    let seeded = seed(&applier).await;

    applier.delete_board(seeded.owner, seeded.board_id).await.unwrap();

    let store = applier.store();
    for collection in [
        Collection::Boards,
        Collection::Lists,
        Collection::Tasks,
        Collection::Activities,
    ] {
        assert_eq!(store.count(collection).unwrap(), 0, "{collection:?} not empty");
        assert_eq!(store.index_count(collection).unwrap(), 0, "{collection:?} index not empty");
    }
    assert_eq!(store.count(Collection::Users).unwrap(), 1);
    assert_eq!(store.index_count(Collection::Users).unwrap(), 1);
}
