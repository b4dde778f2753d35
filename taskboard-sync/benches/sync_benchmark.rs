use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use taskboard_core::model::{MoveTaskRequest, NewTask, Task, TaskList};
use taskboard_core::{BoardEvent, Priority, TaskView};
use taskboard_sync::protocol::Frame;
use taskboard_sync::storage::{Filter, MemoryStore, RecordStore, RocksStore, StoreConfig};
use taskboard_sync::{Broadcaster, MutationApplier, RoomRegistry};
use tokio::sync::mpsc;
use uuid::Uuid;

fn sample_event() -> BoardEvent {
    let board_id = Uuid::new_v4();
    let list_id = Uuid::new_v4();
    let mut task = Task::new(board_id, list_id, "Ship the release notes", 3);
    task.description = "x".repeat(200);
    task.priority = Priority::High;
    let task: TaskView = task.view(|_| None);
    BoardEvent::TaskMoved {
        task,
        source_list_id: Uuid::new_v4(),
        dest_list_id: list_id,
        position: 3,
    }
}

fn bench_event_frame_encode(c: &mut Criterion) {
    let event = sample_event();
    c.bench_function("event_frame_encode", |b| {
        b.iter(|| {
            let frame = Frame::event(black_box(&event)).unwrap();
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_event_frame_decode(c: &mut Criterion) {
    let bytes = Frame::event(&sample_event()).unwrap().encode().unwrap();
    c.bench_function("event_frame_decode", |b| {
        b.iter(|| {
            let frame = Frame::decode(black_box(&bytes)).unwrap();
            black_box(frame.board_event().unwrap());
        })
    });
}

fn bench_emit_100_subscribers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let event = sample_event();
    let board_id = event.board_id();

    c.bench_function("emit_100_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let rooms = RoomRegistry::new(1024);
                let mut outboxes = Vec::new();
                for _ in 0..100 {
                    let (tx, rx) = mpsc::channel(16);
                    rooms.subscribe(board_id, Uuid::new_v4(), Uuid::new_v4(), tx).await;
                    outboxes.push(rx);
                }
                let delivered = rooms.emit(black_box(&event)).await.unwrap();
                black_box(delivered);
            });
        })
    });
}

fn bench_applier_move_100_tasks(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let applier = MutationApplier::new(
        Arc::new(MemoryStore::new()),
        Arc::new(RoomRegistry::new(64)),
    );
    let (owner, first) = rt.block_on(async {
        let owner = applier
            .register_user("Bench", "bench@example.com")
            .await
            .unwrap()
            .id;
        let board = applier.create_board(owner, "Bench", "").await.unwrap();
        let list = applier.create_list(owner, board.id, "To Do").await.unwrap();
        let mut first = None;
        for i in 0..100 {
            let task = applier
                .create_task(owner, list.id, &NewTask::titled(format!("task {i}")))
                .await
                .unwrap();
            first.get_or_insert(task.id);
        }
        (owner, first.unwrap())
    });

    c.bench_function("applier_move_within_100_tasks", |b| {
        let mut to_end = true;
        b.iter(|| {
            let position = if to_end { 99 } else { 0 };
            to_end = !to_end;
            rt.block_on(async {
                let moved = applier
                    .move_task(
                        owner,
                        first,
                        MoveTaskRequest {
                            list_id: None,
                            position,
                        },
                    )
                    .await
                    .unwrap();
                black_box(moved);
            });
        })
    });
}

fn bench_rocks_shift_100_tasks(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("taskboard_bench_shift_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig::at(&dir)).unwrap();
    let board_id = Uuid::new_v4();
    let list = TaskList::new(board_id, "To Do", 0);
    store.create(&list).unwrap();
    for i in 0..100 {
        store
            .create(&Task::new(board_id, list.id, format!("task {i}"), i))
            .unwrap();
    }
    let filter = Filter::list(list.id);

    c.bench_function("rocks_shift_100_tasks", |b| {
        let mut amount = 1;
        b.iter(|| {
            let changed = store.update_many::<Task>(black_box(&filter), amount).unwrap();
            amount = -amount;
            black_box(changed);
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_event_frame_encode,
    bench_event_frame_decode,
    bench_emit_100_subscribers,
    bench_applier_move_100_tasks,
    bench_rocks_shift_100_tasks,
);
criterion_main!(benches);
