//! Mutation applier: the only writer of board state.
//!
//! ```text
//!  command ─► validate ─► lock board ─► load + check access ─► store steps ─► audit ─► emit
//!                                                                  │
//!                                                   first step fails: Store
//!                                                   later step fails: PartialApply
//! ```
//!
//! Every mutation of a board runs under that board's async lock, so two
//! requests touching the same board never interleave their store steps.
//! Boards do not block each other. A lock exists only for a board that was
//! found in the store, and is dropped with the board. User registration has
//! its own lock around the unique-email check. Store steps of one mutation are applied
//! in order with no rollback; a read-side repair pass on the next snapshot
//! fetch restores a clean ledger after a partial failure.
//!
//! The audit entry and the broadcast are best effort: when either fails the
//! mutation has already been persisted, so the failure is logged and the
//! caller still gets success.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use taskboard_core::error::{BoardError, EntityKind};
use taskboard_core::ledger::{self, Position, Positioned};
use taskboard_core::model::{
    clean_email, clean_text, clean_title, now_secs, Activity, ActivityAction, Board, BoardView,
    MoveTaskRequest, NewTask, Task, TaskList, TaskPatch, TaskView, User, UserSummary,
    MAX_BOARD_DESCRIPTION, MAX_BOARD_TITLE, MAX_LIST_TITLE, MAX_TASK_DESCRIPTION, MAX_TASK_TITLE,
    MAX_USER_NAME,
};
use taskboard_core::planner::{plan_move, ContainerView, MovePlan, PlanError, PlanStep};
use taskboard_core::{BoardEvent, BoardSnapshot, ListReplica};

use crate::broadcast::Broadcaster;
use crate::storage::{Filter, Record, RecordStore, StoreError};

pub const DEFAULT_ACTIVITY_LIMIT: usize = 20;
pub const MAX_ACTIVITY_LIMIT: usize = 100;

/// Result of a task move, as broadcast in `task:moved`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovedTask {
    pub task: TaskView,
    pub source_list_id: Uuid,
    pub dest_list_id: Uuid,
    /// Zero-based index of the task in its destination list.
    pub position: Position,
}

/// Counts the sequential store steps of one mutation and classifies a
/// failure by whether anything had already landed.
struct StepRunner {
    item: Uuid,
    done: usize,
}

impl StepRunner {
    fn new(item: Uuid) -> Self {
        Self { item, done: 0 }
    }

    fn step<T>(&mut self, result: Result<T, StoreError>) -> Result<T, BoardError> {
        match result {
            Ok(value) => {
                self.done += 1;
                Ok(value)
            }
            Err(e) => {
                log::error!("Store step {} for {} failed: {e}", self.done + 1, self.item);
                if self.done == 0 {
                    Err(e.into())
                } else {
                    Err(BoardError::PartialApply {
                        item: self.item,
                        completed_steps: self.done,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }
}

fn plan_error(e: PlanError) -> BoardError {
    BoardError::Validation(e.to_string())
}

fn index_from(position: Position) -> usize {
    usize::try_from(position.max(0)).unwrap_or(usize::MAX)
}

fn not_member() -> BoardError {
    BoardError::AccessDenied("Not a member of this board".into())
}

pub struct MutationApplier<S, B> {
    store: Arc<S>,
    broadcaster: Arc<B>,
    /// Per-board mutation locks, created on first use of an existing board
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    /// Held across the email check and insert of a new user
    registration: Mutex<()>,
}

impl<S: RecordStore, B: Broadcaster> MutationApplier<S, B> {
    pub fn new(store: Arc<S>, broadcaster: Arc<B>) -> Self {
        Self {
            store,
            broadcaster,
            locks: Mutex::new(HashMap::new()),
            registration: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<B> {
        &self.broadcaster
    }

    /// Lock a board for one mutation. Unknown boards fail with NotFound
    /// without leaving an entry behind.
    async fn lock_board(&self, board_id: Uuid) -> Result<OwnedMutexGuard<()>, BoardError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            match locks.get(&board_id) {
                Some(lock) => lock.clone(),
                None => {
                    self.find_board(board_id)?;
                    locks.entry(board_id).or_default().clone()
                }
            }
        };
        Ok(lock.lock_owned().await)
    }

    // ─── Loading and access ───────────────────────────────────────────

    fn find_board(&self, board_id: Uuid) -> Result<Board, BoardError> {
        self.store
            .find_by_id(board_id)?
            .ok_or(BoardError::not_found(EntityKind::Board, board_id))
    }

    fn find_list(&self, list_id: Uuid) -> Result<TaskList, BoardError> {
        self.store
            .find_by_id(list_id)?
            .ok_or(BoardError::not_found(EntityKind::List, list_id))
    }

    fn find_task(&self, task_id: Uuid) -> Result<Task, BoardError> {
        self.store
            .find_by_id(task_id)?
            .ok_or(BoardError::not_found(EntityKind::Task, task_id))
    }

    fn find_user(&self, user_id: Uuid) -> Result<User, BoardError> {
        self.store
            .find_by_id(user_id)?
            .ok_or(BoardError::not_found(EntityKind::User, user_id))
    }

    fn member_board(&self, actor: Uuid, board_id: Uuid) -> Result<Board, BoardError> {
        let board = self.find_board(board_id)?;
        if !board.is_member(actor) {
            return Err(not_member());
        }
        Ok(board)
    }

    fn owned_board(&self, actor: Uuid, board_id: Uuid, action: &str) -> Result<Board, BoardError> {
        let board = self.find_board(board_id)?;
        if !board.is_owner(actor) {
            return Err(BoardError::AccessDenied(format!(
                "Only the board owner can {action}"
            )));
        }
        Ok(board)
    }

    /// Lock the board owning `list_id`, then re-read the list under the lock.
    async fn lock_list(
        &self,
        actor: Uuid,
        list_id: Uuid,
    ) -> Result<(OwnedMutexGuard<()>, TaskList), BoardError> {
        let board_id = self.find_list(list_id)?.board_id;
        let guard = self.lock_board(board_id).await?;
        let list = self.find_list(list_id)?;
        self.member_board(actor, board_id)?;
        Ok((guard, list))
    }

    /// Lock the board owning `task_id`, then re-read the task under the lock.
    async fn lock_task(
        &self,
        actor: Uuid,
        task_id: Uuid,
    ) -> Result<(OwnedMutexGuard<()>, Board, Task), BoardError> {
        let board_id = self.find_task(task_id)?.board_id;
        let guard = self.lock_board(board_id).await?;
        let task = self.find_task(task_id)?;
        let board = self.member_board(actor, board_id)?;
        Ok((guard, board, task))
    }

    // ─── Denormalization ──────────────────────────────────────────────

    fn summaries(
        &self,
        ids: impl IntoIterator<Item = Uuid>,
    ) -> Result<HashMap<Uuid, UserSummary>, BoardError> {
        let mut found = HashMap::new();
        for id in ids {
            if found.contains_key(&id) {
                continue;
            }
            if let Some(user) = self.store.find_by_id::<User>(id)? {
                found.insert(id, user.summary());
            }
        }
        Ok(found)
    }

    fn board_view(&self, board: &Board) -> Result<BoardView, BoardError> {
        let users = self.summaries(board.members.iter().copied().chain([board.created_by]))?;
        let created_by = users.get(&board.created_by).cloned().unwrap_or(UserSummary {
            id: board.created_by,
            name: String::new(),
            email: String::new(),
        });
        Ok(BoardView {
            id: board.id,
            title: board.title.clone(),
            description: board.description.clone(),
            created_by,
            members: board
                .members
                .iter()
                .filter_map(|id| users.get(id).cloned())
                .collect(),
            created_at: board.created_at,
            updated_at: board.updated_at,
        })
    }

    fn task_view(&self, task: &Task) -> Result<TaskView, BoardError> {
        let users = self.summaries(task.assignees.iter().copied())?;
        Ok(task.view(|id| users.get(&id).cloned()))
    }

    // ─── Side effects ─────────────────────────────────────────────────

    fn audit(&self, activity: Activity) {
        if let Err(e) = self.store.create(&activity) {
            log::warn!(
                "Failed to record {} on board {}: {e}",
                activity.action,
                activity.board_id
            );
        }
    }

    async fn publish(&self, event: BoardEvent) {
        if let Err(e) = self.broadcaster.emit(&event).await {
            log::warn!(
                "Broadcast of {} to board {} skipped: {e}",
                event.name(),
                event.board_id()
            );
        }
    }

    /// Run a move plan against the store. `container` turns a container id
    /// into the filter selecting its members; `place` writes the moved item.
    fn execute_plan<R: Record>(
        &self,
        plan: &MovePlan,
        container: fn(Uuid) -> Filter,
        place: impl Fn(Uuid, Position) -> Result<(), StoreError>,
    ) -> Result<(), BoardError> {
        let mut steps = StepRunner::new(plan.item);
        for step in &plan.steps {
            match step {
                PlanStep::Compact { assignments, .. } => {
                    steps.step(self.store.assign_positions::<R>(assignments))?;
                }
                PlanStep::Shift {
                    container: id,
                    range,
                    amount,
                } => {
                    let filter = container(*id).positions(*range);
                    steps.step(self.store.update_many::<R>(&filter, *amount))?;
                }
                PlanStep::Place {
                    container: id,
                    position,
                    ..
                } => {
                    steps.step(place(*id, *position))?;
                }
            }
        }
        Ok(())
    }

    /// Read-side repair: restore a clean ledger and persist what changed.
    /// A failed write is logged; the caller still gets the repaired order.
    fn repair<R: Record + Positioned>(&self, items: &mut [R]) {
        let changed = ledger::repair(items);
        if changed.is_empty() {
            return;
        }
        let assignments: Vec<(Uuid, Position)> = items
            .iter()
            .filter(|item| changed.contains(&Positioned::id(*item)))
            .map(|item| (Positioned::id(item), Positioned::position(item)))
            .collect();
        log::warn!("Repairing {} {} positions", assignments.len(), R::COLLECTION.name());
        if let Err(e) = self.store.assign_positions::<R>(&assignments) {
            log::warn!("Failed to persist repaired positions: {e}");
        }
    }

    // ─── Users ────────────────────────────────────────────────────────

    pub async fn register_user(&self, name: &str, email: &str) -> Result<UserSummary, BoardError> {
        let name = clean_title("Name", name, MAX_USER_NAME)?;
        let email = clean_email(email)?;
        let _registration = self.registration.lock().await;
        if self
            .store
            .find_one::<User>(&Filter::email(email.clone()))?
            .is_some()
        {
            return Err(BoardError::Validation(
                "User already exists with this email".into(),
            ));
        }
        let user = User::new(name, email);
        self.store.create(&user)?;
        log::info!("Registered user {} <{}>", user.id, user.email);
        Ok(user.summary())
    }

    pub async fn user(&self, user_id: Uuid) -> Result<UserSummary, BoardError> {
        Ok(self.find_user(user_id)?.summary())
    }

    /// Gate for joining a board's room.
    pub async fn ensure_member(&self, actor: Uuid, board_id: Uuid) -> Result<(), BoardError> {
        self.member_board(actor, board_id).map(|_| ())
    }

    // ─── Boards ───────────────────────────────────────────────────────

    pub async fn create_board(
        &self,
        actor: Uuid,
        title: &str,
        description: &str,
    ) -> Result<BoardView, BoardError> {
        let title = clean_title("Board title", title, MAX_BOARD_TITLE)?;
        let description = clean_text("Board description", description, MAX_BOARD_DESCRIPTION)?;
        self.find_user(actor)?;

        let board = Board::new(actor, title, description);
        self.store.create(&board)?;
        self.audit(
            Activity::new(board.id, actor, ActivityAction::BoardCreated).detail("board", &board.title),
        );
        log::info!("Board {} created by {actor}", board.id);
        self.board_view(&board)
    }

    /// Boards the actor is a member of, most recently updated first.
    pub async fn list_boards(&self, actor: Uuid) -> Result<Vec<BoardView>, BoardError> {
        let mut boards = self.store.find_many::<Board>(&Filter::member(actor))?;
        boards.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        boards.iter().map(|board| self.board_view(board)).collect()
    }

    /// Full ordered board state. Runs the repair pass on every container.
    pub async fn fetch_board(&self, actor: Uuid, board_id: Uuid) -> Result<BoardSnapshot, BoardError> {
        let _guard = self.lock_board(board_id).await?;
        let board = self.member_board(actor, board_id)?;

        let mut lists = self.store.find_many::<TaskList>(&Filter::board(board_id))?;
        self.repair(&mut lists);

        let mut snapshot = BoardSnapshot::new(self.board_view(&board)?);
        for list in lists {
            let mut tasks = self.store.find_many::<Task>(&Filter::list(list.id))?;
            self.repair(&mut tasks);
            let mut replica = ListReplica::new(list);
            replica.tasks = tasks
                .iter()
                .map(|task| self.task_view(task))
                .collect::<Result<_, _>>()?;
            snapshot.lists.push(replica);
        }
        Ok(snapshot)
    }

    pub async fn update_board(
        &self,
        actor: Uuid,
        board_id: Uuid,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<BoardView, BoardError> {
        let title = title
            .map(|t| clean_title("Board title", t, MAX_BOARD_TITLE))
            .transpose()?;
        let description = description
            .map(|d| clean_text("Board description", d, MAX_BOARD_DESCRIPTION))
            .transpose()?;

        let _guard = self.lock_board(board_id).await?;
        let mut board = self.owned_board(actor, board_id, "update it")?;
        if let Some(title) = title {
            board.title = title;
        }
        if let Some(description) = description {
            board.description = description;
        }
        board.updated_at = now_secs();
        self.store.save(&board)?;

        self.audit(
            Activity::new(board_id, actor, ActivityAction::BoardUpdated).detail("board", &board.title),
        );
        let view = self.board_view(&board)?;
        self.publish(BoardEvent::BoardUpdated {
            board: view.clone(),
        })
        .await;
        Ok(view)
    }

    /// Delete a board with its lists, tasks and activity, then close its room.
    pub async fn delete_board(&self, actor: Uuid, board_id: Uuid) -> Result<(), BoardError> {
        let guard = self.lock_board(board_id).await?;
        self.owned_board(actor, board_id, "delete it")?;

        let filter = Filter::board(board_id);
        let lists = self.store.find_many::<TaskList>(&filter)?;
        let mut steps = StepRunner::new(board_id);
        let mut tasks = 0;
        for list in &lists {
            tasks += steps.step(self.store.delete_many::<Task>(&Filter::list(list.id)))?;
        }
        steps.step(self.store.delete_many::<TaskList>(&filter))?;
        steps.step(self.store.delete_many::<Activity>(&filter))?;
        steps.step(self.store.delete_one::<Board>(board_id))?;
        log::info!(
            "Board {board_id} deleted by {actor} ({} lists, {tasks} tasks)",
            lists.len()
        );

        self.publish(BoardEvent::BoardDeleted { board_id }).await;
        self.broadcaster.close_room(board_id).await;
        drop(guard);
        self.locks.lock().await.remove(&board_id);
        Ok(())
    }

    // ─── Membership ───────────────────────────────────────────────────

    pub async fn add_member(
        &self,
        actor: Uuid,
        board_id: Uuid,
        email: &str,
    ) -> Result<BoardView, BoardError> {
        let email = clean_email(email)?;
        let _guard = self.lock_board(board_id).await?;
        let mut board = self.member_board(actor, board_id)?;
        let user = self
            .store
            .find_one::<User>(&Filter::email(email.clone()))?
            .ok_or_else(|| BoardError::Validation(format!("No user registered with email {email}")))?;
        if board.is_member(user.id) {
            return Err(BoardError::Validation(
                "User is already a member of this board".into(),
            ));
        }

        board.members.push(user.id);
        board.updated_at = now_secs();
        self.store.save(&board)?;

        self.audit(
            Activity::new(board_id, actor, ActivityAction::MemberAdded).detail("member", &user.name),
        );
        let view = self.board_view(&board)?;
        self.publish(BoardEvent::MemberAdded {
            board: view.clone(),
            member: user.summary(),
        })
        .await;
        Ok(view)
    }

    /// Remove a member. The removed user's connections are dropped from the
    /// room after they receive `member:removed`.
    pub async fn remove_member(
        &self,
        actor: Uuid,
        board_id: Uuid,
        user_id: Uuid,
    ) -> Result<BoardView, BoardError> {
        let _guard = self.lock_board(board_id).await?;
        let mut board = self.owned_board(actor, board_id, "remove members")?;
        if board.is_owner(user_id) {
            return Err(BoardError::Validation("Cannot remove the board owner".into()));
        }
        if !board.is_member(user_id) {
            return Err(BoardError::Validation(
                "User is not a member of this board".into(),
            ));
        }

        board.members.retain(|member| *member != user_id);
        board.updated_at = now_secs();
        self.store.save(&board)?;

        let name = self
            .store
            .find_by_id::<User>(user_id)?
            .map(|u| u.name)
            .unwrap_or_default();
        self.audit(Activity::new(board_id, actor, ActivityAction::MemberRemoved).detail("member", name));
        let view = self.board_view(&board)?;
        self.publish(BoardEvent::MemberRemoved {
            board: view.clone(),
            removed_user_id: user_id,
        })
        .await;
        self.broadcaster.evict(board_id, user_id).await;
        Ok(view)
    }

    // ─── Lists ────────────────────────────────────────────────────────

    /// Append a list to the end of the board.
    pub async fn create_list(
        &self,
        actor: Uuid,
        board_id: Uuid,
        title: &str,
    ) -> Result<TaskList, BoardError> {
        let title = clean_title("List title", title, MAX_LIST_TITLE)?;
        let _guard = self.lock_board(board_id).await?;
        self.member_board(actor, board_id)?;

        let last = self.store.find_last::<TaskList>(&Filter::board(board_id))?;
        let list = TaskList::new(
            board_id,
            title,
            ledger::next_position(last.map(|l| l.position)),
        );
        self.store.create(&list)?;

        self.audit(Activity::new(board_id, actor, ActivityAction::ListCreated).detail("list", &list.title));
        self.publish(BoardEvent::ListCreated { list: list.clone() }).await;
        Ok(list)
    }

    pub async fn rename_list(
        &self,
        actor: Uuid,
        list_id: Uuid,
        title: &str,
    ) -> Result<TaskList, BoardError> {
        let title = clean_title("List title", title, MAX_LIST_TITLE)?;
        let (_guard, mut list) = self.lock_list(actor, list_id).await?;
        list.title = title;
        list.updated_at = now_secs();
        self.store.save(&list)?;

        self.audit(
            Activity::new(list.board_id, actor, ActivityAction::ListUpdated).detail("list", &list.title),
        );
        self.publish(BoardEvent::ListUpdated { list: list.clone() }).await;
        Ok(list)
    }

    /// Move a list to a zero-based index among the board's lists.
    pub async fn move_list(
        &self,
        actor: Uuid,
        list_id: Uuid,
        position: Position,
    ) -> Result<TaskList, BoardError> {
        let (_guard, list) = self.lock_list(actor, list_id).await?;
        let siblings = self.store.find_many::<TaskList>(&Filter::board(list.board_id))?;
        let container = ContainerView::from_items(list.board_id, &siblings);
        let plan = plan_move(&container, None, list_id, index_from(position)).map_err(plan_error)?;

        let now = now_secs();
        self.execute_plan::<TaskList>(&plan, Filter::board, |_, position| {
            let mut moved = list.clone();
            moved.position = position;
            moved.updated_at = now;
            self.store.save(&moved)
        })?;
        let moved = self.find_list(list_id)?;

        if !plan.is_noop() {
            self.audit(
                Activity::new(moved.board_id, actor, ActivityAction::ListMoved)
                    .detail("list", &moved.title)
                    .detail("position", plan.index.to_string()),
            );
        }
        self.publish(BoardEvent::ListMoved {
            list: moved.clone(),
            board_id: moved.board_id,
            position: plan.index as Position,
        })
        .await;
        Ok(moved)
    }

    /// Delete a list together with its tasks.
    pub async fn delete_list(&self, actor: Uuid, list_id: Uuid) -> Result<(), BoardError> {
        let (_guard, list) = self.lock_list(actor, list_id).await?;

        let mut steps = StepRunner::new(list_id);
        let removed = steps.step(self.store.delete_many::<Task>(&Filter::list(list_id)))?;
        steps.step(self.store.delete_one::<TaskList>(list_id))?;

        self.audit(
            Activity::new(list.board_id, actor, ActivityAction::ListDeleted)
                .detail("list", &list.title)
                .detail("tasks", removed.to_string()),
        );
        self.publish(BoardEvent::ListDeleted {
            board_id: list.board_id,
            list_id,
        })
        .await;
        Ok(())
    }

    // ─── Tasks ────────────────────────────────────────────────────────

    /// Append a task to the end of a list.
    pub async fn create_task(
        &self,
        actor: Uuid,
        list_id: Uuid,
        new: &NewTask,
    ) -> Result<TaskView, BoardError> {
        let title = clean_title("Task title", &new.title, MAX_TASK_TITLE)?;
        let description = clean_text(
            "Task description",
            new.description.as_deref().unwrap_or_default(),
            MAX_TASK_DESCRIPTION,
        )?;
        let (_guard, list) = self.lock_list(actor, list_id).await?;

        let last = self.store.find_last::<Task>(&Filter::list(list_id))?;
        let mut task = Task::new(
            list.board_id,
            list_id,
            title,
            ledger::next_position(last.map(|t| t.position)),
        );
        task.description = description;
        task.priority = new.priority.unwrap_or_default();
        task.due_date = new.due_date;
        self.store.create(&task)?;

        self.audit(
            Activity::new(task.board_id, actor, ActivityAction::TaskCreated)
                .with_task(task.id)
                .detail("task", &task.title)
                .detail("list", &list.title),
        );
        let view = self.task_view(&task)?;
        self.publish(BoardEvent::TaskCreated { task: view.clone() }).await;
        Ok(view)
    }

    pub async fn update_task(
        &self,
        actor: Uuid,
        task_id: Uuid,
        patch: &TaskPatch,
    ) -> Result<TaskView, BoardError> {
        if patch.is_empty() {
            return Err(BoardError::Validation("Nothing to update".into()));
        }
        let title = patch
            .title
            .as_deref()
            .map(|t| clean_title("Task title", t, MAX_TASK_TITLE))
            .transpose()?;
        let description = patch
            .description
            .as_deref()
            .map(|d| clean_text("Task description", d, MAX_TASK_DESCRIPTION))
            .transpose()?;

        let (_guard, _, mut task) = self.lock_task(actor, task_id).await?;
        let mut fields = Vec::new();
        if let Some(title) = title {
            task.title = title;
            fields.push("title");
        }
        if let Some(description) = description {
            task.description = description;
            fields.push("description");
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
            fields.push("priority");
        }
        if let Some(due_date) = patch.due_date {
            task.due_date = due_date;
            fields.push("due_date");
        }
        task.updated_at = now_secs();
        self.store.save(&task)?;

        self.audit(
            Activity::new(task.board_id, actor, ActivityAction::TaskUpdated)
                .with_task(task_id)
                .detail("task", &task.title)
                .detail("fields", fields.join(",")),
        );
        let view = self.task_view(&task)?;
        self.publish(BoardEvent::TaskUpdated { task: view.clone() }).await;
        Ok(view)
    }

    pub async fn delete_task(&self, actor: Uuid, task_id: Uuid) -> Result<(), BoardError> {
        let (_guard, _, task) = self.lock_task(actor, task_id).await?;
        self.store.delete_one::<Task>(task_id)?;

        self.audit(
            Activity::new(task.board_id, actor, ActivityAction::TaskDeleted)
                .with_task(task_id)
                .detail("task", &task.title),
        );
        self.publish(BoardEvent::TaskDeleted {
            board_id: task.board_id,
            task_id,
            list_id: task.list_id,
        })
        .await;
        Ok(())
    }

    /// Move a task to a zero-based index of a list on the same board.
    ///
    /// Moving a task to its current index changes nothing in the store and
    /// writes no audit entry, but the canonical event is still emitted.
    pub async fn move_task(
        &self,
        actor: Uuid,
        task_id: Uuid,
        request: MoveTaskRequest,
    ) -> Result<MovedTask, BoardError> {
        let (_guard, _, task) = self.lock_task(actor, task_id).await?;
        let source_list = self.find_list(task.list_id)?;
        let dest_list = match request.list_id {
            Some(list_id) if list_id != task.list_id => {
                let list = self.find_list(list_id)?;
                if list.board_id != task.board_id {
                    return Err(BoardError::Validation(
                        "Destination list belongs to another board".into(),
                    ));
                }
                list
            }
            _ => source_list.clone(),
        };

        let source_tasks = self.store.find_many::<Task>(&Filter::list(source_list.id))?;
        let source = ContainerView::from_items(source_list.id, &source_tasks);
        let destination = if dest_list.id == source_list.id {
            None
        } else {
            let dest_tasks = self.store.find_many::<Task>(&Filter::list(dest_list.id))?;
            Some(ContainerView::from_items(dest_list.id, &dest_tasks))
        };
        let plan = plan_move(&source, destination.as_ref(), task_id, index_from(request.position))
            .map_err(plan_error)?;

        let now = now_secs();
        self.execute_plan::<Task>(&plan, Filter::list, |list_id, position| {
            let mut moved = task.clone();
            moved.list_id = list_id;
            moved.position = position;
            moved.updated_at = now;
            self.store.save(&moved)
        })?;
        let moved = self.find_task(task_id)?;

        if plan.is_noop() {
            log::debug!("Move of task {task_id} is a no-op");
        } else {
            self.audit(
                Activity::new(moved.board_id, actor, ActivityAction::TaskMoved)
                    .with_task(task_id)
                    .detail("task", &moved.title)
                    .detail("from", &source_list.title)
                    .detail("to", &dest_list.title),
            );
        }

        let outcome = MovedTask {
            task: self.task_view(&moved)?,
            source_list_id: source_list.id,
            dest_list_id: dest_list.id,
            position: plan.index as Position,
        };
        self.publish(BoardEvent::TaskMoved {
            task: outcome.task.clone(),
            source_list_id: outcome.source_list_id,
            dest_list_id: outcome.dest_list_id,
            position: outcome.position,
        })
        .await;
        Ok(outcome)
    }

    pub async fn assign_task(
        &self,
        actor: Uuid,
        task_id: Uuid,
        user_id: Uuid,
    ) -> Result<TaskView, BoardError> {
        let (_guard, board, mut task) = self.lock_task(actor, task_id).await?;
        let user = self.find_user(user_id)?;
        if !board.is_member(user_id) {
            return Err(BoardError::Validation(
                "Assignee must be a member of the board".into(),
            ));
        }
        if task.assignees.contains(&user_id) {
            return Err(BoardError::Validation(
                "User is already assigned to this task".into(),
            ));
        }

        task.assignees.push(user_id);
        task.updated_at = now_secs();
        self.store.save(&task)?;

        self.audit(
            Activity::new(task.board_id, actor, ActivityAction::TaskAssigned)
                .with_task(task_id)
                .detail("task", &task.title)
                .detail("assignee", &user.name),
        );
        let view = self.task_view(&task)?;
        self.publish(BoardEvent::TaskUpdated { task: view.clone() }).await;
        Ok(view)
    }

    pub async fn unassign_task(
        &self,
        actor: Uuid,
        task_id: Uuid,
        user_id: Uuid,
    ) -> Result<TaskView, BoardError> {
        let (_guard, _, mut task) = self.lock_task(actor, task_id).await?;
        if !task.assignees.contains(&user_id) {
            return Err(BoardError::Validation(
                "User is not assigned to this task".into(),
            ));
        }

        task.assignees.retain(|id| *id != user_id);
        task.updated_at = now_secs();
        self.store.save(&task)?;

        let name = self
            .store
            .find_by_id::<User>(user_id)?
            .map(|u| u.name)
            .unwrap_or_default();
        self.audit(
            Activity::new(task.board_id, actor, ActivityAction::TaskUnassigned)
                .with_task(task_id)
                .detail("task", &task.title)
                .detail("assignee", name),
        );
        let view = self.task_view(&task)?;
        self.publish(BoardEvent::TaskUpdated { task: view.clone() }).await;
        Ok(view)
    }

    // ─── Activity ─────────────────────────────────────────────────────

    /// Newest entries first, at most `limit` (clamped to 1..=100).
    pub async fn recent_activity(
        &self,
        actor: Uuid,
        board_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Activity>, BoardError> {
        self.member_board(actor, board_id)?;
        let mut entries = self.store.find_many::<Activity>(&Filter::board(board_id))?;
        entries.reverse();
        entries.truncate(limit.clamp(1, MAX_ACTIVITY_LIMIT));
        Ok(entries)
    }
}
