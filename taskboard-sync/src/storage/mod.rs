//! Durable record storage for boards and everything on them.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  typed ops   ┌──────────────┐  raw bytes  ┌─────────────┐
//! │ MutationApplier  │ ───────────► │ RecordStore  │ ──────────► │ MemoryStore │
//! └──────────────────┘              │ (provided    │             ├─────────────┤
//!                                   │  methods)    │             │ RocksStore  │
//!                                   └──────────────┘             └─────────────┘
//!                                                                 one column family
//!                                                                 per collection
//! ```
//!
//! Backends store bincode-encoded records keyed by id, plus a scope index
//! of `(scope, id)` pairs: tasks under their list, lists and activity under
//! their board, users under their email. A query that names a record's
//! scope reads only that scope's entries; anything else scans the whole
//! collection. Backends apply a batch (records and index entries together)
//! atomically. Filtering, ordering and position shifts are written once on
//! top of that, in [`RecordStore`]'s provided methods. Every operation is
//! atomic on its own; nothing composes them into a transaction.

pub mod memory;
pub mod rocks;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use taskboard_core::ledger::Position;
use taskboard_core::model::{Activity, Board, Task, TaskList, User};
use taskboard_core::planner::PositionRange;
use taskboard_core::BoardError;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Record collections. Each maps to one RocksDB column family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Boards,
    Lists,
    Tasks,
    Users,
    Activities,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Boards,
        Collection::Lists,
        Collection::Tasks,
        Collection::Users,
        Collection::Activities,
    ];

    /// One-byte prefix for this collection's scope index keys.
    pub fn tag(self) -> u8 {
        match self {
            Collection::Boards => 1,
            Collection::Lists => 2,
            Collection::Tasks => 3,
            Collection::Users => 4,
            Collection::Activities => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Collection::Boards => "boards",
            Collection::Lists => "lists",
            Collection::Tasks => "tasks",
            Collection::Users => "users",
            Collection::Activities => "activities",
        }
    }
}

/// The filter field a collection is indexed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Board,
    List,
    Email,
}

/// Index key for an email address. Emails are stored lowercased, so equal
/// addresses always land on the same key.
pub fn email_scope(email: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("mailto:{email}").as_bytes())
}

/// A persisted record type.
///
/// The filter accessors default to "not applicable"; a record only answers
/// the ones that make sense for it.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync {
    const COLLECTION: Collection;

    /// Field the collection is indexed by, if any.
    const SCOPE: Option<Scope> = None;

    fn key(&self) -> Uuid;

    fn created(&self) -> u64;

    fn board(&self) -> Option<Uuid> {
        None
    }

    fn list(&self) -> Option<Uuid> {
        None
    }

    fn email_address(&self) -> Option<&str> {
        None
    }

    fn includes_member(&self, _user_id: Uuid) -> bool {
        false
    }

    /// Ledger position, for records ordered within a container.
    fn rank(&self) -> Option<Position> {
        None
    }

    fn place(&mut self, _position: Position) {}

    /// Index key of this record under [`Record::SCOPE`].
    fn scope_key(&self) -> Option<Uuid> {
        match Self::SCOPE? {
            Scope::Board => self.board(),
            Scope::List => self.list(),
            Scope::Email => self.email_address().map(email_scope),
        }
    }
}

impl Record for Board {
    const COLLECTION: Collection = Collection::Boards;

    fn key(&self) -> Uuid {
        self.id
    }

    fn created(&self) -> u64 {
        self.created_at
    }

    fn board(&self) -> Option<Uuid> {
        Some(self.id)
    }

    fn includes_member(&self, user_id: Uuid) -> bool {
        self.is_member(user_id)
    }
}

impl Record for TaskList {
    const COLLECTION: Collection = Collection::Lists;
    const SCOPE: Option<Scope> = Some(Scope::Board);

    fn key(&self) -> Uuid {
        self.id
    }

    fn created(&self) -> u64 {
        self.created_at
    }

    fn board(&self) -> Option<Uuid> {
        Some(self.board_id)
    }

    fn rank(&self) -> Option<Position> {
        Some(self.position)
    }

    fn place(&mut self, position: Position) {
        self.position = position;
    }
}

impl Record for Task {
    const COLLECTION: Collection = Collection::Tasks;
    const SCOPE: Option<Scope> = Some(Scope::List);

    fn key(&self) -> Uuid {
        self.id
    }

    fn created(&self) -> u64 {
        self.created_at
    }

    fn board(&self) -> Option<Uuid> {
        Some(self.board_id)
    }

    fn list(&self) -> Option<Uuid> {
        Some(self.list_id)
    }

    fn rank(&self) -> Option<Position> {
        Some(self.position)
    }

    fn place(&mut self, position: Position) {
        self.position = position;
    }
}

impl Record for User {
    const COLLECTION: Collection = Collection::Users;
    const SCOPE: Option<Scope> = Some(Scope::Email);

    fn key(&self) -> Uuid {
        self.id
    }

    fn created(&self) -> u64 {
        self.created_at
    }

    fn email_address(&self) -> Option<&str> {
        Some(&self.email)
    }
}

impl Record for Activity {
    const COLLECTION: Collection = Collection::Activities;
    const SCOPE: Option<Scope> = Some(Scope::Board);

    fn key(&self) -> Uuid {
        self.id
    }

    fn created(&self) -> u64 {
        self.created_at
    }

    fn board(&self) -> Option<Uuid> {
        Some(self.board_id)
    }
}

/// Conjunction of optional field predicates. The empty filter matches
/// everything in a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub board_id: Option<Uuid>,
    pub list_id: Option<Uuid>,
    pub email: Option<String>,
    pub member: Option<Uuid>,
    pub positions: Option<PositionRange>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn board(board_id: Uuid) -> Self {
        Self {
            board_id: Some(board_id),
            ..Self::default()
        }
    }

    pub fn list(list_id: Uuid) -> Self {
        Self {
            list_id: Some(list_id),
            ..Self::default()
        }
    }

    pub fn email(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            ..Self::default()
        }
    }

    pub fn member(user_id: Uuid) -> Self {
        Self {
            member: Some(user_id),
            ..Self::default()
        }
    }

    pub fn positions(mut self, range: PositionRange) -> Self {
        self.positions = Some(range);
        self
    }

    /// The index key this filter pins for `scope`, if it pins one.
    pub fn scope_key(&self, scope: Scope) -> Option<Uuid> {
        match scope {
            Scope::Board => self.board_id,
            Scope::List => self.list_id,
            Scope::Email => self.email.as_deref().map(email_scope),
        }
    }

    pub fn matches<R: Record>(&self, record: &R) -> bool {
        if self.board_id.is_some() && record.board() != self.board_id {
            return false;
        }
        if self.list_id.is_some() && record.list() != self.list_id {
            return false;
        }
        if let Some(email) = &self.email {
            if record.email_address() != Some(email.as_str()) {
                return false;
            }
        }
        if let Some(user_id) = self.member {
            if !record.includes_member(user_id) {
                return false;
            }
        }
        if let Some(range) = &self.positions {
            match record.rank() {
                Some(position) if range.contains(position) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("{collection} record already exists: {id}")]
    Duplicate { collection: &'static str, id: Uuid },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for BoardError {
    fn from(e: StoreError) -> Self {
        BoardError::Store(e.to_string())
    }
}

/// Record puts and deletes against one collection, with the scope index
/// entries they move, applied all-or-nothing. Unlinks apply before links.
#[derive(Debug, Default, Clone)]
pub struct RawBatch {
    pub puts: Vec<(Uuid, Vec<u8>)>,
    pub deletes: Vec<Uuid>,
    /// `(scope, id)` index entries to add
    pub links: Vec<(Uuid, Uuid)>,
    /// `(scope, id)` index entries to remove
    pub unlinks: Vec<(Uuid, Uuid)>,
}

impl RawBatch {
    pub fn put(&mut self, id: Uuid, bytes: Vec<u8>) {
        self.puts.push((id, bytes));
    }

    pub fn delete(&mut self, id: Uuid) {
        self.deletes.push(id);
    }

    pub fn link(&mut self, scope: Uuid, id: Uuid) {
        self.links.push((scope, id));
    }

    pub fn unlink(&mut self, scope: Uuid, id: Uuid) {
        self.unlinks.push((scope, id));
    }

    /// Number of records written or removed.
    pub fn len(&self) -> usize {
        self.puts.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty()
            && self.deletes.is_empty()
            && self.links.is_empty()
            && self.unlinks.is_empty()
    }
}

pub fn encode_record<R: Record>(record: &R) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub fn decode_record<R: Record>(bytes: &[u8]) -> Result<R, StoreError> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(record)
}

/// Read order for a query result: ledger position then id for positioned
/// records, creation time then id for the rest.
fn sort_records<R: Record>(records: &mut [R]) {
    records.sort_by(|a, b| match (a.rank(), b.rank()) {
        (Some(pa), Some(pb)) => pa.cmp(&pb).then_with(|| a.key().cmp(&b.key())),
        _ => a
            .created()
            .cmp(&b.created())
            .then_with(|| a.key().cmp(&b.key())),
    });
}

/// A durable record store.
///
/// Implementors supply the four raw operations; the typed operations are
/// provided on top of them.
pub trait RecordStore: Send + Sync {
    fn get_raw(&self, collection: Collection, id: Uuid) -> Result<Option<Vec<u8>>, StoreError>;

    /// Every record in the collection.
    fn scan_raw(&self, collection: Collection) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Records linked under `scope` in the collection's index.
    fn scan_scope_raw(
        &self,
        collection: Collection,
        scope: Uuid,
    ) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Apply `batch` atomically.
    fn write_raw(&self, collection: Collection, batch: RawBatch) -> Result<(), StoreError>;

    /// Insert a new record. Fails if the id is taken.
    fn create<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        if self.get_raw(R::COLLECTION, record.key())?.is_some() {
            return Err(StoreError::Duplicate {
                collection: R::COLLECTION.name(),
                id: record.key(),
            });
        }
        self.save(record)
    }

    fn find_by_id<R: Record>(&self, id: Uuid) -> Result<Option<R>, StoreError> {
        self.get_raw(R::COLLECTION, id)?
            .map(|bytes| decode_record(&bytes))
            .transpose()
    }

    /// All matching records in read order. Reads one scope when the filter
    /// pins the collection's index field.
    fn find_many<R: Record>(&self, filter: &Filter) -> Result<Vec<R>, StoreError> {
        let candidates = match R::SCOPE.and_then(|scope| filter.scope_key(scope)) {
            Some(key) => self.scan_scope_raw(R::COLLECTION, key)?,
            None => self.scan_raw(R::COLLECTION)?,
        };
        let mut records = Vec::new();
        for bytes in candidates {
            let record: R = decode_record(&bytes)?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        sort_records(&mut records);
        Ok(records)
    }

    fn find_one<R: Record>(&self, filter: &Filter) -> Result<Option<R>, StoreError> {
        Ok(self.find_many(filter)?.into_iter().next())
    }

    /// The matching record that sorts last, e.g. the highest position.
    fn find_last<R: Record>(&self, filter: &Filter) -> Result<Option<R>, StoreError> {
        Ok(self.find_many(filter)?.pop())
    }

    /// Add `amount` to the position of every matching record. Returns the
    /// number of records changed.
    fn update_many<R: Record>(&self, filter: &Filter, amount: i64) -> Result<usize, StoreError> {
        let mut batch = RawBatch::default();
        for mut record in self.find_many::<R>(filter)? {
            if let Some(position) = record.rank() {
                record.place(position + amount);
                batch.put(record.key(), encode_record(&record)?);
            }
        }
        let changed = batch.len();
        if changed > 0 {
            self.write_raw(R::COLLECTION, batch)?;
        }
        Ok(changed)
    }

    /// Set explicit positions. Ids that no longer exist are skipped.
    fn assign_positions<R: Record>(
        &self,
        assignments: &[(Uuid, Position)],
    ) -> Result<usize, StoreError> {
        let mut batch = RawBatch::default();
        for (id, position) in assignments {
            if let Some(mut record) = self.find_by_id::<R>(*id)? {
                record.place(*position);
                batch.put(*id, encode_record(&record)?);
            }
        }
        let changed = batch.len();
        if changed > 0 {
            self.write_raw(R::COLLECTION, batch)?;
        }
        Ok(changed)
    }

    /// Insert or overwrite. A record that changed scope, such as a task
    /// moved to another list, is relinked in the same batch.
    fn save<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let mut batch = RawBatch::default();
        let scope = record.scope_key();
        if R::SCOPE.is_some() {
            let previous = self
                .find_by_id::<R>(record.key())?
                .and_then(|previous| previous.scope_key());
            if let Some(previous) = previous.filter(|previous| Some(*previous) != scope) {
                batch.unlink(previous, record.key());
            }
        }
        if let Some(scope) = scope {
            batch.link(scope, record.key());
        }
        batch.put(record.key(), encode_record(record)?);
        self.write_raw(R::COLLECTION, batch)
    }

    /// Returns whether a record was removed.
    fn delete_one<R: Record>(&self, id: Uuid) -> Result<bool, StoreError> {
        let Some(record) = self.find_by_id::<R>(id)? else {
            return Ok(false);
        };
        let mut batch = RawBatch::default();
        batch.delete(id);
        if let Some(scope) = record.scope_key() {
            batch.unlink(scope, id);
        }
        self.write_raw(R::COLLECTION, batch)?;
        Ok(true)
    }

    fn delete_many<R: Record>(&self, filter: &Filter) -> Result<usize, StoreError> {
        let mut batch = RawBatch::default();
        for record in self.find_many::<R>(filter)? {
            batch.delete(record.key());
            if let Some(scope) = record.scope_key() {
                batch.unlink(scope, record.key());
            }
        }
        let removed = batch.len();
        if removed > 0 {
            self.write_raw(R::COLLECTION, batch)?;
        }
        Ok(removed)
    }
}

/// Store selected at startup: RocksDB when a data directory is configured,
/// memory otherwise.
pub enum AnyStore {
    Memory(MemoryStore),
    Rocks(RocksStore),
}

impl AnyStore {
    pub fn is_persistent(&self) -> bool {
        matches!(self, AnyStore::Rocks(_))
    }
}

impl RecordStore for AnyStore {
    fn get_raw(&self, collection: Collection, id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            AnyStore::Memory(s) => s.get_raw(collection, id),
            AnyStore::Rocks(s) => s.get_raw(collection, id),
        }
    }

    fn scan_raw(&self, collection: Collection) -> Result<Vec<Vec<u8>>, StoreError> {
        match self {
            AnyStore::Memory(s) => s.scan_raw(collection),
            AnyStore::Rocks(s) => s.scan_raw(collection),
        }
    }

    fn scan_scope_raw(
        &self,
        collection: Collection,
        scope: Uuid,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        match self {
            AnyStore::Memory(s) => s.scan_scope_raw(collection, scope),
            AnyStore::Rocks(s) => s.scan_scope_raw(collection, scope),
        }
    }

    fn write_raw(&self, collection: Collection, batch: RawBatch) -> Result<(), StoreError> {
        match self {
            AnyStore::Memory(s) => s.write_raw(collection, batch),
            AnyStore::Rocks(s) => s.write_raw(collection, batch),
        }
    }
}
