//! In-memory record store for tests and servers without a data directory.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use uuid::Uuid;

use super::{Collection, RawBatch, RecordStore, StoreError};

#[derive(Default)]
struct Tables {
    records: HashMap<Collection, BTreeMap<Uuid, Vec<u8>>>,
    /// `(scope, id)` pairs per collection, ordered so one scope is a range
    index: HashMap<Collection, BTreeSet<(Uuid, Uuid)>>,
}

/// Records are kept encoded, exactly as RocksDB would hold them.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.tables
            .read()
            .map(|t| t.records.get(&collection).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    /// Number of scope index entries held for a collection.
    pub fn index_len(&self, collection: Collection) -> usize {
        self.tables
            .read()
            .map(|t| t.index.get(&collection).map_or(0, BTreeSet::len))
            .unwrap_or(0)
    }
}

fn poisoned() -> StoreError {
    StoreError::Database("memory store lock poisoned".into())
}

impl RecordStore for MemoryStore {
    fn get_raw(&self, collection: Collection, id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.records.get(&collection).and_then(|t| t.get(&id)).cloned())
    }

    fn scan_raw(&self, collection: Collection) -> Result<Vec<Vec<u8>>, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables
            .records
            .get(&collection)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    fn scan_scope_raw(
        &self,
        collection: Collection,
        scope: Uuid,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        let (Some(index), Some(records)) =
            (tables.index.get(&collection), tables.records.get(&collection))
        else {
            return Ok(Vec::new());
        };
        Ok(index
            .range((scope, Uuid::nil())..=(scope, Uuid::max()))
            .filter_map(|(_, id)| records.get(id).cloned())
            .collect())
    }

    fn write_raw(&self, collection: Collection, batch: RawBatch) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let table = tables.records.entry(collection).or_default();
        for (id, bytes) in batch.puts {
            table.insert(id, bytes);
        }
        for id in batch.deletes {
            table.remove(&id);
        }
        let index = tables.index.entry(collection).or_default();
        for entry in batch.unlinks {
            index.remove(&entry);
        }
        index.extend(batch.links);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskboard_core::model::{Task, User};

    #[test]
    fn test_batch_applies_puts_and_deletes() {
        let store = MemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let mut batch = RawBatch::default();
        batch.put(a, vec![1]);
        batch.put(b, vec![2]);
        store.write_raw(Collection::Users, batch).unwrap();
        assert_eq!(store.len(Collection::Users), 2);

        let mut batch = RawBatch::default();
        batch.delete(a);
        store.write_raw(Collection::Users, batch).unwrap();
        assert_eq!(store.get_raw(Collection::Users, a).unwrap(), None);
        assert_eq!(store.get_raw(Collection::Users, b).unwrap(), Some(vec![2]));
    }

    #[test]
    fn test_collections_are_isolated() {
        let store = MemoryStore::new();
        let user = User::new("Ada", "ada@example.com");
        store.save(&user).unwrap();
        assert_eq!(store.len(Collection::Users), 1);
        assert_eq!(store.len(Collection::Boards), 0);
        assert!(store.get_raw(Collection::Boards, user.id).unwrap().is_none());
    }

    #[test]
    fn test_scope_scan_reads_one_container() {
        let store = MemoryStore::new();
        let (board_id, todo, done) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for i in 0..3 {
            store.create(&Task::new(board_id, todo, format!("todo {i}"), i)).unwrap();
        }
        store.create(&Task::new(board_id, done, "done", 0)).unwrap();

        assert_eq!(store.scan_scope_raw(Collection::Tasks, todo).unwrap().len(), 3);
        assert_eq!(store.scan_scope_raw(Collection::Tasks, done).unwrap().len(), 1);
        assert!(store
            .scan_scope_raw(Collection::Tasks, Uuid::new_v4())
            .unwrap()
            .is_empty());
        assert_eq!(store.index_len(Collection::Tasks), 4);
    }

    #[test]
    fn test_moved_record_is_relinked() {
        let store = MemoryStore::new();
        let (board_id, todo, done) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut task = Task::new(board_id, todo, "moving", 0);
        store.create(&task).unwrap();

        task.list_id = done;
        store.save(&task).unwrap();
        assert!(store.scan_scope_raw(Collection::Tasks, todo).unwrap().is_empty());
        assert_eq!(store.scan_scope_raw(Collection::Tasks, done).unwrap().len(), 1);
        assert_eq!(store.index_len(Collection::Tasks), 1);

        assert!(store.delete_one::<Task>(task.id).unwrap());
        assert_eq!(store.index_len(Collection::Tasks), 0);
    }
}
