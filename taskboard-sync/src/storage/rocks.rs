//! RocksDB-backed persistent record store.
//!
//! Column families, one per [`Collection`], plus the scope index:
//! - `boards`     — board records (point lookups, member scans)
//! - `lists`      — lists, read per board through the index
//! - `tasks`      — tasks, read per list through the index; most writes land here
//! - `users`      — user records, read by id or through the email index
//! - `activities` — append-only audit entries, read per board through the index
//! - `scopes`     — index keys `tag ‖ scope ‖ id` with empty values
//!
//! Record keys are the 16 raw bytes of the record id; values are
//! bincode-encoded records. A scope query is a prefix scan over
//! `tag ‖ scope` in `scopes` followed by one multi-get of the ids it finds.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, SliceTransform, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{Collection, RawBatch, RecordStore, StoreError};

const SCOPES_CF: &str = "scopes";

/// Collection tag plus scope id.
const SCOPE_PREFIX_LEN: usize = 17;

fn scope_prefix(collection: Collection, scope: Uuid) -> [u8; SCOPE_PREFIX_LEN] {
    let mut prefix = [0u8; SCOPE_PREFIX_LEN];
    prefix[0] = collection.tag();
    prefix[1..].copy_from_slice(scope.as_bytes());
    prefix
}

fn scope_key(collection: Collection, scope: Uuid, id: Uuid) -> [u8; SCOPE_PREFIX_LEN + 16] {
    let mut key = [0u8; SCOPE_PREFIX_LEN + 16];
    key[..SCOPE_PREFIX_LEN].copy_from_slice(&scope_prefix(collection, scope));
    key[SCOPE_PREFIX_LEN..].copy_from_slice(id.as_bytes());
    key
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("taskboard_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config at `path` with the remaining settings at their defaults.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB-backed record store.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode; callers share it through `Arc`)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let mut cf_descriptors: Vec<ColumnFamilyDescriptor> = Collection::ALL
            .iter()
            .map(|collection| {
                ColumnFamilyDescriptor::new(
                    collection.name(),
                    Self::cf_options(*collection, &config, &cache),
                )
            })
            .collect();
        cf_descriptors.push(ColumnFamilyDescriptor::new(
            SCOPES_CF,
            Self::scopes_options(&config, &cache),
        ));

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened record store at {}", config.path.display());

        Ok(Self { db, config })
    }

    /// Record families are read by id only (gets and multi-gets from the
    /// index), so whole-key bloom filters skip the blocks a miss would load.
    fn cf_options(collection: Collection, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_cache_index_and_filter_blocks(true);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match collection {
            Collection::Boards | Collection::Users | Collection::Lists => {
                opts.set_max_write_buffer_number(2);
            }
            Collection::Tasks | Collection::Activities => {
                // Many small writes: every move shifts a range of tasks and
                // every mutation appends an activity.
                opts.set_max_write_buffer_number(4);
            }
        }

        opts
    }

    /// The index is only ever read by `tag ‖ scope` prefix, so filters are
    /// built over that prefix instead of whole keys.
    fn scopes_options(config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();
        opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(SCOPE_PREFIX_LEN));
        opts.set_memtable_prefix_bloom_ratio(0.1);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_whole_key_filtering(false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(4);
        opts
    }

    /// Number of records in a collection.
    pub fn count(&self, collection: Collection) -> Result<usize, StoreError> {
        let cf = self.cf(collection)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Number of scope index entries for a collection.
    pub fn index_count(&self, collection: Collection) -> Result<usize, StoreError> {
        let cf = self.named_cf(SCOPES_CF)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if key.first() == Some(&collection.tag()) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn cf(&self, collection: Collection) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.named_cf(collection.name())
    }

    fn named_cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl RecordStore for RocksStore {
    fn get_raw(&self, collection: Collection, id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(collection)?;
        Ok(self.db.get_cf(cf, id.as_bytes())?)
    }

    fn scan_raw(&self, collection: Collection) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(collection)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            values.push(value.to_vec());
        }
        Ok(values)
    }

    fn scan_scope_raw(
        &self,
        collection: Collection,
        scope: Uuid,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let scopes = self.named_cf(SCOPES_CF)?;
        let prefix = scope_prefix(collection, scope);
        let mut ids = Vec::new();
        for item in self.db.prefix_iterator_cf(scopes, prefix) {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            ids.push(key[SCOPE_PREFIX_LEN..].to_vec());
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let cf = self.cf(collection)?;
        let mut values = Vec::with_capacity(ids.len());
        for value in self
            .db
            .multi_get_cf(ids.iter().map(|id| (cf, id.as_slice())))
        {
            if let Some(value) = value? {
                values.push(value);
            }
        }
        Ok(values)
    }

    fn write_raw(&self, collection: Collection, batch: RawBatch) -> Result<(), StoreError> {
        let cf = self.cf(collection)?;
        let scopes = self.named_cf(SCOPES_CF)?;
        let mut write_batch = WriteBatch::default();
        for (id, bytes) in &batch.puts {
            write_batch.put_cf(cf, id.as_bytes(), bytes);
        }
        for id in &batch.deletes {
            write_batch.delete_cf(cf, id.as_bytes());
        }
        for (scope, id) in &batch.unlinks {
            write_batch.delete_cf(scopes, scope_key(collection, *scope, *id));
        }
        for (scope, id) in &batch.links {
            write_batch.put_cf(scopes, scope_key(collection, *scope, *id), b"");
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(write_batch, &write_opts)?;
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
