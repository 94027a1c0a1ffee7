//! Embedded storage engine.
//!
//! A database is a directory holding `meta.json`, one snapshot file per
//! object store and, while a connection is open, a `LOCK` file. Records live
//! in memory behind one mutex per object store; secondary indexes are rebuilt
//! from the snapshot on open and maintained on every commit.
//!
//! A write transaction stages its mutations, writes the resulting snapshot
//! through a temporary file and an atomic rename, and only then applies the
//! mutations in memory. A failed commit leaves both the file and the
//! in-memory state untouched.
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File, OpenOptions},
    io::{self, Write},
    ops::{Bound, RangeBounds},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::{
    read_json_file,
    schema::{self, DbMeta, IndexKey, Record},
    write_json_atomic, Config, ConnectionState, Note, Result, StoreError, Todo, TxMode, TxStep,
};

const META_FILE: &str = "meta.json";
const LOCK_FILE: &str = "LOCK";

type Index = BTreeMap<IndexKey, BTreeSet<String>>;

/// Contents of the `LOCK` file, identifying who holds the database open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMeta {
    pub pid: u32,
    pub opened_at: DateTime<Utc>,
}

/// Exclusive hold on a database directory. Released on drop.
#[derive(Debug)]
pub(crate) struct ConnectionLock {
    path: PathBuf,
    released: bool,
}

pub(crate) enum LockAttempt {
    Acquired(ConnectionLock),
    Held(Option<LockMeta>),
}

impl ConnectionLock {
    pub(crate) fn try_acquire(dir: &Path) -> Result<LockAttempt> {
        let path = dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let meta = fs::read_to_string(&path)
                    .ok()
                    .and_then(|raw| serde_json::from_str(&raw).ok());
                return Ok(LockAttempt::Held(meta));
            }
            Err(e) => {
                error!("Failed to create lock file {}: {}", path.display(), e);
                return Err(StoreError::initialization(e));
            }
        };

        let meta = LockMeta {
            pid: std::process::id(),
            opened_at: Utc::now(),
        };
        let lock = ConnectionLock {
            path,
            released: false,
        };
        write_lock_meta(&mut file, &meta).map_err(StoreError::initialization)?;
        trace!("Acquired {}", lock.path.display());
        Ok(LockAttempt::Acquired(lock))
    }

    /// Removes a lock left behind by a process that no longer exists. The
    /// file is only removed if it still names `holder`, so a lock taken over
    /// by a live opener in the meantime is left alone.
    pub(crate) fn remove_stale(dir: &Path, holder: &LockMeta) -> Result<bool> {
        let path = dir.join(LOCK_FILE);
        let current: Option<LockMeta> = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());
        if current.as_ref() != Some(holder) {
            return Ok(false);
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                error!("Failed to remove stale lock {}: {}", path.display(), e);
                Err(StoreError::initialization(e))
            }
        }
    }
}

/// Whether `pid` names a running process, probed with `kill(pid, 0)`.
#[cfg(unix)]
fn holder_is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn holder_is_alive(_pid: u32) -> bool {
    true
}

fn write_lock_meta(file: &mut File, meta: &LockMeta) -> io::Result<()> {
    let json = serde_json::to_vec(meta).map_err(io::Error::other)?;
    file.write_all(&json)?;
    file.sync_all()
}

impl Drop for ConnectionLock {
    fn drop(&mut self) {
        if !self.released {
            match fs::remove_file(&self.path) {
                Ok(()) => trace!("Released {}", self.path.display()),
                Err(e) => warn!("Failed to release {}: {}", self.path.display(), e),
            }
            self.released = true;
        }
    }
}

pub(crate) enum Mutation<R> {
    Put(R),
    Delete(String),
}

/// One collection of records plus its secondary indexes.
pub(crate) struct ObjectStore<R: Record> {
    path: PathBuf,
    pretty: bool,
    records: BTreeMap<String, R>,
    indexes: BTreeMap<String, Index>,
}

impl<R: Record> ObjectStore<R> {
    /// Loads the snapshot at `path` (if any) and builds the named indexes.
    pub(crate) fn load(path: PathBuf, index_names: &[String], pretty: bool) -> Result<Self> {
        let rows: Vec<R> = read_json_file(&path, TxStep::Open)?.unwrap_or_default();

        let mut store = Self {
            path,
            pretty,
            records: BTreeMap::new(),
            indexes: index_names
                .iter()
                .map(|name| (name.clone(), Index::new()))
                .collect(),
        };

        for record in rows {
            if record.id().is_empty() {
                warn!(
                    "Skipping {} with an empty id in {}",
                    R::KIND,
                    store.path.display()
                );
                continue;
            }
            store.apply(Mutation::Put(record));
        }

        debug!(
            "Loaded {} {} record(s) with {} index(es) from {}",
            store.records.len(),
            R::KIND,
            store.indexes.len(),
            store.path.display()
        );
        Ok(store)
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    fn index(&self, name: &str) -> Result<&Index> {
        self.indexes.get(name).ok_or_else(|| {
            StoreError::storage(
                TxStep::Read,
                format!("no index named '{}' on {}", name, R::KIND.store_name()),
            )
        })
    }

    fn index_insert(&mut self, record: &R) {
        for (name, index) in self.indexes.iter_mut() {
            for key in record.index_keys(name) {
                index.entry(key).or_default().insert(record.id().to_string());
            }
        }
    }

    fn index_remove(&mut self, record: &R) {
        for (name, index) in self.indexes.iter_mut() {
            for key in record.index_keys(name) {
                if let Some(ids) = index.get_mut(&key) {
                    ids.remove(record.id());
                    if ids.is_empty() {
                        index.remove(&key);
                    }
                }
            }
        }
    }

    fn apply(&mut self, mutation: Mutation<R>) {
        match mutation {
            Mutation::Put(record) => {
                if let Some(previous) = self.records.remove(record.id()) {
                    self.index_remove(&previous);
                }
                self.index_insert(&record);
                self.records.insert(record.id().to_string(), record);
            }
            Mutation::Delete(id) => {
                if let Some(previous) = self.records.remove(&id) {
                    self.index_remove(&previous);
                }
            }
        }
    }

    /// Writes the snapshot the store would have after `staged`, without
    /// touching the in-memory state.
    fn persist(&self, staged: &[Mutation<R>]) -> Result<()> {
        let mut view: BTreeMap<&str, &R> = self
            .records
            .iter()
            .map(|(id, record)| (id.as_str(), record))
            .collect();
        for mutation in staged {
            match mutation {
                Mutation::Put(record) => {
                    view.insert(record.id(), record);
                }
                Mutation::Delete(id) => {
                    view.remove(id.as_str());
                }
            }
        }
        let rows: Vec<&R> = view.into_values().collect();
        write_json_atomic(&self.path, &rows, self.pretty)
    }

    fn ids_to_records<'a>(&self, ids: impl Iterator<Item = &'a String>) -> Vec<R> {
        ids.filter_map(|id| self.records.get(id)).cloned().collect()
    }
}

/// One atomic unit of work against a single object store.
///
/// Holds the store's mutex for its whole life, so transactions on the same
/// store run one after another. Staged writes become visible to other
/// transactions only through [`Transaction::commit`]; dropping the
/// transaction without committing discards them.
pub(crate) struct Transaction<'a, R: Record> {
    store: MutexGuard<'a, ObjectStore<R>>,
    mode: TxMode,
    staged: Vec<Mutation<R>>,
}

impl<'a, R: Record> Transaction<'a, R> {
    fn require_write(&self) -> Result<()> {
        match self.mode {
            TxMode::ReadWrite => Ok(()),
            TxMode::ReadOnly => Err(StoreError::storage(
                TxStep::Write,
                format!(
                    "write attempted in a read-only transaction on {}",
                    R::KIND.store_name()
                ),
            )),
        }
    }

    /// Looks up a record, seeing this transaction's own staged writes.
    pub(crate) fn get(&self, id: &str) -> Option<R> {
        for mutation in self.staged.iter().rev() {
            match mutation {
                Mutation::Put(record) if record.id() == id => return Some(record.clone()),
                Mutation::Delete(deleted) if deleted == id => return None,
                _ => {}
            }
        }
        self.store.records.get(id).cloned()
    }

    /// Every record in key order, with this transaction's staged writes applied.
    pub(crate) fn get_all(&self) -> Vec<R> {
        if self.staged.is_empty() {
            return self.store.records.values().cloned().collect();
        }
        let mut records = self.store.records.clone();
        for mutation in &self.staged {
            match mutation {
                Mutation::Put(record) => {
                    records.insert(record.id().to_string(), record.clone());
                }
                Mutation::Delete(id) => {
                    records.remove(id);
                }
            }
        }
        records.into_values().collect()
    }

    /// All records with exactly `key` in `index`.
    pub(crate) fn index_get_all(&self, index: &str, key: &IndexKey) -> Result<Vec<R>> {
        let index = self.store.index(index)?;
        Ok(match index.get(key) {
            Some(ids) => self.store.ids_to_records(ids.iter()),
            None => Vec::new(),
        })
    }

    /// All records whose key in `index` falls within `range`, in key order.
    pub(crate) fn index_range(
        &self,
        index: &str,
        range: (Bound<IndexKey>, Bound<IndexKey>),
    ) -> Result<Vec<R>> {
        let index = self.store.index(index)?;
        if is_empty_range(&range) {
            return Ok(Vec::new());
        }
        let ids = index.range(range).flat_map(|(_, ids)| ids.iter());
        Ok(self.store.ids_to_records(ids))
    }

    /// Up to `limit` records in descending key order of `index`.
    pub(crate) fn index_last(&self, index: &str, limit: usize) -> Result<Vec<R>> {
        let index = self.store.index(index)?;
        let ids = index
            .iter()
            .rev()
            .flat_map(|(_, ids)| ids.iter().rev())
            .take(limit);
        Ok(self.store.ids_to_records(ids))
    }

    /// Inserts a new record; fails if the key is already taken.
    pub(crate) fn add(&mut self, record: R) -> Result<()> {
        self.require_write()?;
        if self.get(record.id()).is_some() {
            return Err(StoreError::storage(
                TxStep::Write,
                format!("{} with key {} already exists", R::KIND, record.id()),
            ));
        }
        self.staged.push(Mutation::Put(record));
        Ok(())
    }

    /// Inserts or replaces a record.
    pub(crate) fn put(&mut self, record: R) -> Result<()> {
        self.require_write()?;
        self.staged.push(Mutation::Put(record));
        Ok(())
    }

    /// Stages removal of `id`. Returns whether a record was present.
    pub(crate) fn delete(&mut self, id: &str) -> Result<bool> {
        self.require_write()?;
        let existed = self.get(id).is_some();
        if existed {
            self.staged.push(Mutation::Delete(id.to_string()));
        }
        Ok(existed)
    }

    /// Persists staged writes and applies them in memory, all or nothing.
    pub(crate) fn commit(mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut self.staged);
        trace!(
            "Committing {} mutation(s) to {}",
            staged.len(),
            R::KIND.store_name()
        );

        if let Err(e) = self.store.persist(&staged) {
            error!(
                "Commit on {} failed, transaction aborted: {}",
                R::KIND.store_name(),
                e
            );
            return Err(e);
        }

        for mutation in staged {
            self.store.apply(mutation);
        }
        Ok(())
    }

    pub(crate) fn abort(self) {
        if !self.staged.is_empty() {
            debug!(
                "Aborting transaction on {} with {} staged mutation(s)",
                R::KIND.store_name(),
                self.staged.len()
            );
        }
    }
}

/// An open database: both object stores and the directory lock.
pub struct Connection {
    name: String,
    version: u32,
    dir: PathBuf,
    pub(crate) notes: Mutex<ObjectStore<Note>>,
    pub(crate) todos: Mutex<ObjectStore<Todo>>,
    _lock: ConnectionLock,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Opens the database described by `config`, running the schema upgrade
    /// if its stored version is older. While another holder keeps the
    /// database open, publishes [`ConnectionState::Blocked`] and retries.
    pub(crate) async fn open(
        config: &Config,
        state: &watch::Sender<ConnectionState>,
    ) -> Result<Connection> {
        config.validate()?;
        let dir = config.database_dir();
        info!(
            "Opening database '{}' at version {} in {}",
            config.db_name,
            config.schema_version,
            dir.display()
        );

        if !dir.exists() {
            debug!("Database directory does not exist, creating: {}", dir.display());
            fs::create_dir_all(&dir).map_err(|e| {
                error!("Failed to create database directory: {}", e);
                StoreError::initialization(format!("{}: {}", dir.display(), e))
            })?;
        }

        let lock = Self::acquire_lock(&dir, config, state).await?;

        let meta_path = dir.join(META_FILE);
        let mut meta: DbMeta = read_json_file(&meta_path, TxStep::Open)
            .map_err(StoreError::initialization)?
            .unwrap_or_else(|| DbMeta::empty(&config.db_name));

        if meta.version != config.schema_version {
            let from = meta.version;
            if from < config.schema_version {
                state.send_replace(ConnectionState::SchemaUpgrade {
                    from,
                    to: config.schema_version,
                });
                info!(
                    "Upgrading schema of '{}' from version {} to {}",
                    config.db_name, from, config.schema_version
                );
            }
            schema::upgrade(&mut meta, config.schema_version)?;
            write_json_atomic(&meta_path, &meta, true).map_err(|e| {
                error!("Failed to write schema metadata: {}", e);
                StoreError::storage(TxStep::Upgrade, e)
            })?;
        }

        let notes = ObjectStore::load(
            dir.join(format!("{}.json", schema::NOTES_STORE)),
            meta.indexes(schema::NOTES_STORE),
            config.pretty_json,
        )
        .map_err(StoreError::initialization)?;
        let todos = ObjectStore::load(
            dir.join(format!("{}.json", schema::TODOS_STORE)),
            meta.indexes(schema::TODOS_STORE),
            config.pretty_json,
        )
        .map_err(StoreError::initialization)?;

        info!(
            "Database '{}' open: {} note(s), {} todo(s)",
            config.db_name,
            notes.len(),
            todos.len()
        );

        Ok(Connection {
            name: config.db_name.clone(),
            version: meta.version,
            dir,
            notes: Mutex::new(notes),
            todos: Mutex::new(todos),
            _lock: lock,
        })
    }

    async fn acquire_lock(
        dir: &Path,
        config: &Config,
        state: &watch::Sender<ConnectionState>,
    ) -> Result<ConnectionLock> {
        let mut blocked = false;
        loop {
            match ConnectionLock::try_acquire(dir)? {
                LockAttempt::Acquired(lock) => {
                    if blocked {
                        info!("Database '{}' is no longer blocked", config.db_name);
                        state.send_replace(ConnectionState::Opening);
                    }
                    return Ok(lock);
                }
                LockAttempt::Held(Some(holder)) if !holder_is_alive(holder.pid) => {
                    warn!(
                        "Database '{}' was left locked by pid {} (since {}), which is no longer running; reclaiming",
                        config.db_name, holder.pid, holder.opened_at
                    );
                    if !ConnectionLock::remove_stale(dir, &holder)? {
                        debug!("Lock on '{}' changed hands before it was reclaimed", config.db_name);
                    }
                }
                LockAttempt::Held(holder) => {
                    if !blocked {
                        match holder {
                            Some(holder) => warn!(
                                "Database '{}' is held open by pid {} since {}; waiting",
                                config.db_name, holder.pid, holder.opened_at
                            ),
                            None => warn!(
                                "Database '{}' is held open ({} exists); waiting",
                                config.db_name,
                                dir.join(LOCK_FILE).display()
                            ),
                        }
                        state.send_replace(ConnectionState::Blocked);
                        blocked = true;
                    }
                    tokio::time::sleep(config.blocked_retry()).await;
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) async fn transaction<R: Record>(&self, mode: TxMode) -> Transaction<'_, R> {
        let store = R::object_store(self).lock().await;
        Transaction {
            store,
            mode,
            staged: Vec::new(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!("Closing database '{}'", self.name);
    }
}

// BTreeMap::range panics on inverted bounds.
fn is_empty_range(range: &(Bound<IndexKey>, Bound<IndexKey>)) -> bool {
    match range {
        (Bound::Included(start), Bound::Included(end)) => start > end,
        (Bound::Included(start), Bound::Excluded(end))
        | (Bound::Excluded(start), Bound::Included(end))
        | (Bound::Excluded(start), Bound::Excluded(end)) => start >= end,
        _ => false,
    }
}

/// Converts any key range into the owned bounds `index_range` takes.
pub(crate) fn key_range(range: impl RangeBounds<IndexKey>) -> (Bound<IndexKey>, Bound<IndexKey>) {
    (range.start_bound().cloned(), range.end_bound().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{now_millis, NewNote, NewTodo, Priority};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config {
            blocked_retry_ms: 10,
            ..Config::with_data_dir(dir.path())
        }
    }

    async fn open(config: &Config) -> Connection {
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        Connection::open(config, &state).await.unwrap()
    }

    fn note(id: &str, title: &str, tags: &[&str]) -> Note {
        Note::create(
            id.to_string(),
            NewNote::new(title, "").with_tags(tags.iter().copied()),
            now_millis(),
        )
    }

    #[tokio::test]
    async fn committed_writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        {
            let conn = open(&config).await;
            let mut tx = conn.transaction::<Note>(TxMode::ReadWrite).await;
            tx.add(note("a", "first", &["x"])).unwrap();
            tx.add(note("b", "second", &[])).unwrap();
            tx.commit().unwrap();
        }

        let conn = open(&config).await;
        let tx = conn.transaction::<Note>(TxMode::ReadOnly).await;
        assert_eq!(tx.get_all().len(), 2);
        let tagged = tx
            .index_get_all(schema::IDX_TAGS, &IndexKey::tag("x"))
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].id, "a");
    }

    #[tokio::test]
    async fn get_all_sees_staged_writes() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&config(&dir)).await;

        let mut tx = conn.transaction::<Note>(TxMode::ReadWrite).await;
        tx.add(note("a", "first", &[])).unwrap();
        tx.add(note("b", "second", &[])).unwrap();
        tx.commit().unwrap();

        let mut tx = conn.transaction::<Note>(TxMode::ReadWrite).await;
        tx.delete("a").unwrap();
        tx.put(note("b", "renamed", &[])).unwrap();
        tx.add(note("c", "third", &[])).unwrap();
        let titles: Vec<String> = tx.get_all().into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["renamed", "third"]);
        tx.abort();

        let tx = conn.transaction::<Note>(TxMode::ReadOnly).await;
        assert_eq!(tx.get_all().len(), 2);
    }

    #[tokio::test]
    async fn aborted_transaction_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&config(&dir)).await;

        let mut tx = conn.transaction::<Note>(TxMode::ReadWrite).await;
        tx.add(note("a", "draft", &[])).unwrap();
        assert!(tx.get("a").is_some());
        tx.abort();

        let tx = conn.transaction::<Note>(TxMode::ReadOnly).await;
        assert!(tx.get("a").is_none());
        assert!(tx.get_all().is_empty());
        assert!(!dir.path().join("noteflow_db/notes.json").exists());
    }

    #[tokio::test]
    async fn failed_commit_keeps_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let conn = open(&config).await;

        // A directory where the snapshot file should go makes the rename fail.
        fs::create_dir_all(config.database_dir().join("notes.json")).unwrap();

        let mut tx = conn.transaction::<Note>(TxMode::ReadWrite).await;
        tx.add(note("a", "doomed", &["x"])).unwrap();
        let err = tx.commit().unwrap_err();
        assert!(matches!(err, StoreError::Storage { .. }));

        let tx = conn.transaction::<Note>(TxMode::ReadOnly).await;
        assert!(tx.get("a").is_none());
        assert!(tx
            .index_get_all(schema::IDX_TAGS, &IndexKey::tag("x"))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&config(&dir)).await;
        let mut tx = conn.transaction::<Note>(TxMode::ReadWrite).await;
        tx.add(note("a", "one", &[])).unwrap();
        assert!(tx.add(note("a", "two", &[])).is_err());
    }

    #[tokio::test]
    async fn read_only_transaction_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&config(&dir)).await;
        let mut tx = conn.transaction::<Note>(TxMode::ReadOnly).await;
        let err = tx.put(note("a", "nope", &[])).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Storage {
                step: TxStep::Write,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn replacing_a_record_moves_its_index_entries() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&config(&dir)).await;

        let todo = Todo::create(
            "t".to_string(),
            NewTodo::new("rent").with_priority(Priority::High),
            now_millis(),
        );
        let mut tx = conn.transaction::<Todo>(TxMode::ReadWrite).await;
        tx.add(todo.clone()).unwrap();
        tx.commit().unwrap();

        let mut tx = conn.transaction::<Todo>(TxMode::ReadWrite).await;
        tx.put(Todo {
            completed: true,
            ..todo
        })
        .unwrap();
        tx.commit().unwrap();

        let tx = conn.transaction::<Todo>(TxMode::ReadOnly).await;
        let done = tx
            .index_get_all(schema::IDX_COMPLETED, &IndexKey::Bool(true))
            .unwrap();
        let open_todos = tx
            .index_get_all(schema::IDX_COMPLETED, &IndexKey::Bool(false))
            .unwrap();
        assert_eq!(done.len(), 1);
        assert!(open_todos.is_empty());
    }

    #[tokio::test]
    async fn version_one_database_has_no_tag_index_until_upgraded() {
        let dir = tempfile::tempdir().unwrap();
        let mut v1 = config(&dir);
        v1.schema_version = 1;
        {
            let conn = open(&v1).await;
            assert_eq!(conn.version(), 1);
            let tx = conn.transaction::<Note>(TxMode::ReadOnly).await;
            assert!(tx
                .index_get_all(schema::IDX_TAGS, &IndexKey::tag("x"))
                .is_err());
        }

        let (state, mut rx) = watch::channel(ConnectionState::Uninitialized);
        let conn = Connection::open(&config(&dir), &state).await.unwrap();
        assert_eq!(conn.version(), 2);
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            *rx.borrow_and_update(),
            ConnectionState::SchemaUpgrade { from: 1, to: 2 }
        );
    }

    #[tokio::test]
    async fn opening_at_an_older_version_fails() {
        let dir = tempfile::tempdir().unwrap();
        drop(open(&config(&dir)).await);

        let mut older = config(&dir);
        older.schema_version = 1;
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        let err = Connection::open(&older, &state).await.err().unwrap();
        assert!(matches!(err, StoreError::Initialization { .. }));
    }

    #[tokio::test]
    async fn lock_is_released_when_connection_drops() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let lock_path = config.database_dir().join(LOCK_FILE);

        let conn = open(&config).await;
        assert!(lock_path.exists());
        assert!(matches!(
            ConnectionLock::try_acquire(&config.database_dir()).unwrap(),
            LockAttempt::Held(Some(LockMeta { .. }))
        ));
        drop(conn);
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn stale_lock_is_only_removed_while_it_names_the_dead_holder() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let conn = open(&config).await;
        let db_dir = config.database_dir();

        let ours = match ConnectionLock::try_acquire(&db_dir).unwrap() {
            LockAttempt::Held(Some(meta)) => meta,
            _ => panic!("lock should be held with readable metadata"),
        };
        assert!(holder_is_alive(ours.pid));

        let someone_else = LockMeta {
            pid: ours.pid.wrapping_add(1),
            opened_at: ours.opened_at,
        };
        assert!(!ConnectionLock::remove_stale(&db_dir, &someone_else).unwrap());
        assert!(db_dir.join(LOCK_FILE).exists());

        drop(conn);
        assert!(!ConnectionLock::remove_stale(&db_dir, &ours).unwrap());
    }

    #[tokio::test]
    async fn recent_scan_walks_index_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&config(&dir)).await;
        let base = now_millis();

        let mut tx = conn.transaction::<Note>(TxMode::ReadWrite).await;
        for (i, id) in ["old", "mid", "new"].iter().enumerate() {
            let at = base + chrono::Duration::seconds(i as i64);
            tx.add(Note::create(id.to_string(), NewNote::new(*id, ""), at))
                .unwrap();
        }
        tx.commit().unwrap();

        let tx = conn.transaction::<Note>(TxMode::ReadOnly).await;
        let recent: Vec<String> = tx
            .index_last(schema::IDX_UPDATED_AT, 2)
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(recent, vec!["new".to_string(), "mid".to_string()]);

        let early = tx
            .index_range(
                schema::IDX_CREATED_AT,
                key_range(..IndexKey::Time((base + chrono::Duration::seconds(1)).timestamp_millis())),
            )
            .unwrap();
        assert_eq!(early.len(), 1);
        assert_eq!(early[0].id, "old");
    }
}
