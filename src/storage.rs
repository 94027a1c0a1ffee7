use std::{ops::Bound, sync::Arc};

use chrono::{DateTime, Utc};
use log::{debug, error, info, trace};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::{
    engine::{key_range, Connection, Transaction},
    next_update_time, now_millis,
    schema::{self, IndexKey, Record},
    Config, ConnectionState, NewNote, NewTodo, Note, NotePatch, Priority, Result, StoreError,
    Todo, TodoPatch, TxMode, TxStep,
};

/// Manages the storage and retrieval of notes and todos.
///
/// Cloning is cheap; clones share one connection. The connection is opened
/// lazily by the first operation (or an explicit [`RecordStore::init`]) and
/// cached until [`RecordStore::close`]. Concurrent callers of `init` wait for
/// the same open instead of racing to open their own. A failed open is not
/// cached, so the next call tries again.
///
/// Every operation runs in its own transaction. Sequences of operations are
/// not serializable: two concurrent read-modify-write sequences on the same
/// record resolve as last commit wins.
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    connection: Mutex<Option<Arc<Connection>>>,
    state: watch::Sender<ConnectionState>,
}

impl RecordStore {
    /// Creates a new RecordStore. Nothing touches the disk until `init`.
    pub fn new(config: Config) -> Self {
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        Self {
            inner: Arc::new(Inner {
                config,
                connection: Mutex::new(None),
                state,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Receiver observing every connection state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Opens the database once and returns the shared connection.
    pub async fn init(&self) -> Result<Arc<Connection>> {
        let mut slot = self.inner.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            trace!("Reusing open connection to '{}'", conn.name());
            return Ok(Arc::clone(conn));
        }

        self.inner.state.send_replace(ConnectionState::Opening);
        match Connection::open(&self.inner.config, &self.inner.state).await {
            Ok(conn) => {
                let conn = Arc::new(conn);
                *slot = Some(Arc::clone(&conn));
                self.inner.state.send_replace(ConnectionState::Ready);
                info!("Record store ready");
                Ok(conn)
            }
            Err(e) => {
                error!("Failed to open record store: {}", e);
                let e = match e {
                    StoreError::Storage { .. } => StoreError::initialization(e),
                    other => other,
                };
                self.inner
                    .state
                    .send_replace(ConnectionState::Failed(e.clone()));
                Err(e)
            }
        }
    }

    /// Drops the cached connection. In-flight operations keep their handle
    /// until they finish; the directory lock is released with the last one.
    pub async fn close(&self) {
        let mut slot = self.inner.connection.lock().await;
        if slot.take().is_some() {
            info!("Record store closed");
            self.inner
                .state
                .send_replace(ConnectionState::Uninitialized);
        }
    }

    async fn read<R, T, F>(&self, f: F) -> Result<T>
    where
        R: Record,
        F: FnOnce(&Transaction<'_, R>) -> Result<T>,
    {
        let conn = self.init().await?;
        let tx = conn.transaction::<R>(TxMode::ReadOnly).await;
        f(&tx)
    }

    async fn write<R, T, F>(&self, f: F) -> Result<T>
    where
        R: Record,
        F: FnOnce(&mut Transaction<'_, R>) -> Result<T>,
    {
        let conn = self.init().await?;
        let mut tx = conn.transaction::<R>(TxMode::ReadWrite).await;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.abort();
                Err(e)
            }
        }
    }

    /// Adds several records in one transaction; used by import. If any
    /// record cannot be staged the whole batch is rolled back and the error
    /// is reported at the abort step.
    pub(crate) async fn add_all<R: Record>(&self, records: Vec<R>) -> Result<usize> {
        let count = records.len();
        if count == 0 {
            return Ok(0);
        }
        self.write::<R, _, _>(|tx| {
            for record in records {
                tx.add(record).map_err(|e| {
                    StoreError::storage(
                        TxStep::Abort,
                        format!("batch of {} {}(s) rolled back: {}", count, R::KIND, e),
                    )
                })?;
            }
            Ok(count)
        })
        .await
    }

    // Notes

    pub async fn add_note(&self, draft: NewNote) -> Result<Note> {
        let note = Note::create(new_id(), draft, now_millis());
        info!("Adding note: {}", note.id);
        self.write(|tx: &mut Transaction<'_, Note>| {
            tx.add(note.clone())?;
            Ok(note)
        })
        .await
    }

    /// Merges `patch` into the stored note. Fails with `NotFound` if absent.
    pub async fn update_note(&self, id: &str, patch: NotePatch) -> Result<Note> {
        info!("Updating note: {}", id);
        self.write(|tx: &mut Transaction<'_, Note>| {
            let existing = tx
                .get(id)
                .ok_or_else(|| StoreError::not_found(Note::KIND, id))?;
            let updated = existing.merged(patch, next_update_time(existing.updated_at)?);
            tx.put(updated.clone())?;
            Ok(updated)
        })
        .await
    }

    /// Deleting an id that is not stored succeeds without effect.
    pub async fn delete_note(&self, id: &str) -> Result<()> {
        info!("Deleting note: {}", id);
        let existed = self
            .write(|tx: &mut Transaction<'_, Note>| tx.delete(id))
            .await?;
        if !existed {
            debug!("Note {} was not stored; nothing deleted", id);
        }
        Ok(())
    }

    pub async fn get_note(&self, id: &str) -> Result<Option<Note>> {
        debug!("Retrieving note by ID: {}", id);
        self.read(|tx: &Transaction<'_, Note>| Ok(tx.get(id))).await
    }

    pub async fn get_all_notes(&self) -> Result<Vec<Note>> {
        self.read(|tx: &Transaction<'_, Note>| Ok(tx.get_all()))
            .await
    }

    /// Notes whose title, content or any tag contains `query`, ignoring case.
    pub async fn search_notes(&self, query: &str) -> Result<Vec<Note>> {
        info!("Searching notes with query: '{}'", query);
        let needle = query.to_lowercase();
        let notes = self
            .read(|tx: &Transaction<'_, Note>| {
                Ok(tx
                    .get_all()
                    .into_iter()
                    .filter(|note| note.matches_query(&needle))
                    .collect::<Vec<_>>())
            })
            .await?;
        debug!("Found {} matching notes", notes.len());
        Ok(notes)
    }

    /// Notes carrying `tag`, compared without case or surrounding whitespace.
    pub async fn get_notes_by_tag(&self, tag: &str) -> Result<Vec<Note>> {
        info!("Retrieving notes by tag: {}", tag);
        self.read(|tx: &Transaction<'_, Note>| {
            tx.index_get_all(schema::IDX_TAGS, &IndexKey::tag(tag))
        })
        .await
    }

    pub async fn get_notes_by_color(&self, color: &str) -> Result<Vec<Note>> {
        self.read(|tx: &Transaction<'_, Note>| {
            tx.index_get_all(schema::IDX_COLOR, &IndexKey::Text(color.to_string()))
        })
        .await
    }

    /// The `limit` most recently updated notes, newest first.
    pub async fn get_recent_notes(&self, limit: usize) -> Result<Vec<Note>> {
        self.read(|tx: &Transaction<'_, Note>| tx.index_last(schema::IDX_UPDATED_AT, limit))
            .await
    }

    // Todos

    pub async fn add_todo(&self, draft: NewTodo) -> Result<Todo> {
        draft.validate()?;
        let todo = Todo::create(new_id(), draft, now_millis());
        info!("Adding todo: {}", todo.id);
        self.write(|tx: &mut Transaction<'_, Todo>| {
            tx.add(todo.clone())?;
            Ok(todo)
        })
        .await
    }

    /// Merges `patch` into the stored todo. Fails with `NotFound` if absent.
    pub async fn update_todo(&self, id: &str, patch: TodoPatch) -> Result<Todo> {
        info!("Updating todo: {}", id);
        patch.validate()?;
        self.write(|tx: &mut Transaction<'_, Todo>| {
            let existing = tx
                .get(id)
                .ok_or_else(|| StoreError::not_found(Todo::KIND, id))?;
            let updated = existing.merged(patch, next_update_time(existing.updated_at)?);
            tx.put(updated.clone())?;
            Ok(updated)
        })
        .await
    }

    /// Deleting an id that is not stored succeeds without effect.
    pub async fn delete_todo(&self, id: &str) -> Result<()> {
        info!("Deleting todo: {}", id);
        let existed = self
            .write(|tx: &mut Transaction<'_, Todo>| tx.delete(id))
            .await?;
        if !existed {
            debug!("Todo {} was not stored; nothing deleted", id);
        }
        Ok(())
    }

    pub async fn get_todo(&self, id: &str) -> Result<Option<Todo>> {
        debug!("Retrieving todo by ID: {}", id);
        self.read(|tx: &Transaction<'_, Todo>| Ok(tx.get(id))).await
    }

    pub async fn get_all_todos(&self) -> Result<Vec<Todo>> {
        self.read(|tx: &Transaction<'_, Todo>| Ok(tx.get_all()))
            .await
    }

    /// Todos whose title, description or any tag contains `query`, ignoring case.
    pub async fn search_todos(&self, query: &str) -> Result<Vec<Todo>> {
        info!("Searching todos with query: '{}'", query);
        let needle = query.to_lowercase();
        self.read(|tx: &Transaction<'_, Todo>| {
            Ok(tx
                .get_all()
                .into_iter()
                .filter(|todo| todo.matches_query(&needle))
                .collect())
        })
        .await
    }

    pub async fn get_todos_by_priority(&self, priority: Priority) -> Result<Vec<Todo>> {
        self.read(|tx: &Transaction<'_, Todo>| {
            tx.index_get_all(
                schema::IDX_PRIORITY,
                &IndexKey::Text(priority.as_str().to_string()),
            )
        })
        .await
    }

    pub async fn get_todos_by_tag(&self, tag: &str) -> Result<Vec<Todo>> {
        self.read(|tx: &Transaction<'_, Todo>| {
            tx.index_get_all(schema::IDX_TAGS, &IndexKey::tag(tag))
        })
        .await
    }

    pub async fn get_completed_todos(&self) -> Result<Vec<Todo>> {
        self.read(|tx: &Transaction<'_, Todo>| {
            tx.index_get_all(schema::IDX_COMPLETED, &IndexKey::Bool(true))
        })
        .await
    }

    pub async fn get_pending_todos(&self) -> Result<Vec<Todo>> {
        self.read(|tx: &Transaction<'_, Todo>| {
            tx.index_get_all(schema::IDX_COMPLETED, &IndexKey::Bool(false))
        })
        .await
    }

    /// Todos with a due date strictly before `before`, earliest first.
    pub async fn get_todos_due_before(&self, before: DateTime<Utc>) -> Result<Vec<Todo>> {
        let end = IndexKey::Time(before.timestamp_millis());
        self.read(|tx: &Transaction<'_, Todo>| {
            tx.index_range(
                schema::IDX_DUE_DATE,
                (Bound::Unbounded, Bound::Excluded(end)),
            )
        })
        .await
    }

    /// Todos due within `[from, to)`, earliest first.
    pub async fn get_todos_due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Todo>> {
        let range = key_range(
            IndexKey::Time(from.timestamp_millis())..IndexKey::Time(to.timestamp_millis()),
        );
        self.read(|tx: &Transaction<'_, Todo>| tx.index_range(schema::IDX_DUE_DATE, range))
            .await
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}
