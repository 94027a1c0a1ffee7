//! Reactive access layer over the record store.
//!
//! `DataContext` keeps an in-memory snapshot of both collections for a UI
//! to render from. The snapshot is a cache: every successful mutation patches
//! it with the record the store returned (append, replace by id or remove by
//! id) rather than reloading the collections. Failures are kept in the
//! snapshot's `error` slot and also returned to the caller.
use log::{debug, error, info};
use tokio::sync::watch;

use crate::{
    NewNote, NewTodo, Note, NotePatch, RecordStore, Result, StoreError, Todo, TodoPatch,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSnapshot {
    pub notes: Vec<Note>,
    pub todos: Vec<Todo>,
    pub is_loading: bool,
    pub error: Option<StoreError>,
}

impl Default for DataSnapshot {
    fn default() -> Self {
        Self {
            notes: Vec::new(),
            todos: Vec::new(),
            is_loading: true,
            error: None,
        }
    }
}

pub struct DataContext {
    store: RecordStore,
    snapshot: watch::Sender<DataSnapshot>,
}

impl DataContext {
    pub fn new(store: RecordStore) -> Self {
        let (snapshot, _) = watch::channel(DataSnapshot::default());
        Self { store, snapshot }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// A copy of the current snapshot.
    pub fn snapshot(&self) -> DataSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DataSnapshot> {
        self.snapshot.subscribe()
    }

    /// Initializes the store and loads both collections once.
    pub async fn mount(&self) -> Result<()> {
        info!("Mounting data context");
        if let Err(e) = self.store.init().await {
            self.fail_load(e.clone());
            return Err(e);
        }
        self.load().await
    }

    /// Reloads both collections from the store.
    pub async fn refresh(&self) -> Result<()> {
        debug!("Refreshing data context");
        self.load().await
    }

    async fn load(&self) -> Result<()> {
        self.snapshot.send_modify(|s| s.is_loading = true);
        match tokio::try_join!(self.store.get_all_notes(), self.store.get_all_todos()) {
            Ok((notes, todos)) => {
                debug!("Loaded {} notes and {} todos", notes.len(), todos.len());
                self.snapshot.send_modify(|s| {
                    s.notes = notes;
                    s.todos = todos;
                    s.is_loading = false;
                    s.error = None;
                });
                Ok(())
            }
            Err(e) => {
                self.fail_load(e.clone());
                Err(e)
            }
        }
    }

    fn fail_load(&self, e: StoreError) {
        error!("Failed to load data: {}", e);
        self.snapshot.send_modify(|s| {
            s.is_loading = false;
            s.error = Some(e);
        });
    }

    fn record_error<T>(&self, result: Result<T>, what: &str) -> Result<T> {
        if let Err(e) = &result {
            error!("Failed to {}: {}", what, e);
            let e = e.clone();
            self.snapshot.send_modify(|s| s.error = Some(e));
        }
        result
    }

    pub fn clear_error(&self) {
        self.snapshot.send_if_modified(|s| s.error.take().is_some());
    }

    pub async fn add_note(&self, draft: NewNote) -> Result<Note> {
        let note = self.record_error(self.store.add_note(draft).await, "add note")?;
        self.snapshot.send_modify(|s| s.notes.push(note.clone()));
        Ok(note)
    }

    pub async fn update_note(&self, id: &str, patch: NotePatch) -> Result<Note> {
        let note = self.record_error(self.store.update_note(id, patch).await, "update note")?;
        self.snapshot.send_modify(|s| {
            if let Some(slot) = s.notes.iter_mut().find(|n| n.id == note.id) {
                *slot = note.clone();
            }
        });
        Ok(note)
    }

    pub async fn delete_note(&self, id: &str) -> Result<()> {
        self.record_error(self.store.delete_note(id).await, "delete note")?;
        self.snapshot.send_modify(|s| s.notes.retain(|n| n.id != id));
        Ok(())
    }

    pub async fn add_todo(&self, draft: NewTodo) -> Result<Todo> {
        let todo = self.record_error(self.store.add_todo(draft).await, "add todo")?;
        self.snapshot.send_modify(|s| s.todos.push(todo.clone()));
        Ok(todo)
    }

    pub async fn update_todo(&self, id: &str, patch: TodoPatch) -> Result<Todo> {
        let todo = self.record_error(self.store.update_todo(id, patch).await, "update todo")?;
        self.snapshot.send_modify(|s| {
            if let Some(slot) = s.todos.iter_mut().find(|t| t.id == todo.id) {
                *slot = todo.clone();
            }
        });
        Ok(todo)
    }

    pub async fn delete_todo(&self, id: &str) -> Result<()> {
        self.record_error(self.store.delete_todo(id).await, "delete todo")?;
        self.snapshot.send_modify(|s| s.todos.retain(|t| t.id != id));
        Ok(())
    }

    pub async fn search_notes(&self, query: &str) -> Result<Vec<Note>> {
        self.record_error(self.store.search_notes(query).await, "search notes")
    }

    pub async fn search_todos(&self, query: &str) -> Result<Vec<Todo>> {
        self.record_error(self.store.search_todos(query).await, "search todos")
    }
}
