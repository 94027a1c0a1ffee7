//! Schema versions, index keys and the upgrade path.
//!
//! The schema is a list of object stores, each keyed by `id`, with a set of
//! named secondary indexes. `DbMeta` is its persisted form in `meta.json`.
use std::collections::BTreeMap;

use log::{debug, info};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{engine::Connection, engine::ObjectStore, RecordKind, Result, StoreError};

pub const LATEST_VERSION: u32 = 2;

pub const NOTES_STORE: &str = "notes";
pub const TODOS_STORE: &str = "todos";

pub const IDX_CREATED_AT: &str = "createdAt";
pub const IDX_UPDATED_AT: &str = "updatedAt";
pub const IDX_TITLE: &str = "title";
pub const IDX_TAGS: &str = "tags";
pub const IDX_COLOR: &str = "color";
pub const IDX_COMPLETED: &str = "completed";
pub const IDX_DUE_DATE: &str = "dueDate";
pub const IDX_PRIORITY: &str = "priority";

/// A secondary index key. Variants order before each other, which only
/// matters for range scans; every index holds a single variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKey {
    Bool(bool),
    Time(i64),
    Text(String),
}

impl IndexKey {
    /// Tag keys are matched case-insensitively and without surrounding whitespace.
    pub fn tag(tag: &str) -> IndexKey {
        IndexKey::Text(tag.trim().to_lowercase())
    }

    pub fn tags<'a>(tags: impl IntoIterator<Item = &'a String>) -> Vec<IndexKey> {
        let mut keys: Vec<IndexKey> = tags.into_iter().map(|t| IndexKey::tag(t)).collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// A document held in an object store.
pub(crate) trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: RecordKind;

    fn id(&self) -> &str;

    /// Keys this record contributes to `index`. Empty when the attribute is
    /// absent, so the record is not reachable through that index.
    fn index_keys(&self, index: &str) -> Vec<IndexKey>;

    fn object_store(conn: &Connection) -> &Mutex<ObjectStore<Self>>;
}

/// Persisted description of the database: its version and the declared
/// indexes of every object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbMeta {
    pub name: String,
    pub version: u32,
    pub stores: BTreeMap<String, Vec<String>>,
}

impl DbMeta {
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: 0,
            stores: BTreeMap::new(),
        }
    }

    /// Declares an object store. Returns false if it already existed.
    pub fn declare_store(&mut self, store: &str) -> bool {
        if self.stores.contains_key(store) {
            return false;
        }
        debug!("Creating object store '{}'", store);
        self.stores.insert(store.to_string(), Vec::new());
        true
    }

    /// Declares an index on an existing store. Returns false if it already existed.
    pub fn declare_index(&mut self, store: &str, index: &str) -> bool {
        let indexes = self.stores.entry(store.to_string()).or_default();
        if indexes.iter().any(|i| i == index) {
            return false;
        }
        debug!("Creating index '{}' on '{}'", index, store);
        indexes.push(index.to_string());
        true
    }

    pub fn indexes(&self, store: &str) -> &[String] {
        self.stores.get(store).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Brings `meta` from its current version to `target`, applying each version
/// step in turn. Every declaration is idempotent, so re-running a step over a
/// database that already has its stores is harmless.
pub fn upgrade(meta: &mut DbMeta, target: u32) -> Result<()> {
    if target == 0 || target > LATEST_VERSION {
        return Err(StoreError::Config {
            message: format!(
                "schema version {} is not supported (expected 1..={})",
                target, LATEST_VERSION
            ),
        });
    }
    if meta.version > target {
        return Err(StoreError::initialization(format!(
            "database '{}' is at version {}, cannot open it at older version {}",
            meta.name, meta.version, target
        )));
    }

    for version in (meta.version + 1)..=target {
        info!("Applying schema step to version {}", version);
        match version {
            1 => {
                meta.declare_store(NOTES_STORE);
                for index in [IDX_CREATED_AT, IDX_UPDATED_AT, IDX_TITLE] {
                    meta.declare_index(NOTES_STORE, index);
                }
                meta.declare_store(TODOS_STORE);
                for index in [IDX_CREATED_AT, IDX_UPDATED_AT, IDX_COMPLETED, IDX_DUE_DATE] {
                    meta.declare_index(TODOS_STORE, index);
                }
            }
            2 => {
                meta.declare_store(NOTES_STORE);
                meta.declare_index(NOTES_STORE, IDX_TAGS);
                meta.declare_index(NOTES_STORE, IDX_COLOR);
                meta.declare_store(TODOS_STORE);
                meta.declare_index(TODOS_STORE, IDX_PRIORITY);
                meta.declare_index(TODOS_STORE, IDX_TAGS);
            }
            _ => unreachable!("version bounded by LATEST_VERSION"),
        }
        meta.version = version;
    }
    Ok(())
}
