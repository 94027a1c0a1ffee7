//! The Todo record, its creation draft and its partial update.
use std::fmt;

use chrono::{
    serde::{ts_milliseconds, ts_milliseconds_option},
    DateTime, Utc,
};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    contains_folded,
    engine::{Connection, ObjectStore},
    normalize_tags,
    schema::{self, IndexKey, Record},
    RecordKind, Result, StoreError,
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(
        default,
        with = "ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTodo {
    pub title: String,
    pub description: Option<String>,
    pub completed: bool,
    pub priority: Option<Priority>,
    pub due_date: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

impl NewTodo {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_due_date(mut self, due: DateTime<Utc>) -> Self {
        self.due_date = Some(due);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// A partial update. For the optional fields, `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TodoPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub completed: Option<bool>,
    pub priority: Option<Option<Priority>>,
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub tags: Option<Vec<String>>,
}

impl TodoPatch {
    pub fn completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
            ..Default::default()
        }
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &TodoPatch::default()
    }
}

fn validate_title(title: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(StoreError::validation(
            RecordKind::Todo,
            "title must not be empty",
        ));
    }
    Ok(())
}

impl NewTodo {
    pub(crate) fn validate(&self) -> Result<()> {
        validate_title(&self.title)
    }
}

impl TodoPatch {
    pub(crate) fn validate(&self) -> Result<()> {
        match &self.title {
            Some(title) => validate_title(title),
            None => Ok(()),
        }
    }
}

impl Todo {
    pub(crate) fn create(id: String, draft: NewTodo, now: DateTime<Utc>) -> Self {
        Self::restore(id, draft, now, now)
    }

    pub(crate) fn restore(
        id: String,
        draft: NewTodo,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Todo {
            id,
            title: draft.title,
            description: draft.description,
            completed: draft.completed,
            priority: draft.priority,
            due_date: draft.due_date,
            tags: normalize_tags(draft.tags),
            created_at,
            updated_at: updated_at.max(created_at),
        }
    }

    /// Applies `patch` field by field. `id` and `created_at` come from `self`.
    pub(crate) fn merged(&self, patch: TodoPatch, updated_at: DateTime<Utc>) -> Todo {
        let TodoPatch {
            title,
            description,
            completed,
            priority,
            due_date,
            tags,
        } = patch;

        Todo {
            id: self.id.clone(),
            title: title.unwrap_or_else(|| self.title.clone()),
            description: description.unwrap_or_else(|| self.description.clone()),
            completed: completed.unwrap_or(self.completed),
            priority: priority.unwrap_or(self.priority),
            due_date: due_date.unwrap_or(self.due_date),
            tags: tags.map(normalize_tags).unwrap_or_else(|| self.tags.clone()),
            created_at: self.created_at,
            updated_at,
        }
    }

    /// Whether the title, description or any tag contains `needle`, which must be lowercase.
    pub fn matches_query(&self, needle: &str) -> bool {
        contains_folded(&self.title, needle)
            || self
                .description
                .as_deref()
                .is_some_and(|d| contains_folded(d, needle))
            || self.tags.iter().any(|t| contains_folded(t, needle))
    }
}

impl Record for Todo {
    const KIND: RecordKind = RecordKind::Todo;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_keys(&self, index: &str) -> Vec<IndexKey> {
        match index {
            schema::IDX_CREATED_AT => vec![IndexKey::Time(self.created_at.timestamp_millis())],
            schema::IDX_UPDATED_AT => vec![IndexKey::Time(self.updated_at.timestamp_millis())],
            schema::IDX_COMPLETED => vec![IndexKey::Bool(self.completed)],
            schema::IDX_DUE_DATE => self
                .due_date
                .iter()
                .map(|d| IndexKey::Time(d.timestamp_millis()))
                .collect(),
            schema::IDX_PRIORITY => self
                .priority
                .iter()
                .map(|p| IndexKey::Text(p.as_str().to_string()))
                .collect(),
            schema::IDX_TAGS => IndexKey::tags(&self.tags),
            _ => Vec::new(),
        }
    }

    fn object_store(conn: &Connection) -> &Mutex<ObjectStore<Self>> {
        &conn.todos
    }
}
