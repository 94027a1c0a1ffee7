//! JSON export and import of the whole store.
//!
//! The export document carries both collections as camelCase records with
//! millisecond timestamps. Import is lenient: timestamps may be epoch
//! milliseconds or RFC 3339 strings, optional fields may be missing, and
//! unrelated top-level keys are ignored. A malformed record is skipped and
//! reported; the valid records of each collection are committed together.
use std::{fs, path::Path};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{
    from_millis, now_millis, parse_timestamp, ImportFailure, ImportSummary, NewNote, NewTodo,
    Note, Priority, RecordKind, RecordStore, Result, StoreError, Todo,
};

pub const EXPORT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub notes: Vec<Note>,
    pub todos: Vec<Todo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportedNote {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default, deserialize_with = "flexible_time")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flexible_time")]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportedTodo {
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    completed: bool,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default, deserialize_with = "flexible_time")]
    due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default, deserialize_with = "flexible_time")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flexible_time")]
    updated_at: Option<DateTime<Utc>>,
}

/// Accepts `null`, epoch milliseconds or a date string.
fn flexible_time<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_millis)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {}", n))),
        Some(Value::String(s)) => parse_timestamp(&s)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("unrecognised timestamp '{}'", s))),
        Some(other) => Err(D::Error::custom(format!("invalid timestamp: {}", other))),
    }
}

fn timestamps(
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let created = created_at.unwrap_or(now);
    let updated = updated_at.unwrap_or(created).max(created);
    (created, updated)
}

impl ImportedNote {
    fn into_note(self, id: String, now: DateTime<Utc>) -> Note {
        let (created, updated) = timestamps(self.created_at, self.updated_at, now);
        let draft = NewNote {
            title: self.title,
            content: self.content,
            tags: self.tags,
            color: self.color,
        };
        Note::restore(id, draft, created, updated)
    }
}

impl ImportedTodo {
    fn into_todo(self, id: String, now: DateTime<Utc>) -> Result<Todo> {
        let (created, updated) = timestamps(self.created_at, self.updated_at, now);
        let draft = NewTodo {
            title: self.title,
            description: self.description,
            completed: self.completed,
            priority: self.priority,
            due_date: self.due_date,
            tags: self.tags,
        };
        draft.validate()?;
        Ok(Todo::restore(id, draft, created, updated))
    }
}

/// Returns the array under `key`, an empty slice if the key is absent, or
/// an error if it holds anything but an array.
fn records_under<'a>(doc: &'a serde_json::Map<String, Value>, key: &str) -> Result<&'a [Value]> {
    match doc.get(key) {
        None | Some(Value::Null) => Ok(&[] as &[Value]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(StoreError::Import {
            message: format!("'{}' must be an array", key),
        }),
    }
}

/// Parses every element, collecting the good ones and recording the rest.
fn collect_records<T, F>(
    items: &[Value],
    kind: RecordKind,
    failed: &mut Vec<ImportFailure>,
    mut build: F,
) -> Vec<T>
where
    F: FnMut(Value) -> Result<T>,
{
    let mut records = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        match build(item.clone()) {
            Ok(record) => records.push(record),
            Err(e) => {
                let reason = match e {
                    StoreError::Validation { message, .. } => message,
                    other => other.to_string(),
                };
                warn!("Skipping {} #{} during import: {}", kind, position, reason);
                failed.push(ImportFailure {
                    kind,
                    position,
                    reason,
                });
            }
        }
    }
    records
}

fn malformed(e: serde_json::Error) -> StoreError {
    StoreError::Import {
        message: e.to_string(),
    }
}

impl RecordStore {
    pub async fn export_document(&self) -> Result<ExportDocument> {
        let (notes, todos) = tokio::try_join!(self.get_all_notes(), self.get_all_todos())?;
        info!("Exporting {} notes and {} todos", notes.len(), todos.len());
        Ok(ExportDocument {
            version: EXPORT_FORMAT_VERSION,
            exported_at: Utc::now(),
            notes,
            todos,
        })
    }

    pub async fn export_json(&self) -> Result<String> {
        let document = self.export_document().await?;
        serde_json::to_string_pretty(&document).map_err(|e| StoreError::Import {
            message: format!("cannot serialize export: {}", e),
        })
    }

    pub async fn export_to_file(&self, path: &Path) -> Result<()> {
        let json = self.export_json().await?;
        fs::write(path, json).map_err(|e| StoreError::Import {
            message: format!("cannot write {}: {}", path.display(), e),
        })?;
        info!("Export written to {}", path.display());
        Ok(())
    }

    /// Imports every well-formed record of `json` as a new record with a
    /// fresh id. Malformed records are skipped and listed in the summary.
    pub async fn import_json(&self, json: &str) -> Result<ImportSummary> {
        let value: Value = serde_json::from_str(json).map_err(malformed)?;
        let Value::Object(doc) = value else {
            return Err(StoreError::Import {
                message: "document must be a JSON object".to_string(),
            });
        };

        let note_items = records_under(&doc, "notes")?;
        let todo_items = records_under(&doc, "todos")?;
        debug!(
            "Import document holds {} notes and {} todos",
            note_items.len(),
            todo_items.len()
        );

        let now = now_millis();
        let mut failed = Vec::new();

        let notes = collect_records(note_items, RecordKind::Note, &mut failed, |item| {
            let imported: ImportedNote = serde_json::from_value(item).map_err(malformed)?;
            Ok(imported.into_note(uuid::Uuid::new_v4().to_string(), now))
        });
        let todos = collect_records(todo_items, RecordKind::Todo, &mut failed, |item| {
            let imported: ImportedTodo = serde_json::from_value(item).map_err(malformed)?;
            imported.into_todo(uuid::Uuid::new_v4().to_string(), now)
        });

        let notes_imported = self.add_all(notes).await?;
        let todos_imported = self.add_all(todos).await?;

        let summary = ImportSummary {
            notes_imported,
            todos_imported,
            failed,
        };
        info!(
            "Imported {} notes and {} todos ({} skipped)",
            summary.notes_imported,
            summary.todos_imported,
            summary.failed.len()
        );
        Ok(summary)
    }

    pub async fn import_from_file(&self, path: &Path) -> Result<ImportSummary> {
        let json = fs::read_to_string(path).map_err(|e| StoreError::Import {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        self.import_json(&json).await
    }
}
