//! The Note record, its creation draft and its partial update.
use chrono::{serde::ts_milliseconds, DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    contains_folded,
    engine::{Connection, ObjectStore},
    normalize_tags,
    schema::{self, IndexKey, Record},
    RecordKind,
};

/// Represents a single note in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    /// Unique identifier, assigned by the store
    pub id: String,
    pub title: String,
    pub content: String,
    /// Tags for organization
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form color label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// When the note was created
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Last modification time
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

/// Fields a caller supplies to create a note. The store assigns the id and
/// both timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewNote {
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub color: Option<String>,
}

impl NewNote {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }
}

/// A partial update. `None` leaves the field as it is; `color: Some(None)`
/// clears the label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotePatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub color: Option<Option<String>>,
}

impl NotePatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &NotePatch::default()
    }
}

impl Note {
    pub(crate) fn create(id: String, draft: NewNote, now: DateTime<Utc>) -> Self {
        Self::restore(id, draft, now, now)
    }

    /// Builds a note carrying timestamps from elsewhere, e.g. an import.
    pub(crate) fn restore(
        id: String,
        draft: NewNote,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Note {
            id,
            title: draft.title,
            content: draft.content,
            tags: normalize_tags(draft.tags),
            color: draft.color,
            created_at,
            updated_at: updated_at.max(created_at),
        }
    }

    /// Applies `patch` field by field. `id` and `created_at` come from `self`.
    pub(crate) fn merged(&self, patch: NotePatch, updated_at: DateTime<Utc>) -> Note {
        let NotePatch {
            title,
            content,
            tags,
            color,
        } = patch;

        Note {
            id: self.id.clone(),
            title: title.unwrap_or_else(|| self.title.clone()),
            content: content.unwrap_or_else(|| self.content.clone()),
            tags: tags.map(normalize_tags).unwrap_or_else(|| self.tags.clone()),
            color: color.unwrap_or_else(|| self.color.clone()),
            created_at: self.created_at,
            updated_at,
        }
    }

    /// Whether the title, content or any tag contains `needle`, which must be lowercase.
    pub fn matches_query(&self, needle: &str) -> bool {
        contains_folded(&self.title, needle)
            || contains_folded(&self.content, needle)
            || self.tags.iter().any(|t| contains_folded(t, needle))
    }
}

impl Record for Note {
    const KIND: RecordKind = RecordKind::Note;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_keys(&self, index: &str) -> Vec<IndexKey> {
        match index {
            schema::IDX_CREATED_AT => vec![IndexKey::Time(self.created_at.timestamp_millis())],
            schema::IDX_UPDATED_AT => vec![IndexKey::Time(self.updated_at.timestamp_millis())],
            schema::IDX_TITLE => vec![IndexKey::Text(self.title.clone())],
            schema::IDX_TAGS => IndexKey::tags(&self.tags),
            schema::IDX_COLOR => self
                .color
                .iter()
                .map(|c| IndexKey::Text(c.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn object_store(conn: &Connection) -> &Mutex<ObjectStore<Self>> {
        &conn.notes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_millis;
    use chrono::Duration;

    fn sample() -> Note {
        let draft = NewNote::new("Grocery", "milk, eggs")
            .with_tags(["shopping", " home ", "shopping"])
            .with_color("yellow");
        Note::create("n1".to_string(), draft, now_millis())
    }

    #[test]
    fn create_sets_equal_timestamps_and_normalizes_tags() {
        let note = sample();
        assert_eq!(note.created_at, note.updated_at);
        assert_eq!(note.tags, vec!["shopping".to_string(), "home".to_string()]);
    }

    #[test]
    fn merge_only_touches_supplied_fields() {
        let note = sample();
        let later = note.updated_at + Duration::milliseconds(5);
        let merged = note.merged(NotePatch::title("Errands"), later);

        assert_eq!(merged.title, "Errands");
        assert_eq!(merged.content, note.content);
        assert_eq!(merged.tags, note.tags);
        assert_eq!(merged.color, note.color);
        assert_eq!(merged.created_at, note.created_at);
        assert_eq!(merged.updated_at, later);
    }

    #[test]
    fn merge_can_clear_color() {
        let note = sample();
        let patch = NotePatch {
            color: Some(None),
            ..Default::default()
        };
        assert_eq!(note.merged(patch, note.updated_at).color, None);
    }

    #[test]
    fn query_matches_title_content_and_tags() {
        let note = sample();
        assert!(note.matches_query("milk"));
        assert!(note.matches_query("groc"));
        assert!(note.matches_query("shop"));
        assert!(note.matches_query(""));
        assert!(!note.matches_query("bread"));
    }

    #[test]
    fn missing_color_is_absent_from_color_index() {
        let mut note = sample();
        note.color = None;
        assert!(note.index_keys(schema::IDX_COLOR).is_empty());
        assert_eq!(note.index_keys(schema::IDX_TAGS).len(), 2);
    }

    #[test]
    fn serializes_camel_case_with_millisecond_timestamps() {
        let note = sample();
        let value = serde_json::to_value(&note).unwrap();
        assert_eq!(
            value["createdAt"].as_i64(),
            Some(note.created_at.timestamp_millis())
        );
        let back: Note = serde_json::from_value(value).unwrap();
        assert_eq!(back, note);
    }
}
