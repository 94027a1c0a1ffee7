//! CLI module for the noteflow application
//!
//! This module handles the command-line interface for interacting with the
//! record store.
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::info;

use crate::{
    parse_tags, parse_timestamp, Commands, NewNote, NewTodo, Note, NoteCommand, NotePatch,
    RecordKind, RecordStore, Result, StoreError, Todo, TodoCommand, TodoPatch,
};

/// CLI Application handler - processes CLI commands against the record store
pub struct App {
    store: RecordStore,
}

impl App {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    /// Run the CLI application with the given command
    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Note { command } => self.run_note(command).await,
            Commands::Todo { command } => self.run_todo(command).await,
            Commands::Export { output } => self.handle_export(output).await,
            Commands::Import { source } => self.handle_import(source).await,
        }
    }

    async fn run_note(&self, command: NoteCommand) -> Result<()> {
        match command {
            NoteCommand::Add {
                title,
                content,
                tags,
                color,
            } => {
                let draft = NewNote {
                    title,
                    content,
                    tags: parse_tags(tags),
                    color,
                };
                let note = self.store.add_note(draft).await?;
                println!("Note created with ID: {}", note.id);
            }

            NoteCommand::List {
                tag,
                color,
                recent,
                json,
            } => {
                let notes = match (tag, color, recent) {
                    (Some(tag), _, _) => self.store.get_notes_by_tag(&tag).await?,
                    (None, Some(color), _) => self.store.get_notes_by_color(&color).await?,
                    (None, None, Some(limit)) => self.store.get_recent_notes(limit).await?,
                    (None, None, None) => sorted_notes(self.store.get_all_notes().await?),
                };
                self.display_notes(&notes, json)?;
            }

            NoteCommand::Search { query, json } => {
                let notes = sorted_notes(self.store.search_notes(&query).await?);
                self.display_notes(&notes, json)?;
            }

            NoteCommand::Show { id, json } => match self.store.get_note(&id).await? {
                Some(note) => self.display_notes(std::slice::from_ref(&note), json)?,
                None => return Err(StoreError::not_found(RecordKind::Note, id)),
            },

            NoteCommand::Update {
                id,
                title,
                content,
                tags,
                color,
                clear_color,
            } => {
                let patch = NotePatch {
                    title,
                    content,
                    tags: tags.map(|t| parse_tags(Some(t))),
                    color: if clear_color { Some(None) } else { color.map(Some) },
                };
                if patch.is_empty() {
                    println!("Nothing to update.");
                    return Ok(());
                }
                let note = self.store.update_note(&id, patch).await?;
                println!("Note {} updated", note.id);
            }

            NoteCommand::Tag { id, add, remove } => {
                let note = self
                    .store
                    .get_note(&id)
                    .await?
                    .ok_or_else(|| StoreError::not_found(RecordKind::Note, &id))?;

                let to_remove = parse_tags(remove);
                let mut tags: Vec<String> = note
                    .tags
                    .into_iter()
                    .filter(|t| !to_remove.iter().any(|r| r.eq_ignore_ascii_case(t)))
                    .collect();
                tags.extend(parse_tags(add));

                let patch = NotePatch {
                    tags: Some(tags),
                    ..Default::default()
                };
                let note = self.store.update_note(&id, patch).await?;
                println!("Tags: {}", format_tags(&note.tags));
            }

            NoteCommand::Delete { id } => {
                self.store.delete_note(&id).await?;
                println!("Note {} deleted", id);
            }
        }
        Ok(())
    }

    async fn run_todo(&self, command: TodoCommand) -> Result<()> {
        match command {
            TodoCommand::Add {
                title,
                description,
                priority,
                due,
                tags,
            } => {
                let draft = NewTodo {
                    title,
                    description,
                    completed: false,
                    priority,
                    due_date: due.as_deref().map(parse_due).transpose()?,
                    tags: parse_tags(tags),
                };
                let todo = self.store.add_todo(draft).await?;
                println!("Todo created with ID: {}", todo.id);
            }

            TodoCommand::List {
                priority,
                tag,
                completed,
                pending,
                json,
            } => {
                let todos = match (priority, tag.as_deref()) {
                    (Some(priority), _) => self.store.get_todos_by_priority(priority).await?,
                    (None, Some(tag)) => self.store.get_todos_by_tag(tag).await?,
                    (None, None) if completed => self.store.get_completed_todos().await?,
                    (None, None) if pending => self.store.get_pending_todos().await?,
                    (None, None) => self.store.get_all_todos().await?,
                };
                let status = match (completed, pending) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                };
                let todos = filter_todos(todos, tag.as_deref(), status);
                self.display_todos(&sorted_todos(todos), json)?;
            }

            TodoCommand::Search { query, json } => {
                let todos = sorted_todos(self.store.search_todos(&query).await?);
                self.display_todos(&todos, json)?;
            }

            TodoCommand::Update {
                id,
                title,
                description,
                priority,
                due,
                tags,
            } => {
                let patch = TodoPatch {
                    title,
                    description: description.map(Some),
                    completed: None,
                    priority: priority.map(Some),
                    due_date: due.as_deref().map(parse_due).transpose()?.map(Some),
                    tags: tags.map(|t| parse_tags(Some(t))),
                };
                if patch.is_empty() {
                    println!("Nothing to update.");
                    return Ok(());
                }
                let todo = self.store.update_todo(&id, patch).await?;
                println!("Todo {} updated", todo.id);
            }

            TodoCommand::Done { id, undo } => {
                let todo = self
                    .store
                    .update_todo(&id, TodoPatch::completed(!undo))
                    .await?;
                let state = if todo.completed { "completed" } else { "open" };
                println!("Todo {} marked {}", todo.id, state);
            }

            TodoCommand::Due { before, json } => {
                let cutoff = parse_due(&before)?;
                let todos = self.store.get_todos_due_before(cutoff).await?;
                self.display_todos(&todos, json)?;
            }

            TodoCommand::Delete { id } => {
                self.store.delete_todo(&id).await?;
                println!("Todo {} deleted", id);
            }
        }
        Ok(())
    }

    async fn handle_export(&self, output: Option<PathBuf>) -> Result<()> {
        match output {
            Some(path) => {
                self.store.export_to_file(&path).await?;
                println!("Exported to {}", path.display());
            }
            None => println!("{}", self.store.export_json().await?),
        }
        Ok(())
    }

    async fn handle_import(&self, source: PathBuf) -> Result<()> {
        info!("Importing from {}", source.display());
        let summary = self.store.import_from_file(&source).await?;
        println!(
            "Imported {} notes and {} todos",
            summary.notes_imported, summary.todos_imported
        );
        for failure in &summary.failed {
            println!(
                "  skipped {} #{}: {}",
                failure.kind,
                failure.position,
                console::style(&failure.reason).yellow()
            );
        }
        Ok(())
    }

    /// Display notes in the requested format
    fn display_notes(&self, notes: &[Note], json: bool) -> Result<()> {
        if json {
            println!("{}", to_json(notes)?);
            return Ok(());
        }
        if notes.is_empty() {
            println!("No notes found matching the criteria.");
            return Ok(());
        }

        let width = separator_width();
        for (i, note) in notes.iter().enumerate() {
            if i > 0 {
                println!("{}", "-".repeat(width));
            }
            println!(
                "ID: {} | Updated: {}",
                note.id,
                note.updated_at.format("%Y-%m-%d %H:%M")
            );
            println!("Title: {}", console::style(&note.title).bold());
            if !note.tags.is_empty() {
                println!("Tags: {}", console::style(format_tags(&note.tags)).cyan());
            }
            if let Some(color) = &note.color {
                println!("Color: {}", color);
            }
            let preview = content_preview(&note.content, 100);
            if !preview.is_empty() {
                println!("\n{}", preview);
            }
        }

        println!(
            "\nFound {} note{}",
            notes.len(),
            if notes.len() == 1 { "" } else { "s" }
        );
        Ok(())
    }

    fn display_todos(&self, todos: &[Todo], json: bool) -> Result<()> {
        if json {
            println!("{}", to_json(todos)?);
            return Ok(());
        }
        if todos.is_empty() {
            println!("No todos found matching the criteria.");
            return Ok(());
        }

        for todo in todos {
            let check = if todo.completed { "[x]" } else { "[ ]" };
            let title = if todo.completed {
                console::style(&todo.title).dim()
            } else {
                console::style(&todo.title).bold()
            };
            print!("{} {} {}", check, title, console::style(&todo.id).dim());
            if let Some(priority) = todo.priority {
                print!(" ({})", priority);
            }
            if let Some(due) = todo.due_date {
                print!(" due {}", due.format("%Y-%m-%d"));
            }
            println!();
            if let Some(description) = &todo.description {
                println!("    {}", content_preview(description, 100));
            }
            if !todo.tags.is_empty() {
                println!("    {}", console::style(format_tags(&todo.tags)).cyan());
            }
        }

        println!(
            "\nFound {} todo{}",
            todos.len(),
            if todos.len() == 1 { "" } else { "s" }
        );
        Ok(())
    }
}

fn parse_due(raw: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(raw).ok_or_else(|| {
        StoreError::validation(
            RecordKind::Todo,
            format!("unrecognised date '{}' (use YYYY-MM-DD or RFC 3339)", raw),
        )
    })
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| StoreError::Storage {
        step: crate::TxStep::Read,
        message: e.to_string(),
    })
}

fn sorted_notes(mut notes: Vec<Note>) -> Vec<Note> {
    notes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    notes
}

/// Applies the tag and completion filters that the chosen index lookup did not.
fn filter_todos(todos: Vec<Todo>, tag: Option<&str>, completed: Option<bool>) -> Vec<Todo> {
    let tag = tag.map(|t| t.trim().to_lowercase());
    todos
        .into_iter()
        .filter(|todo| completed.map_or(true, |c| todo.completed == c))
        .filter(|todo| match &tag {
            Some(tag) => todo.tags.iter().any(|t| t.to_lowercase() == *tag),
            None => true,
        })
        .collect()
}

fn sorted_todos(mut todos: Vec<Todo>) -> Vec<Todo> {
    todos.sort_by(|a, b| {
        a.completed
            .cmp(&b.completed)
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    todos
}

fn format_tags(tags: &[String]) -> String {
    tags.iter()
        .map(|tag| format!("#{}", tag))
        .collect::<Vec<_>>()
        .join(" ")
}

fn separator_width() -> usize {
    terminal_size::terminal_size()
        .map(|(w, _)| w.0 as usize)
        .unwrap_or(80)
        .min(50)
}

/// First non-empty line, cut to `max_len` characters.
fn content_preview(content: &str, max_len: usize) -> String {
    let first_line = content
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("");

    if first_line.chars().count() <= max_len {
        first_line.to_string()
    } else {
        let cut: String = first_line.chars().take(max_len).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{now_millis, Priority};

    #[test]
    fn preview_cuts_on_char_boundaries() {
        assert_eq!(content_preview("\n\nhello\nworld", 10), "hello");
        assert_eq!(content_preview("ééééé", 3), "ééé...");
    }

    #[test]
    fn todos_sort_open_first_then_by_priority() {
        let now = now_millis();
        let make = |title: &str, priority, completed| {
            let mut draft = NewTodo::new(title);
            draft.priority = priority;
            draft.completed = completed;
            Todo::create(title.to_string(), draft, now)
        };
        let sorted = sorted_todos(vec![
            make("done", Some(Priority::High), true),
            make("low", Some(Priority::Low), false),
            make("high", Some(Priority::High), false),
            make("none", None, false),
        ]);
        let titles: Vec<&str> = sorted.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["high", "low", "none", "done"]);
    }

    #[tokio::test]
    async fn todo_list_filters_by_tag_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(crate::Config::with_data_dir(dir.path()));
        let rent = store
            .add_todo(
                NewTodo::new("rent")
                    .with_tags(["Home"])
                    .with_priority(Priority::High),
            )
            .await
            .unwrap();
        store
            .add_todo(NewTodo::new("report").with_tags(["work"]))
            .await
            .unwrap();
        let dishes = store
            .add_todo(NewTodo::new("dishes").with_tags(["home"]))
            .await
            .unwrap();
        store
            .update_todo(&dishes.id, TodoPatch::completed(true))
            .await
            .unwrap();

        let home = store.get_todos_by_tag("HOME").await.unwrap();
        assert_eq!(home.len(), 2);

        let open_home = filter_todos(home, Some("home"), Some(false));
        assert_eq!(open_home.len(), 1);
        assert_eq!(open_home[0].id, rent.id);

        let high = store.get_todos_by_priority(Priority::High).await.unwrap();
        assert_eq!(filter_todos(high.clone(), Some("work"), None).len(), 0);
        assert_eq!(filter_todos(high, Some(" Home "), None).len(), 1);
    }

    #[test]
    fn bad_due_dates_are_validation_errors() {
        assert!(matches!(
            parse_due("someday"),
            Err(StoreError::Validation { .. })
        ));
        assert!(parse_due("2030-01-01").is_ok());
    }
}
