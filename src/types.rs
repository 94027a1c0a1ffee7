//! Shared data structures for the noteflow store.
//!
//! This module contains the small types used across the engine, the access
//! layer and the command line front end.
use std::{fmt, path::PathBuf};

use clap::Subcommand;
use serde::{Deserialize, Serialize};

use crate::{Priority, StoreError};

/// A specialized Result type for noteflow operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The two record collections held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Note,
    Todo,
}

impl RecordKind {
    /// Name of the object store holding this kind of record.
    pub fn store_name(self) -> &'static str {
        match self {
            RecordKind::Note => "notes",
            RecordKind::Todo => "todos",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Note => f.write_str("note"),
            RecordKind::Todo => f.write_str("todo"),
        }
    }
}

/// The step of a transaction or of connection setup at which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxStep {
    Open,
    Upgrade,
    Read,
    Write,
    Commit,
    Abort,
}

impl fmt::Display for TxStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxStep::Open => "open",
            TxStep::Upgrade => "upgrade",
            TxStep::Read => "read",
            TxStep::Write => "write",
            TxStep::Commit => "commit",
            TxStep::Abort => "abort",
        };
        f.write_str(name)
    }
}

/// Whether a transaction may stage writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Lifecycle of the store connection, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Opening,
    /// Another holder has the database open; the opener keeps waiting.
    Blocked,
    SchemaUpgrade { from: u32, to: u32 },
    Ready,
    Failed(StoreError),
}

/// One record that could not be imported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFailure {
    pub kind: RecordKind,
    /// Position of the record in its array in the source document
    pub position: usize,
    pub reason: String,
}

/// Summary of an import operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub notes_imported: usize,
    pub todos_imported: usize,
    pub failed: Vec<ImportFailure>,
}

impl ImportSummary {
    pub fn total_imported(&self) -> usize {
        self.notes_imported + self.todos_imported
    }
}

/// Available subcommands for the noteflow application
#[derive(Subcommand)]
pub enum Commands {
    /// Work with notes
    Note {
        #[clap(subcommand)]
        command: NoteCommand,
    },

    /// Work with todos
    Todo {
        #[clap(subcommand)]
        command: TodoCommand,
    },

    /// Export all notes and todos as a JSON document
    Export {
        /// Output file (defaults to stdout)
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Import notes and todos from a JSON document
    Import {
        /// Path to the JSON document
        source: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum NoteCommand {
    /// Create a new note
    Add {
        /// Title of the note
        #[clap(short = 'T', long, default_value = "")]
        title: String,

        /// Content of the note
        #[clap(short, long, default_value = "")]
        content: String,

        /// Tags to associate with the note (comma-separated)
        #[clap(short, long)]
        tags: Option<String>,

        /// Color label
        #[clap(long)]
        color: Option<String>,
    },

    /// List notes, optionally filtered by tag or color
    List {
        #[clap(short, long)]
        tag: Option<String>,

        #[clap(long)]
        color: Option<String>,

        /// Only show the N most recently updated notes
        #[clap(short = 'n', long)]
        recent: Option<usize>,

        #[clap(short, long)]
        json: bool,
    },

    /// Search notes by title, content or tag
    Search {
        query: String,

        #[clap(short, long)]
        json: bool,
    },

    /// Show a single note
    Show {
        id: String,

        #[clap(short, long)]
        json: bool,
    },

    /// Update fields of an existing note
    Update {
        id: String,

        #[clap(short = 'T', long)]
        title: Option<String>,

        #[clap(short, long)]
        content: Option<String>,

        /// Replace the tags (comma-separated)
        #[clap(short, long)]
        tags: Option<String>,

        #[clap(long, conflicts_with = "clear_color")]
        color: Option<String>,

        /// Remove the color label
        #[clap(long)]
        clear_color: bool,
    },

    /// Add or remove tags on a note
    Tag {
        id: String,

        /// Tags to add (comma-separated)
        #[clap(short, long)]
        add: Option<String>,

        /// Tags to remove (comma-separated)
        #[clap(short, long)]
        remove: Option<String>,
    },

    /// Delete a note by ID
    Delete { id: String },
}

#[derive(Subcommand)]
pub enum TodoCommand {
    /// Create a new todo
    Add {
        #[clap(short = 'T', long)]
        title: String,

        #[clap(short, long)]
        description: Option<String>,

        #[clap(short, long, value_enum)]
        priority: Option<Priority>,

        /// Due date (YYYY-MM-DD, RFC 3339 or epoch milliseconds)
        #[clap(long)]
        due: Option<String>,

        #[clap(short, long)]
        tags: Option<String>,
    },

    /// List todos, optionally filtered
    List {
        #[clap(short, long, value_enum)]
        priority: Option<Priority>,

        /// Only todos carrying this tag
        #[clap(short, long)]
        tag: Option<String>,

        /// Only completed todos
        #[clap(long, conflicts_with = "pending")]
        completed: bool,

        /// Only todos not yet completed
        #[clap(long)]
        pending: bool,

        #[clap(short, long)]
        json: bool,
    },

    /// Search todos by title, description or tag
    Search {
        query: String,

        #[clap(short, long)]
        json: bool,
    },

    /// Update fields of an existing todo
    Update {
        id: String,

        #[clap(short = 'T', long)]
        title: Option<String>,

        #[clap(short, long)]
        description: Option<String>,

        #[clap(short, long, value_enum)]
        priority: Option<Priority>,

        #[clap(long)]
        due: Option<String>,

        #[clap(short, long)]
        tags: Option<String>,
    },

    /// Mark a todo as completed
    Done {
        id: String,

        /// Mark as not completed instead
        #[clap(long)]
        undo: bool,
    },

    /// List todos due before a date
    Due {
        /// Cut-off (YYYY-MM-DD, RFC 3339 or epoch milliseconds)
        before: String,

        #[clap(short, long)]
        json: bool,
    },

    /// Delete a todo by ID
    Delete { id: String },
}
