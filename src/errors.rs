//! Error types for the noteflow record store.
//!
//! Every failure surfaced by the store names the kind of failure and, for
//! storage faults, the transaction step that failed.

use std::{fmt, io};

use thiserror::Error;

use crate::{RecordKind, TxStep};

/// The main error type for the noteflow store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The underlying storage could not be opened or upgraded.
    #[error("Cannot access local storage: {message}")]
    Initialization { message: String },

    /// An update referenced an id that is not in the collection.
    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },

    /// A transaction failed while in flight. Nothing it staged was persisted.
    #[error("Storage failure during {step}: {message}")]
    Storage { step: TxStep, message: String },

    /// Malformed input rejected before persistence.
    #[error("Invalid {kind}: {message}")]
    Validation { kind: RecordKind, message: String },

    /// Errors related to configuration.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The import document as a whole could not be read.
    #[error("Import failed: {message}")]
    Import { message: String },
}

impl StoreError {
    pub fn storage(step: TxStep, err: impl fmt::Display) -> Self {
        StoreError::Storage {
            step,
            message: err.to_string(),
        }
    }

    pub fn initialization(err: impl fmt::Display) -> Self {
        StoreError::Initialization {
            message: err.to_string(),
        }
    }

    pub fn not_found(kind: RecordKind, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(kind: RecordKind, message: impl Into<String>) -> Self {
        StoreError::Validation {
            kind,
            message: message.into(),
        }
    }

    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Initialization { .. } | StoreError::Storage { .. }
        )
    }
}

/// Maps a raw I/O error at a given step. Used with `map_err`.
pub(crate) fn io_at(step: TxStep) -> impl Fn(io::Error) -> StoreError {
    move |e| StoreError::storage(step, e)
}
