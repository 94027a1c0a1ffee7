//! Local notes and todos library
//!
//! This library provides an embedded record store for notes and todos with
//! secondary indexes, substring search, versioned schemas, JSON import and
//! export, and a reactive snapshot layer for front ends.

mod cli;
mod config;
mod context;
mod engine;
mod errors;
mod helper;
mod note;
pub mod schema;
mod storage;
mod todo;
mod transfer;
mod types;

// Re-export key components
pub use cli::*;
pub use config::*;
pub use context::*;
pub use engine::{Connection, LockMeta};
pub use errors::*;
pub use helper::*;
pub use note::*;
pub use storage::*;
pub use todo::*;
pub use transfer::*;
pub use types::*;

use log::info;

/// Initializes env_logger, defaulting to `info` (or `debug` when verbose).
/// `RUST_LOG` still takes precedence.
pub fn initialize_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .format_module_path(true)
        .init();

    info!("Logger initialized");
}
