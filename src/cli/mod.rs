//! Command line front end over the record store.
mod app;
mod args;

pub use app::*;
pub use args::*;
