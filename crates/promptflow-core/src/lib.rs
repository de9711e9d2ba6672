//! Promptflow Core — sequences of LLM prompt blocks and the engine that runs them.
//!
//! This crate holds the data model, the SQLite stores, configuration, and the
//! execution engine. It has no front end of its own; `promptflow-cli` drives it
//! from the command line, and anything else can do the same through
//! [`SequenceOrchestrator`].

pub mod config;
pub mod db;
pub mod definition;
pub mod engine;
pub mod error;
pub mod models;
pub mod state;
pub mod store;

// Convenience re-exports
pub use config::EngineConfig;
pub use db::Database;
pub use engine::SequenceOrchestrator;
pub use error::{BlockError, CoreError};
pub use state::{AppState, AppStateInner};
