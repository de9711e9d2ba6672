//! Shared state handed to the engine and the CLI commands.

use std::sync::Arc;

use crate::db::Database;
use crate::store::{BlockStore, GlobalListStore, RunStore, SequenceStore, VariableStore};

/// Every store, bound to one database.
pub struct AppStateInner {
    pub db: Database,
    pub sequence_store: SequenceStore,
    pub variable_store: VariableStore,
    pub global_list_store: GlobalListStore,
    pub block_store: BlockStore,
    pub run_store: RunStore,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(db: Database) -> Self {
        Self {
            sequence_store: SequenceStore::new(db.clone()),
            variable_store: VariableStore::new(db.clone()),
            global_list_store: GlobalListStore::new(db.clone()),
            block_store: BlockStore::new(db.clone()),
            run_store: RunStore::new(db.clone()),
            db,
        }
    }
}
