pub mod block_store;
pub mod global_list_store;
pub mod run_store;
pub mod sequence_store;
pub mod variable_store;

pub use block_store::BlockStore;
pub use global_list_store::GlobalListStore;
pub use run_store::RunStore;
pub use sequence_store::SequenceStore;
pub use variable_store::VariableStore;

use chrono::{DateTime, TimeZone, Utc};

/// Convert a stored epoch-millis column to a timestamp.
pub(crate) fn to_dt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|v| Utc.timestamp_millis_opt(v).single())
}
