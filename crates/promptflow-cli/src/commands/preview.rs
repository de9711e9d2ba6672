//! `promptflow preview` — show a block's prompt as a run would render it.

use promptflow_core::SequenceOrchestrator;
use serde_json::{Map, Value};

use super::print_serialized;

pub async fn run(
    orchestrator: &SequenceOrchestrator,
    sequence_id: &str,
    block_id: &str,
    user_id: &str,
    overrides: Option<Map<String, Value>>,
) -> Result<(), String> {
    let preview = orchestrator
        .preview_prompt(sequence_id, block_id, user_id, overrides.as_ref())
        .await
        .map_err(|e| e.to_string())?;
    print_serialized(&preview)
}
