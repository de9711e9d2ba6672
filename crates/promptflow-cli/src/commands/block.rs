//! `promptflow block` — execute a single block outside a full run.

use promptflow_core::models::run::RunStatus;
use promptflow_core::SequenceOrchestrator;
use serde_json::{Map, Value};

use super::print_serialized;

/// Execute one block against a fresh context and print its block run.
pub async fn exec(
    orchestrator: &SequenceOrchestrator,
    sequence_id: &str,
    block_id: &str,
    user_id: &str,
    overrides: Option<Map<String, Value>>,
) -> Result<(), String> {
    let block_run = orchestrator
        .execute_single_block(sequence_id, block_id, user_id, overrides)
        .await
        .map_err(|e| e.to_string())?;
    print_serialized(&block_run)?;
    if block_run.status == RunStatus::Failed {
        return Err(block_run
            .error_message
            .unwrap_or_else(|| format!("Block '{}' failed", block_run.block_name_snapshot)));
    }
    Ok(())
}
