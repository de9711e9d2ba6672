//! `promptflow sequence` — import, inspect, and validate sequences.

use std::path::Path;

use promptflow_core::definition::SequenceDefinition;
use promptflow_core::state::AppState;
use serde_json::json;

use super::{print_json, print_serialized};

/// Import a YAML sequence definition for `user_id`.
pub async fn import(state: &AppState, file: &str, user_id: &str) -> Result<(), String> {
    let definition = SequenceDefinition::from_file(Path::new(file)).map_err(|e| e.to_string())?;
    let sequence = definition.import(state, user_id).await.map_err(|e| e.to_string())?;
    let blocks = state
        .block_store
        .list_by_sequence(&sequence.id)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&json!({
        "sequence": sequence,
        "blocks": blocks,
    }));
    Ok(())
}

pub async fn list(state: &AppState, user_id: &str) -> Result<(), String> {
    let sequences = state
        .sequence_store
        .list_by_user(user_id)
        .await
        .map_err(|e| e.to_string())?;
    print_serialized(&sequences)
}

/// Show a sequence with its blocks and sequence-scoped variables.
pub async fn show(state: &AppState, sequence_id: &str, user_id: &str) -> Result<(), String> {
    let sequence = state
        .sequence_store
        .get_owned(sequence_id, user_id)
        .await
        .map_err(|e| e.to_string())?;
    let blocks = state
        .block_store
        .list_by_sequence(sequence_id)
        .await
        .map_err(|e| e.to_string())?;
    let variables = state
        .variable_store
        .list_by_sequence(sequence_id)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&json!({
        "sequence": sequence,
        "blocks": blocks,
        "variables": variables,
    }));
    Ok(())
}

/// Check a definition file without importing it.
pub async fn validate(file: &str) -> Result<(), String> {
    let definition = SequenceDefinition::from_file(Path::new(file)).map_err(|e| e.to_string())?;
    let warnings = definition.validate().map_err(|e| e.to_string())?;
    print_json(&json!({
        "valid": true,
        "name": definition.name,
        "blocks": definition.blocks.len(),
        "warnings": warnings,
    }));
    Ok(())
}
