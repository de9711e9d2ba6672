//! `promptflow run` — start, inspect, rerun, and correct runs.

use promptflow_core::engine::OutputEdit;
use promptflow_core::models::run::RunStatus;
use promptflow_core::SequenceOrchestrator;
use serde_json::{Map, Value};

use super::print_serialized;

/// Run a sequence end to end and print the run detail. A run that ends
/// `failed` is printed and then reported as an error.
pub async fn start(
    orchestrator: &SequenceOrchestrator,
    sequence_id: &str,
    user_id: &str,
    overrides: Option<Map<String, Value>>,
    model: Option<String>,
) -> Result<(), String> {
    let detail = orchestrator
        .start_run(sequence_id, user_id, overrides, model)
        .await
        .map_err(|e| e.to_string())?;
    print_serialized(&detail)?;
    finished(detail.run.status, detail.run.error_message.as_deref())
}

pub async fn show(
    orchestrator: &SequenceOrchestrator,
    run_id: &str,
    user_id: &str,
) -> Result<(), String> {
    let state = orchestrator.state();
    state
        .run_store
        .get_owned(run_id, user_id)
        .await
        .map_err(|e| e.to_string())?;
    let detail = state
        .run_store
        .get_detail(run_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Run '{}' not found", run_id))?;
    print_serialized(&detail)
}

/// List a sequence's runs, newest first.
pub async fn list(
    orchestrator: &SequenceOrchestrator,
    sequence_id: &str,
    user_id: &str,
) -> Result<(), String> {
    let state = orchestrator.state();
    state
        .sequence_store
        .get_owned(sequence_id, user_id)
        .await
        .map_err(|e| e.to_string())?;
    let runs = state
        .run_store
        .list_by_sequence(sequence_id)
        .await
        .map_err(|e| e.to_string())?;
    print_serialized(&runs)
}

pub async fn rerun(
    orchestrator: &SequenceOrchestrator,
    run_id: &str,
    block_id: &str,
    user_id: &str,
    overrides: Option<Map<String, Value>>,
) -> Result<(), String> {
    let detail = orchestrator
        .rerun_from_block(run_id, block_id, user_id, overrides)
        .await
        .map_err(|e| e.to_string())?;
    print_serialized(&detail)?;
    finished(detail.run.status, detail.run.error_message.as_deref())
}

/// Replace one block run's output. `kind` is one of `named`, `raw_text`,
/// `list`, or `matrix`; every kind but `raw_text` takes a JSON value.
pub async fn edit_output(
    orchestrator: &SequenceOrchestrator,
    run_id: &str,
    block_run_id: &str,
    user_id: &str,
    kind: &str,
    value: &str,
) -> Result<(), String> {
    let edit = parse_edit(kind, value)?;
    let block_run = orchestrator
        .edit_block_output(run_id, block_run_id, user_id, edit)
        .await
        .map_err(|e| e.to_string())?;
    print_serialized(&block_run)
}

/// Build an [`OutputEdit`] from a CLI kind and value.
pub fn parse_edit(kind: &str, value: &str) -> Result<OutputEdit, String> {
    let value = if kind == "raw_text" {
        Value::String(value.to_string())
    } else {
        serde_json::from_str(value).map_err(|e| format!("Invalid JSON for '{}' edit: {}", kind, e))?
    };
    serde_json::from_value(serde_json::json!({ "kind": kind, "value": value }))
        .map_err(|e| format!("Invalid output edit: {}", e))
}

fn finished(status: RunStatus, error: Option<&str>) -> Result<(), String> {
    match status {
        RunStatus::Failed => Err(error.unwrap_or("Run failed").to_string()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_edit_kinds() {
        assert_eq!(
            parse_edit("raw_text", "not json").unwrap(),
            OutputEdit::RawText("not json".to_string())
        );
        assert_eq!(
            parse_edit("list", r#"["a", "b"]"#).unwrap(),
            OutputEdit::List(vec![json!("a"), json!("b")])
        );
        match parse_edit("named", r#"{"title": "T"}"#).unwrap() {
            OutputEdit::Named(map) => assert_eq!(map.get("title"), Some(&json!("T"))),
            other => panic!("unexpected edit {:?}", other),
        }
    }

    #[test]
    fn test_parse_edit_rejects_bad_input() {
        assert!(parse_edit("list", "not json").is_err());
        assert!(parse_edit("matrix", r#"["flat"]"#).is_err());
        assert!(parse_edit("table", "[]").is_err());
    }
}
