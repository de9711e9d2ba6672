//! Rerun Coordinator — continue a past run from a chosen block, and edit
//! recorded block outputs in place.
//!
//! A rerun never touches the original run. The continuation context is a
//! left fold over the original overrides, the outputs of the block runs
//! before the chosen block, and the caller's new overrides.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::engine::context::build_context;
use crate::engine::orchestrator::SequenceOrchestrator;
use crate::error::CoreError;
use crate::models::block::{BlockConfig, BlockType};
use crate::models::run::{BlockOutput, BlockRun, Run, RunDetail, RunStatus};

/// Replacement output for a recorded block run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OutputEdit {
    /// New named outputs for a standard or discretization block.
    Named(Map<String, Value>),
    /// New raw text. Named blocks store it under their output name; list
    /// and matrix blocks parse it as JSON.
    RawText(String),
    List(Vec<Value>),
    Matrix(Vec<Vec<Value>>),
}

/// Fold base overrides, historical outputs, and new overrides into one
/// mapping; later entries win.
pub fn fold_history(
    base: Option<&Map<String, Value>>,
    history: &[BlockRun],
    overrides: Option<&Map<String, Value>>,
) -> Map<String, Value> {
    let mut folded = base.cloned().unwrap_or_default();
    for block_run in history {
        if let Some(output) = &block_run.output {
            folded.extend(output.to_context_delta());
        }
    }
    if let Some(overrides) = overrides {
        folded.extend(overrides.clone());
    }
    folded
}

impl SequenceOrchestrator {
    /// Start a new run that replays the history of `run_id` up to
    /// `block_id` and executes from there to the end.
    pub async fn rerun_from_block(
        &self,
        run_id: &str,
        block_id: &str,
        user_id: &str,
        new_overrides: Option<Map<String, Value>>,
    ) -> Result<RunDetail, CoreError> {
        let original = self.state.run_store.get_owned(run_id, user_id).await?;
        let sequence = self
            .state
            .sequence_store
            .get_owned(&original.sequence_id, user_id)
            .await?;
        let (blocks, index) = self.locate_block(&sequence.id, block_id).await?;

        // History is the block runs of blocks before the restart point. A
        // rerun source holds only its later blocks; earlier outputs live in
        // its overrides.
        let positions: HashMap<&str, usize> = blocks
            .iter()
            .enumerate()
            .map(|(position, block)| (block.id.as_str(), position))
            .collect();
        let mut history: Vec<BlockRun> = self
            .state
            .run_store
            .list_block_runs(&original.id)
            .await?
            .into_iter()
            .filter(|br| {
                br.block_id
                    .as_deref()
                    .and_then(|id| positions.get(id))
                    .is_some_and(|&position| position < index)
            })
            .collect();
        let continuation = fold_history(
            original.input_overrides.as_ref(),
            &history,
            new_overrides.as_ref(),
        );

        let mut run = Run::new(
            Uuid::new_v4().to_string(),
            sequence.id.clone(),
            user_id.to_string(),
            Some(continuation),
            original.llm_model_override.clone(),
        );
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        self.state.run_store.save(&run).await?;
        tracing::info!(
            "[Rerun] Run {} continues run {} from block '{}' ({} historical block runs)",
            run.id,
            original.id,
            blocks[index].name,
            history.len()
        );

        let context = build_context(&self.state, &sequence.id, user_id, run.input_overrides.as_ref()).await;
        let outcome = match context {
            Ok(context) => {
                self.execute_blocks(&mut run, &sequence, &blocks[index..], context)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            tracing::error!("[Rerun] Run {} aborted: {}", run.id, e);
            self.mark_failed(&mut run, format!("Execution failed to start or complete: {}", e))
                .await?;
        }

        let mut detail = self.detail(&run.id).await?;
        history.append(&mut detail.block_runs);
        detail.block_runs = history;
        Ok(detail)
    }

    /// Overwrite one block run's output and rebuild its run's summary.
    pub async fn edit_block_output(
        &self,
        run_id: &str,
        block_run_id: &str,
        user_id: &str,
        edit: OutputEdit,
    ) -> Result<BlockRun, CoreError> {
        let mut run = self.state.run_store.get_owned(run_id, user_id).await?;
        let mut block_run = self
            .state
            .run_store
            .get_block_run(block_run_id)
            .await?
            .filter(|br| br.run_id == run.id)
            .ok_or_else(|| CoreError::NotFound(format!("Block run '{}' not found", block_run_id)))?;

        let block_type = BlockType::from_str(&block_run.block_type_snapshot).ok_or_else(|| {
            CoreError::BadRequest(format!(
                "Block type '{}' has no editable output",
                block_run.block_type_snapshot
            ))
        })?;
        let configured = self.configured_output_name(&block_run).await?;
        let (output, raw) = apply_edit(block_type, block_run.output.as_ref(), configured, edit)?;

        block_run.output = Some(output);
        block_run.raw_output = Some(raw);
        block_run.updated_at = Utc::now();
        self.state.run_store.save_block_run(&block_run).await?;

        let mut summary = Map::new();
        for br in self.state.run_store.list_block_runs(&run.id).await? {
            if let Some(output) = &br.output {
                summary.insert(br.summary_key(), Value::Object(output.to_context_delta()));
            }
        }
        run.results_summary = Some(summary);
        run.updated_at = Utc::now();
        self.state.run_store.save(&run).await?;

        tracing::info!(
            "[Rerun] Edited output of block run {} ('{}') in run {}",
            block_run.id,
            block_run.block_name_snapshot,
            run.id
        );
        Ok(block_run)
    }

    /// The first output name the originating block is configured with, if
    /// that block still exists and parses.
    async fn configured_output_name(&self, block_run: &BlockRun) -> Result<Option<String>, CoreError> {
        let Some(block_id) = &block_run.block_id else {
            return Ok(None);
        };
        let Some(block) = self.state.block_store.get(block_id).await? else {
            return Ok(None);
        };
        Ok(match block.parsed_config() {
            Ok(BlockConfig::Standard(c)) => Some(c.output_variable_name),
            Ok(BlockConfig::Discretization(c)) => c.output_names.into_iter().next(),
            Ok(BlockConfig::SingleList(c)) => Some(c.output_list_variable_name),
            Ok(BlockConfig::MultiList(c)) => Some(c.output_matrix_variable_name),
            Err(_) => None,
        })
    }
}

fn apply_edit(
    block_type: BlockType,
    current: Option<&BlockOutput>,
    configured: Option<String>,
    edit: OutputEdit,
) -> Result<(BlockOutput, String), CoreError> {
    let mismatch = |kind: &str| {
        CoreError::BadRequest(format!(
            "A {} edit does not apply to a {} block",
            kind, block_type
        ))
    };

    match (block_type, edit) {
        (BlockType::Standard | BlockType::Discretization, OutputEdit::Named(values)) => {
            let raw = values.values().map(text_of).collect::<Vec<_>>().join("\n");
            Ok((BlockOutput::Named { values }, raw))
        }
        (BlockType::Standard | BlockType::Discretization, OutputEdit::RawText(text)) => {
            let key = match current {
                Some(BlockOutput::Named { values }) => values.keys().next().cloned(),
                _ => None,
            }
            .or(configured)
            .unwrap_or_else(|| "output".to_string());
            let mut values = Map::new();
            values.insert(key, Value::String(text.clone()));
            Ok((BlockOutput::Named { values }, text))
        }
        (BlockType::SingleList, OutputEdit::List(values)) => {
            let name = list_name(current, configured, "processed_list");
            Ok(list_output(name, values))
        }
        (BlockType::SingleList, OutputEdit::RawText(text)) => {
            let values: Vec<Value> = serde_json::from_str(&text)
                .map_err(|e| CoreError::BadRequest(format!("List output must be a JSON array: {}", e)))?;
            let name = list_name(current, configured, "processed_list");
            Ok(list_output(name, values))
        }
        (BlockType::MultiList, OutputEdit::Matrix(values)) => {
            let name = list_name(current, configured, "comparison_matrix");
            Ok(matrix_output(name, values))
        }
        (BlockType::MultiList, OutputEdit::RawText(text)) => {
            let values: Vec<Vec<Value>> = serde_json::from_str(&text).map_err(|e| {
                CoreError::BadRequest(format!("Matrix output must be a JSON array of arrays: {}", e))
            })?;
            let name = list_name(current, configured, "comparison_matrix");
            Ok(matrix_output(name, values))
        }
        (_, OutputEdit::Named(_)) => Err(mismatch("named")),
        (_, OutputEdit::List(_)) => Err(mismatch("list")),
        (_, OutputEdit::Matrix(_)) => Err(mismatch("matrix")),
    }
}

fn list_name(current: Option<&BlockOutput>, configured: Option<String>, fallback: &str) -> String {
    match current {
        Some(BlockOutput::List { name, .. }) | Some(BlockOutput::Matrix { name, .. }) => name.clone(),
        _ => configured.unwrap_or_else(|| fallback.to_string()),
    }
}

fn list_output(name: String, values: Vec<Value>) -> (BlockOutput, String) {
    let raw = Value::Array(values.clone()).to_string();
    (BlockOutput::List { name, values }, raw)
}

fn matrix_output(name: String, values: Vec<Vec<Value>>) -> (BlockOutput, String) {
    let output = BlockOutput::Matrix { name, values };
    let raw = output
        .to_context_delta()
        .into_iter()
        .next()
        .map(|(_, v)| v.to_string())
        .unwrap_or_default();
    (output, raw)
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::executor::tests::ScriptedLlm;
    use crate::engine::orchestrator::tests::{add_block, setup};
    use crate::models::block::BlockType;
    use serde_json::json;
    use std::sync::Arc;

    fn standard(prompt: &str, output: &str) -> Value {
        json!({"prompt": prompt, "output_variable_name": output})
    }

    async fn three_block_run(llm: Arc<ScriptedLlm>) -> (SequenceOrchestrator, RunDetail, Vec<String>) {
        let orch = setup(llm).await;
        let mut ids = Vec::new();
        ids.push(add_block(&orch, 0, "A", BlockType::Standard, standard("a <<seed>>", "a")).await.id);
        ids.push(add_block(&orch, 1, "B", BlockType::Standard, standard("b {{ a }}", "b")).await.id);
        ids.push(add_block(&orch, 2, "C", BlockType::Standard, standard("c {{ b }} <<seed>>", "c")).await.id);
        let overrides = json!({"seed": "s"}).as_object().cloned();
        let detail = orch.start_run("s1", "u1", overrides, None).await.unwrap();
        assert_eq!(detail.run.status, RunStatus::Completed);
        (orch, detail, ids)
    }

    #[test]
    fn test_fold_history_precedence() {
        let mut first = BlockRun::start("1".into(), "r".into(), "b1".into(), "A".into(), "standard".into());
        first.output = Some(BlockOutput::Named {
            values: json!({"x": "from-history", "y": "kept"}).as_object().unwrap().clone(),
        });
        let mut second = BlockRun::start("2".into(), "r".into(), "b2".into(), "B".into(), "single_list".into());
        second.output = Some(BlockOutput::List {
            name: "items".into(),
            values: vec![json!(1)],
        });

        let base = json!({"x": "base", "z": "base"}).as_object().unwrap().clone();
        let overrides = json!({"y": "override"}).as_object().unwrap().clone();
        let folded = fold_history(Some(&base), &[first, second], Some(&overrides));

        assert_eq!(
            Value::Object(folded),
            json!({"x": "from-history", "z": "base", "y": "override", "items": [1]})
        );
    }

    #[tokio::test]
    async fn test_rerun_keeps_history_and_executes_the_rest() {
        let llm = Arc::new(ScriptedLlm::default());
        let (orch, original, ids) = three_block_run(llm.clone()).await;

        let rerun = orch
            .rerun_from_block(&original.run.id, &ids[2], "u1", None)
            .await
            .unwrap();

        assert_ne!(rerun.run.id, original.run.id);
        assert_eq!(rerun.run.status, RunStatus::Completed);
        assert_eq!(rerun.block_runs.len(), 3);
        for i in 0..2 {
            assert_eq!(rerun.block_runs[i].id, original.block_runs[i].id);
            assert_eq!(rerun.block_runs[i].run_id, original.run.id);
            assert_eq!(rerun.block_runs[i].output, original.block_runs[i].output);
        }
        assert_eq!(rerun.block_runs[2].run_id, rerun.run.id);
        assert_ne!(rerun.block_runs[2].id, original.block_runs[2].id);

        // Only block C ran again, against the replayed context.
        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 4);
        assert_eq!(prompts[3], "c out:b out:a s s");

        // The original run is untouched.
        let stored = orch.state.run_store.get_detail(&original.run.id).await.unwrap().unwrap();
        assert_eq!(stored.block_runs.len(), 3);
        assert_eq!(stored.run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_rerun_of_a_rerun_keeps_one_lineage() {
        let llm = Arc::new(ScriptedLlm::default());
        let (orch, original, ids) = three_block_run(llm.clone()).await;

        let first = orch
            .rerun_from_block(&original.run.id, &ids[2], "u1", None)
            .await
            .unwrap();
        let second = orch
            .rerun_from_block(&first.run.id, &ids[2], "u1", None)
            .await
            .unwrap();

        // The first rerun only recorded C, which is not before C.
        assert_eq!(second.run.status, RunStatus::Completed);
        assert_eq!(
            second.block_runs.iter().map(|br| br.block_name_snapshot.as_str()).collect::<Vec<_>>(),
            vec!["C"]
        );
        assert_eq!(second.block_runs[0].run_id, second.run.id);
        // A and B outputs still reach C through the carried overrides.
        assert_eq!(llm.prompts().last().unwrap(), "c out:b out:a s s");

        // Restarting from B keeps A from the original and drops everything after.
        let from_b = orch
            .rerun_from_block(&original.run.id, &ids[1], "u1", None)
            .await
            .unwrap();
        let names: Vec<_> = from_b.block_runs.iter().map(|br| br.block_name_snapshot.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(from_b.block_runs[0].id, original.block_runs[0].id);
    }

    #[tokio::test]
    async fn test_rerun_records_escaped_failure_on_the_new_run() {
        let (orch, original, ids) = three_block_run(Arc::new(ScriptedLlm::default())).await;
        orch.state
            .db
            .with_conn(|conn| conn.execute_batch("DROP TABLE variables;"))
            .unwrap();

        let rerun = orch
            .rerun_from_block(&original.run.id, &ids[2], "u1", None)
            .await
            .unwrap();

        assert_ne!(rerun.run.id, original.run.id);
        assert_eq!(rerun.run.status, RunStatus::Failed);
        assert!(rerun
            .run
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("Execution failed to start or complete: "));
        // History is still returned; nothing new executed.
        assert_eq!(rerun.block_runs.len(), 2);
        assert!(rerun.block_runs.iter().all(|br| br.run_id == original.run.id));
    }

    #[tokio::test]
    async fn test_rerun_uses_edits_and_new_overrides() {
        let llm = Arc::new(ScriptedLlm::default());
        let (orch, original, ids) = three_block_run(llm.clone()).await;

        orch.edit_block_output(
            &original.run.id,
            &original.block_runs[1].id,
            "u1",
            OutputEdit::RawText("edited b".into()),
        )
        .await
        .unwrap();

        let overrides = json!({"seed": "new"}).as_object().cloned();
        orch.rerun_from_block(&original.run.id, &ids[2], "u1", overrides)
            .await
            .unwrap();
        assert_eq!(llm.prompts().last().unwrap(), "c edited b new");
    }

    #[tokio::test]
    async fn test_rerun_rejects_foreign_block_and_user() {
        let (orch, original, _) = three_block_run(Arc::new(ScriptedLlm::default())).await;
        assert!(matches!(
            orch.rerun_from_block(&original.run.id, "missing", "u1", None).await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            orch.rerun_from_block(&original.run.id, "missing", "u2", None).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_edit_recomputes_summary_only() {
        let (orch, original, ids) = three_block_run(Arc::new(ScriptedLlm::default())).await;
        let target = &original.block_runs[0];

        let edited = orch
            .edit_block_output(
                &original.run.id,
                &target.id,
                "u1",
                OutputEdit::Named(json!({"a": "hand-written"}).as_object().unwrap().clone()),
            )
            .await
            .unwrap();
        assert_eq!(edited.raw_output.as_deref(), Some("hand-written"));

        let after = orch.state.run_store.get_detail(&original.run.id).await.unwrap().unwrap();
        assert_eq!(after.block_runs.len(), 3);
        for i in 1..3 {
            assert_eq!(after.block_runs[i].output, original.block_runs[i].output);
            assert_eq!(after.block_runs[i].raw_output, original.block_runs[i].raw_output);
        }
        let summary = after.run.results_summary.unwrap();
        assert_eq!(summary.len(), 3);
        assert_eq!(
            summary[&crate::models::run::summary_key(&ids[0], "A")],
            json!({"a": "hand-written"})
        );
    }

    #[tokio::test]
    async fn test_edit_must_match_block_kind() {
        let (orch, original, _) = three_block_run(Arc::new(ScriptedLlm::default())).await;
        let result = orch
            .edit_block_output(
                &original.run.id,
                &original.block_runs[0].id,
                "u1",
                OutputEdit::List(vec![json!("x")]),
            )
            .await;
        assert!(matches!(result, Err(CoreError::BadRequest(_))));

        let result = orch
            .edit_block_output(&original.run.id, "nope", "u1", OutputEdit::RawText("x".into()))
            .await;
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }

    #[test]
    fn test_raw_text_edit_parses_lists() {
        let current = BlockOutput::List {
            name: "sums".into(),
            values: vec![],
        };
        let (output, raw) = apply_edit(
            BlockType::SingleList,
            Some(&current),
            None,
            OutputEdit::RawText(r#"["x","y"]"#.into()),
        )
        .unwrap();
        assert_eq!(
            output,
            BlockOutput::List {
                name: "sums".into(),
                values: vec![json!("x"), json!("y")],
            }
        );
        assert_eq!(raw, r#"["x","y"]"#);

        assert!(apply_edit(BlockType::MultiList, None, None, OutputEdit::RawText("nope".into())).is_err());
    }
}
