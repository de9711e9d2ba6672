//! Integration tests for the promptflow-cli commands.
//!
//! These tests exercise the same code paths as the binary, using
//! in-memory SQLite databases for isolation and a recording LLM client
//! that answers every prompt with the prompt itself.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use promptflow_cli::commands;
use promptflow_core::definition::SequenceDefinition;
use promptflow_core::engine::{LlmClient, LlmError, LlmRequest};
use promptflow_core::models::run::{BlockOutput, RunStatus};
use promptflow_core::models::sequence::Sequence;
use promptflow_core::state::{AppState, AppStateInner};
use promptflow_core::{Database, EngineConfig, SequenceOrchestrator};
use serde_json::json;

const REVIEW_YAML: &str = r#"
name: Review
variables:
  - name: Topic
    role: input
    value: "caching"
global_lists:
  - name: Angles
    items: ["speed", "cost"]
blocks:
  - name: Draft
    type: standard
    config:
      prompt: "Draft about <<Topic>>"
      output_variable_name: draft
  - name: Critique
    type: standard
    config:
      prompt: "Critique: {{ draft }}"
      output_variable_name: critique
  - name: Per Angle
    type: single_list
    config:
      prompt: "{{ critique }} / {{ item }}"
      input_list_variable_name: Angles
      output_list_variable_name: angle_notes
"#;

#[derive(Default)]
struct RecordingLlm {
    prompts: Mutex<Vec<String>>,
}

impl RecordingLlm {
    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for RecordingLlm {
    async fn invoke(&self, request: &LlmRequest) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        Ok(request.prompt.clone())
    }
}

/// Create an in-memory AppState for testing.
fn test_state() -> AppState {
    let db = Database::open(":memory:").expect("Failed to open in-memory database");
    Arc::new(AppStateInner::new(db))
}

async fn imported(yaml: &str) -> (SequenceOrchestrator, Arc<RecordingLlm>, Sequence) {
    let state = test_state();
    let definition = SequenceDefinition::from_yaml(yaml).expect("definition parses");
    let sequence = definition.import(&state, "local").await.expect("import succeeds");
    let llm = Arc::new(RecordingLlm::default());
    let orchestrator = SequenceOrchestrator::new(state, llm.clone(), EngineConfig::default());
    (orchestrator, llm, sequence)
}

#[tokio::test]
async fn test_import_run_rerun_edit() {
    let (orchestrator, llm, sequence) = imported(REVIEW_YAML).await;

    let detail = orchestrator
        .start_run(&sequence.id, "local", None, None)
        .await
        .unwrap();
    assert_eq!(detail.run.status, RunStatus::Completed);
    assert_eq!(detail.block_runs.len(), 3);
    assert_eq!(
        detail.block_runs[2].output,
        Some(BlockOutput::List {
            name: "angle_notes".to_string(),
            values: vec![
                json!("Critique: Draft about caching / speed"),
                json!("Critique: Draft about caching / cost"),
            ],
        })
    );
    assert_eq!(llm.prompts().len(), 4);

    // Rerun from the critique with a new topic: the draft comes from history.
    let blocks = orchestrator
        .state()
        .block_store
        .list_by_sequence(&sequence.id)
        .await
        .unwrap();
    let rerun = orchestrator
        .rerun_from_block(
            &detail.run.id,
            &blocks[1].id,
            "local",
            json!({"Topic": "queues"}).as_object().cloned(),
        )
        .await
        .unwrap();
    assert_eq!(rerun.run.status, RunStatus::Completed);
    assert_eq!(rerun.block_runs.len(), 3);
    assert_eq!(rerun.block_runs[0].id, detail.block_runs[0].id);
    assert_eq!(llm.prompts()[4], "Critique: Draft about caching");

    // A hand-edited draft feeds the next rerun.
    orchestrator
        .edit_block_output(
            &detail.run.id,
            &detail.block_runs[0].id,
            "local",
            commands::run::parse_edit("raw_text", "Manual draft").unwrap(),
        )
        .await
        .unwrap();
    orchestrator
        .rerun_from_block(&detail.run.id, &blocks[1].id, "local", None)
        .await
        .unwrap();
    assert!(llm.prompts().contains(&"Critique: Manual draft".to_string()));

    let runs = orchestrator
        .state()
        .run_store
        .list_by_sequence(&sequence.id)
        .await
        .unwrap();
    assert_eq!(runs.len(), 3);
}

#[tokio::test]
async fn test_run_command_reports_failed_run() {
    let (orchestrator, llm, sequence) = imported(
        r#"
name: Broken
blocks:
  - name: Ask
    type: standard
    config:
      prompt: "About {{ nothing }}"
      output_variable_name: answer
  - name: Never
    type: standard
    config:
      prompt: "unreached"
      output_variable_name: never
"#,
    )
    .await;

    let result = commands::run::start(&orchestrator, &sequence.id, "local", None, None).await;
    let err = result.unwrap_err();
    assert!(err.contains("Failed at block 'Ask'"), "{}", err);
    assert!(llm.prompts().is_empty());

    let runs = orchestrator
        .state()
        .run_store
        .list_by_sequence(&sequence.id)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
}

#[tokio::test]
async fn test_block_exec_and_preview_commands() {
    let (orchestrator, llm, sequence) = imported(REVIEW_YAML).await;
    let blocks = orchestrator
        .state()
        .block_store
        .list_by_sequence(&sequence.id)
        .await
        .unwrap();

    let overrides = commands::parse_inputs(&["Topic=tests".to_string()], None).unwrap();
    commands::block::exec(&orchestrator, &sequence.id, &blocks[0].id, "local", overrides)
        .await
        .unwrap();
    assert_eq!(llm.prompts(), vec!["Draft about tests".to_string()]);

    let preview = orchestrator
        .preview_prompt(&sequence.id, &blocks[1].id, "local", None)
        .await
        .unwrap();
    assert_eq!(preview.rendered_prompt, "Critique: [Simulated output from Draft]");
    commands::preview::run(&orchestrator, &sequence.id, &blocks[1].id, "local", None)
        .await
        .unwrap();
    assert_eq!(llm.prompts().len(), 1);
}

#[tokio::test]
async fn test_validate_and_import_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("review.yaml");
    std::fs::write(&path, REVIEW_YAML).unwrap();
    let path = path.to_string_lossy().to_string();

    commands::sequence::validate(&path).await.unwrap();

    let state = test_state();
    commands::sequence::import(&state, &path, "local").await.unwrap();
    let sequences = state.sequence_store.list_by_user("local").await.unwrap();
    assert_eq!(sequences.len(), 1);
    assert_eq!(sequences[0].name, "Review");

    assert!(commands::sequence::validate(&dir.path().join("missing.yaml").to_string_lossy())
        .await
        .is_err());
}
