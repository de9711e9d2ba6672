//! Sequence Orchestrator — drives the blocks of one run in order.
//!
//! A run moves `pending → running → completed | failed`. Blocks execute one
//! at a time by ascending order; each gets a persisted block run. The first
//! failing block fails the run and nothing after it executes. Successful
//! outputs are folded into the running context and also upserted as
//! `output` variables of the sequence.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::context::{build_context, Context};
use crate::engine::executor::{resolve_model, BlockExecution, BlockExecutor};
use crate::engine::llm::LlmClient;
use crate::engine::template::render_prompt;
use crate::error::CoreError;
use crate::models::block::{Block, BlockConfig};
use crate::models::run::{summary_key, BlockRun, Run, RunDetail, RunStatus};
use crate::models::sequence::Sequence;
use crate::state::AppState;

pub const EMPTY_SEQUENCE_MESSAGE: &str = "Sequence has no blocks to execute.";

/// What a block's prompt would look like if the run reached it now.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPreview {
    pub block_id: String,
    pub block_name: String,
    pub block_type: String,
    pub prompt_template: String,
    pub rendered_prompt: String,
    pub context_used_for_preview: Map<String, Value>,
}

pub struct SequenceOrchestrator {
    pub(crate) state: AppState,
    pub(crate) executor: BlockExecutor,
}

impl SequenceOrchestrator {
    pub fn new(state: AppState, llm: Arc<dyn LlmClient>, config: EngineConfig) -> Self {
        Self {
            state,
            executor: BlockExecutor::new(llm, config),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    // ─── Runs ──────────────────────────────────────────────────────────────

    /// Create a `pending` run of a sequence owned by `user_id`.
    pub async fn create_run(
        &self,
        sequence_id: &str,
        user_id: &str,
        input_overrides: Option<Map<String, Value>>,
        llm_model_override: Option<String>,
    ) -> Result<Run, CoreError> {
        self.state.sequence_store.get_owned(sequence_id, user_id).await?;
        let run = Run::new(
            Uuid::new_v4().to_string(),
            sequence_id.to_string(),
            user_id.to_string(),
            input_overrides,
            llm_model_override,
        );
        self.state.run_store.save(&run).await?;
        Ok(run)
    }

    /// Create and execute a run. Failures that escape execution itself are
    /// recorded on the run rather than returned.
    pub async fn start_run(
        &self,
        sequence_id: &str,
        user_id: &str,
        input_overrides: Option<Map<String, Value>>,
        llm_model_override: Option<String>,
    ) -> Result<RunDetail, CoreError> {
        let run = self
            .create_run(sequence_id, user_id, input_overrides, llm_model_override)
            .await?;
        match self.execute_run(&run.id).await {
            Ok(detail) => Ok(detail),
            Err(e) => {
                tracing::error!("[Orchestrator] Run {} aborted: {}", run.id, e);
                let stored = self.state.run_store.get(&run.id).await?;
                let mut run = stored.unwrap_or(run);
                self.mark_failed(&mut run, format!("Execution failed to start or complete: {}", e))
                    .await?;
                self.detail(&run.id).await
            }
        }
    }

    /// Execute a `pending` run from its first block.
    pub async fn execute_run(&self, run_id: &str) -> Result<RunDetail, CoreError> {
        let mut run = self
            .state
            .run_store
            .get(run_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Run '{}' not found", run_id)))?;
        if run.status != RunStatus::Pending {
            return Err(CoreError::BadRequest(format!(
                "Run '{}' is already {}",
                run_id,
                run.status.as_str()
            )));
        }
        let sequence = self
            .state
            .sequence_store
            .get_owned(&run.sequence_id, &run.user_id)
            .await?;

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        run.updated_at = Utc::now();
        self.state.run_store.save(&run).await?;
        tracing::info!("[Orchestrator] Run {} started for sequence '{}'", run.id, sequence.name);

        let context = build_context(
            &self.state,
            &sequence.id,
            &run.user_id,
            run.input_overrides.as_ref(),
        )
        .await?;
        let blocks = self.state.block_store.list_by_sequence(&sequence.id).await?;

        if blocks.is_empty() {
            run.status = RunStatus::Completed;
            run.completed_at = Some(Utc::now());
            run.error_message = Some(EMPTY_SEQUENCE_MESSAGE.to_string());
            run.results_summary = Some(Map::new());
            run.updated_at = Utc::now();
            self.state.run_store.save(&run).await?;
            tracing::info!("[Orchestrator] Run {} completed: {}", run.id, EMPTY_SEQUENCE_MESSAGE);
            return self.detail(&run.id).await;
        }

        self.execute_blocks(&mut run, &sequence, &blocks, context).await?;
        self.detail(&run.id).await
    }

    /// Execute `blocks` in order under `run`, folding each success into
    /// `context`, and leave the run in a terminal state.
    pub(crate) async fn execute_blocks(
        &self,
        run: &mut Run,
        sequence: &Sequence,
        blocks: &[Block],
        mut context: Context,
    ) -> Result<(), CoreError> {
        let mut summary = run.results_summary.clone().unwrap_or_default();
        let mut failure: Option<String> = None;

        for block in blocks {
            let (_, exec) = self.run_block(run, sequence, block, &context).await?;
            if let Some(e) = exec.error {
                failure = Some(format!("Failed at block '{}': {}", block.name, e));
                break;
            }
            context.merge(&exec.delta);
            summary.insert(summary_key(&block.id, &block.name), Value::Object(exec.delta));
        }

        run.results_summary = Some(summary);
        run.completed_at = Some(Utc::now());
        run.updated_at = Utc::now();
        match failure {
            Some(message) => {
                tracing::error!("[Orchestrator] Run {} failed: {}", run.id, message);
                run.status = RunStatus::Failed;
                run.error_message = Some(message);
            }
            None => {
                tracing::info!("[Orchestrator] Run {} completed ({} blocks)", run.id, blocks.len());
                run.status = RunStatus::Completed;
            }
        }
        self.state.run_store.save(run).await
    }

    /// Execute one block under `run` and persist its block run.
    pub(crate) async fn run_block(
        &self,
        run: &Run,
        sequence: &Sequence,
        block: &Block,
        context: &Context,
    ) -> Result<(BlockRun, BlockExecution), CoreError> {
        let mut block_run = BlockRun::start(
            Uuid::new_v4().to_string(),
            run.id.clone(),
            block.id.clone(),
            block.name.clone(),
            block.block_type.clone(),
        );
        self.state.run_store.save_block_run(&block_run).await?;

        let model = resolve_model(
            block,
            run.llm_model_override.as_deref(),
            sequence.default_llm_model.as_deref(),
            self.executor.config(),
        );
        let exec = self.executor.execute(block, context, &model).await;

        if exec.is_success() {
            for (name, value) in &exec.delta {
                self.state
                    .variable_store
                    .upsert_output(name, value, &run.user_id, &run.sequence_id)
                    .await?;
            }
        }

        block_run.rendered_prompt = exec.rendered_prompt.clone();
        block_run.raw_output = exec.raw_output.clone();
        block_run.output = exec.output.clone();
        block_run.completed_at = Some(Utc::now());
        block_run.updated_at = Utc::now();
        match &exec.error {
            Some(e) => {
                block_run.status = RunStatus::Failed;
                block_run.error_message = Some(e.to_string());
            }
            None => block_run.status = RunStatus::Completed,
        }
        self.state.run_store.save_block_run(&block_run).await?;
        Ok((block_run, exec))
    }

    pub(crate) async fn mark_failed(&self, run: &mut Run, message: String) -> Result<(), CoreError> {
        run.status = RunStatus::Failed;
        run.error_message = Some(message);
        run.completed_at = Some(Utc::now());
        run.updated_at = Utc::now();
        self.state.run_store.save(run).await
    }

    pub(crate) async fn detail(&self, run_id: &str) -> Result<RunDetail, CoreError> {
        self.state
            .run_store
            .get_detail(run_id)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("Run '{}' vanished", run_id)))
    }

    /// The blocks of `sequence_id` with the position of `block_id` among them.
    pub(crate) async fn locate_block(
        &self,
        sequence_id: &str,
        block_id: &str,
    ) -> Result<(Vec<Block>, usize), CoreError> {
        let blocks = self.state.block_store.list_by_sequence(sequence_id).await?;
        let index = blocks.iter().position(|b| b.id == block_id).ok_or_else(|| {
            CoreError::NotFound("Block not found or does not belong to the sequence.".to_string())
        })?;
        Ok((blocks, index))
    }

    // ─── Single blocks ─────────────────────────────────────────────────────

    /// Render a block's prompt as it would be seen mid-run, with earlier
    /// block outputs replaced by placeholders. Render failures are reported
    /// in the preview text.
    pub async fn preview_prompt(
        &self,
        sequence_id: &str,
        block_id: &str,
        user_id: &str,
        input_overrides: Option<&Map<String, Value>>,
    ) -> Result<PromptPreview, CoreError> {
        self.state.sequence_store.get_owned(sequence_id, user_id).await?;
        let (blocks, index) = self.locate_block(sequence_id, block_id).await?;
        let target = &blocks[index];

        let mut context = build_context(&self.state, sequence_id, user_id, input_overrides).await?;
        for prior in &blocks[..index] {
            match prior.parsed_config() {
                Ok(config) => context.merge(&simulated_outputs(&config, &prior.name)),
                Err(e) => tracing::warn!(
                    "[Orchestrator] Preview skips outputs of block '{}': {}",
                    prior.name,
                    e
                ),
            }
        }

        let template = target
            .config
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let rendered_prompt = match target.parsed_config() {
            Ok(config) => {
                context.merge(&sample_items(&config));
                render_prompt(&template, &context)
                    .unwrap_or_else(|e| render_error(&e.to_string(), &template))
            }
            Err(e) => render_error(&e.to_string(), &template),
        };

        Ok(PromptPreview {
            block_id: target.id.clone(),
            block_name: target.name.clone(),
            block_type: target.block_type.clone(),
            prompt_template: template,
            rendered_prompt,
            context_used_for_preview: context.truncated(100),
        })
    }

    /// Execute one block on its own under a fresh run whose terminal status
    /// mirrors the block's.
    pub async fn execute_single_block(
        &self,
        sequence_id: &str,
        block_id: &str,
        user_id: &str,
        input_overrides: Option<Map<String, Value>>,
    ) -> Result<BlockRun, CoreError> {
        let sequence = self.state.sequence_store.get_owned(sequence_id, user_id).await?;
        let (blocks, index) = self.locate_block(sequence_id, block_id).await?;
        let block = &blocks[index];

        let mut run = Run::new(
            Uuid::new_v4().to_string(),
            sequence.id.clone(),
            user_id.to_string(),
            input_overrides,
            None,
        );
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        self.state.run_store.save(&run).await?;
        tracing::info!("[Orchestrator] Manual run {} for block '{}'", run.id, block.name);

        let context = build_context(&self.state, &sequence.id, user_id, run.input_overrides.as_ref())
            .await?;
        let (block_run, exec) = self.run_block(&run, &sequence, block, &context).await?;

        run.completed_at = Some(Utc::now());
        run.updated_at = Utc::now();
        match exec.error {
            Some(e) => {
                run.status = RunStatus::Failed;
                run.error_message = Some(format!("Failed at block '{}': {}", block.name, e));
            }
            None => {
                let mut summary = Map::new();
                summary.insert(summary_key(&block.id, &block.name), Value::Object(exec.delta));
                run.status = RunStatus::Completed;
                run.results_summary = Some(summary);
            }
        }
        self.state.run_store.save(&run).await?;
        Ok(block_run)
    }
}

/// Placeholder outputs a block would contribute, for previews.
fn simulated_outputs(config: &BlockConfig, block_name: &str) -> Map<String, Value> {
    let mut outputs = Map::new();
    match config {
        BlockConfig::Standard(c) => {
            outputs.insert(
                c.output_variable_name.clone(),
                Value::String(format!("[Simulated output from {}]", block_name)),
            );
        }
        BlockConfig::Discretization(c) => {
            for name in &c.output_names {
                outputs.insert(
                    name.clone(),
                    Value::String(format!("[Simulated output '{}' from {}]", name, block_name)),
                );
            }
        }
        BlockConfig::SingleList(c) => {
            outputs.insert(
                c.output_list_variable_name.clone(),
                serde_json::json!([format!("[Simulated item from list output of {}]", block_name)]),
            );
        }
        BlockConfig::MultiList(c) => {
            outputs.insert(
                c.output_matrix_variable_name.clone(),
                serde_json::json!([[format!("[Simulated item from matrix output of {}]", block_name)]]),
            );
        }
    }
    outputs
}

/// Sample `item*` entries so list and matrix prompts can render.
fn sample_items(config: &BlockConfig) -> Map<String, Value> {
    let mut items = Map::new();
    match config {
        BlockConfig::SingleList(c) => {
            items.insert(
                "item".into(),
                Value::String(format!("[SAMPLE_ITEM_FROM_{}]", c.input_list_variable_name)),
            );
            items.insert("item_index".into(), Value::from(0));
        }
        BlockConfig::MultiList(c) => {
            for (list, prefix) in c.input_lists_config.iter().zip(["item1", "item2"]) {
                items.insert(
                    prefix.to_string(),
                    Value::String(format!("[SAMPLE_FROM_{}]", list.name)),
                );
                items.insert(format!("{}_name", prefix), Value::String(list.name.clone()));
                items.insert(format!("{}_index", prefix), Value::from(0));
            }
        }
        BlockConfig::Standard(_) | BlockConfig::Discretization(_) => {}
    }
    items
}

fn render_error(error: &str, template: &str) -> String {
    format!("Error rendering prompt preview: {}. Template: {}", error, template)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::Database;
    use crate::engine::executor::tests::ScriptedLlm;
    use crate::models::block::{BlockType, CreateBlockInput};
    use crate::models::run::BlockOutput;
    use crate::state::AppStateInner;
    use serde_json::json;

    pub(crate) async fn setup(llm: Arc<ScriptedLlm>) -> SequenceOrchestrator {
        let state = Arc::new(AppStateInner::new(Database::open_in_memory().unwrap()));
        state
            .sequence_store
            .save(&Sequence::new("s1".into(), "Seq".into(), None, "u1".into(), None))
            .await
            .unwrap();
        SequenceOrchestrator::new(state, llm, EngineConfig::default())
    }

    pub(crate) async fn add_block(
        orch: &SequenceOrchestrator,
        order: i64,
        name: &str,
        block_type: BlockType,
        config: Value,
    ) -> Block {
        orch.state
            .block_store
            .create(CreateBlockInput {
                sequence_id: "s1".into(),
                name: name.into(),
                block_type,
                order,
                config,
                llm_model_override: None,
            })
            .await
            .unwrap()
    }

    fn standard(prompt: &str, output: &str) -> Value {
        json!({"prompt": prompt, "output_variable_name": output})
    }

    #[tokio::test]
    async fn test_empty_sequence_completes_with_message() {
        let orch = setup(Arc::new(ScriptedLlm::default())).await;
        let detail = orch.start_run("s1", "u1", None, None).await.unwrap();
        assert_eq!(detail.run.status, RunStatus::Completed);
        assert_eq!(detail.run.error_message.as_deref(), Some(EMPTY_SEQUENCE_MESSAGE));
        assert!(detail.block_runs.is_empty());
    }

    #[tokio::test]
    async fn test_start_run_records_escaped_failure_on_the_run() {
        let llm = Arc::new(ScriptedLlm::default());
        let orch = setup(llm.clone()).await;
        add_block(&orch, 0, "A", BlockType::Standard, standard("a", "a")).await;
        orch.state
            .db
            .with_conn(|conn| conn.execute_batch("DROP TABLE variables;"))
            .unwrap();

        let detail = orch.start_run("s1", "u1", None, None).await.unwrap();

        assert_eq!(detail.run.status, RunStatus::Failed);
        assert!(detail.run.completed_at.is_some());
        let message = detail.run.error_message.unwrap();
        assert!(
            message.starts_with("Execution failed to start or complete: "),
            "{}",
            message
        );
        assert!(message.contains("variables"));
        assert!(detail.block_runs.is_empty());
        assert!(llm.prompts().is_empty());

        let stored = orch.state.run_store.get(&detail.run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_outputs_flow_into_later_blocks() {
        let llm = Arc::new(ScriptedLlm::with_responses(&["An outline", "A draft"]));
        let orch = setup(llm.clone()).await;
        let b1 = add_block(&orch, 0, "Outline", BlockType::Standard, standard("Outline <<topic>>", "outline")).await;
        let b2 = add_block(&orch, 1, "Draft", BlockType::Standard, standard("Draft from {{ outline }}", "draft")).await;

        let overrides = json!({"topic": "ownership"}).as_object().cloned();
        let detail = orch.start_run("s1", "u1", overrides, None).await.unwrap();

        assert_eq!(detail.run.status, RunStatus::Completed);
        assert_eq!(llm.prompts(), vec!["Outline ownership", "Draft from An outline"]);
        let summary = detail.run.results_summary.unwrap();
        assert_eq!(summary[&summary_key(&b1.id, "Outline")], json!({"outline": "An outline"}));
        assert_eq!(summary[&summary_key(&b2.id, "Draft")], json!({"draft": "A draft"}));
        assert!(detail.block_runs.iter().all(|br| br.status == RunStatus::Completed));

        // Outputs persist as sequence variables for later runs.
        let var = orch
            .state
            .variable_store
            .get_by_name("draft", "u1", Some("s1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(var.value, json!("A draft"));
    }

    #[tokio::test]
    async fn test_fail_fast_stops_at_failing_block() {
        let llm = Arc::new(ScriptedLlm::default());
        let orch = setup(llm.clone()).await;
        add_block(&orch, 0, "One", BlockType::Standard, standard("first", "a")).await;
        add_block(&orch, 1, "Two", BlockType::Standard, standard("fail: second", "b")).await;
        add_block(&orch, 2, "Three", BlockType::Standard, standard("third", "c")).await;

        let detail = orch.start_run("s1", "u1", None, None).await.unwrap();

        assert_eq!(detail.run.status, RunStatus::Failed);
        assert!(detail.run.error_message.unwrap().starts_with("Failed at block 'Two'"));
        assert_eq!(detail.block_runs.len(), 2);
        assert_eq!(detail.block_runs[0].status, RunStatus::Completed);
        assert_eq!(detail.block_runs[1].status, RunStatus::Failed);
        assert!(detail.block_runs[1].error_message.is_some());
        assert_eq!(llm.prompts(), vec!["first", "fail: second"]);
    }

    #[tokio::test]
    async fn test_missing_input_fails_block_with_render_error() {
        let orch = setup(Arc::new(ScriptedLlm::default())).await;
        orch.state
            .variable_store
            .upsert(crate::models::variable::CreateVariableInput {
                name: "customer".into(),
                user_id: "u1".into(),
                sequence_id: Some("s1".into()),
                role: crate::models::variable::VariableRole::Input,
                value: Value::Null,
                description: None,
            })
            .await
            .unwrap();
        add_block(&orch, 0, "Greet", BlockType::Standard, standard("Hi <<customer>>", "greeting")).await;

        let detail = orch.start_run("s1", "u1", None, None).await.unwrap();
        assert_eq!(detail.run.status, RunStatus::Failed);
        assert!(detail.block_runs[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("customer"));
    }

    #[tokio::test]
    async fn test_list_outputs_persist_by_kind() {
        let orch = setup(Arc::new(ScriptedLlm::default())).await;
        orch.state
            .global_list_store
            .create(crate::models::global_list::CreateGlobalListInput {
                name: "Products".into(),
                user_id: "u1".into(),
                description: None,
                items: vec![json!("a"), json!("b")],
            })
            .await
            .unwrap();
        add_block(
            &orch,
            0,
            "Summaries",
            BlockType::SingleList,
            json!({"prompt": "{{ item }}", "input_list_variable_name": "Products", "output_list_variable_name": "sums"}),
        )
        .await;

        let detail = orch.start_run("s1", "u1", None, None).await.unwrap();
        assert_eq!(
            detail.block_runs[0].output,
            Some(BlockOutput::List {
                name: "sums".into(),
                values: vec![json!("out:a"), json!("out:b")],
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_sequence_is_not_found() {
        let orch = setup(Arc::new(ScriptedLlm::default())).await;
        assert!(matches!(
            orch.start_run("nope", "u1", None, None).await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            orch.start_run("s1", "someone-else", None, None).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_preview_simulates_prior_outputs() {
        let llm = Arc::new(ScriptedLlm::default());
        let orch = setup(llm.clone()).await;
        add_block(&orch, 0, "Outline", BlockType::Standard, standard("x", "outline")).await;
        add_block(
            &orch,
            1,
            "Split",
            BlockType::Discretization,
            json!({"prompt": "y", "output_names": ["title"]}),
        )
        .await;
        let target = add_block(
            &orch,
            2,
            "Compare",
            BlockType::MultiList,
            json!({
                "prompt": "{{ outline }} | {{ title }} | {{ item1 }} vs {{ item2 }}",
                "input_lists_config": [{"name": "a"}, {"name": "b"}]
            }),
        )
        .await;

        let preview = orch.preview_prompt("s1", &target.id, "u1", None).await.unwrap();
        assert_eq!(
            preview.rendered_prompt,
            "[Simulated output from Outline] | [Simulated output 'title' from Split] | [SAMPLE_FROM_a] vs [SAMPLE_FROM_b]"
        );
        assert!(llm.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_preview_reports_render_errors_inline() {
        let orch = setup(Arc::new(ScriptedLlm::default())).await;
        let target = add_block(&orch, 0, "Greet", BlockType::Standard, standard("Hi {{ who }}", "g")).await;
        let preview = orch.preview_prompt("s1", &target.id, "u1", None).await.unwrap();
        assert!(preview.rendered_prompt.starts_with("Error rendering prompt preview:"));
        assert!(preview.rendered_prompt.ends_with("Template: Hi {{ who }}"));
    }

    #[tokio::test]
    async fn test_execute_single_block_creates_manual_run() {
        let llm = Arc::new(ScriptedLlm::default());
        let orch = setup(llm.clone()).await;
        add_block(&orch, 0, "First", BlockType::Standard, standard("one", "a")).await;
        let second = add_block(&orch, 1, "Second", BlockType::Standard, standard("two <<x>>", "b")).await;

        let overrides = json!({"x": "!"}).as_object().cloned();
        let block_run = orch
            .execute_single_block("s1", &second.id, "u1", overrides)
            .await
            .unwrap();

        assert_eq!(block_run.status, RunStatus::Completed);
        assert_eq!(llm.prompts(), vec!["two !"]);
        let run = orch.state.run_store.get(&block_run.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(orch.state.run_store.list_block_runs(&run.id).await.unwrap().len(), 1);
    }
}
