//! Block Executor — runs one block against an immutable context.
//!
//! Dispatch is an exhaustive match over [`BlockConfig`]. Whatever goes
//! wrong inside a block (bad config, render failure, missing list, LLM
//! error) is captured in [`BlockExecution::error`] and never returned as
//! an `Err`; the caller decides what a failed block means for the run.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::EngineConfig;
use crate::engine::context::Context;
use crate::engine::discretize::discretize_output;
use crate::engine::llm::{LlmClient, LlmRequest};
use crate::engine::template::render_prompt;
use crate::error::BlockError;
use crate::models::block::{
    Block, BlockConfig, DiscretizationConfig, MultiListConfig, SingleListConfig, StandardConfig,
};
use crate::models::run::BlockOutput;

/// Everything one block execution produced, successful or not.
#[derive(Debug, Default)]
pub struct BlockExecution {
    pub rendered_prompt: Option<String>,
    pub raw_output: Option<String>,
    /// Entries to fold into the context of later blocks.
    pub delta: Map<String, Value>,
    pub output: Option<BlockOutput>,
    pub error: Option<BlockError>,
}

impl BlockExecution {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Model for a block: block override, then run override, then the
/// sequence default, then the configured default.
pub fn resolve_model(
    block: &Block,
    run_override: Option<&str>,
    sequence_default: Option<&str>,
    config: &EngineConfig,
) -> String {
    [block.llm_model_override.as_deref(), run_override, sequence_default]
        .into_iter()
        .flatten()
        .find(|m| !m.trim().is_empty())
        .unwrap_or(config.default_model.as_str())
        .to_string()
}

pub struct BlockExecutor {
    llm: Arc<dyn LlmClient>,
    config: EngineConfig,
}

impl BlockExecutor {
    pub fn new(llm: Arc<dyn LlmClient>, config: EngineConfig) -> Self {
        Self { llm, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute `block` with `model` against `context`.
    pub async fn execute(&self, block: &Block, context: &Context, model: &str) -> BlockExecution {
        let mut exec = BlockExecution::default();
        let result = match block.parsed_config() {
            Ok(config) => self.dispatch(&config, context, model, &mut exec).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            tracing::error!(
                "[Executor] Block {} ('{}') failed: {}",
                block.id,
                block.name,
                e
            );
            exec.delta.clear();
            exec.output = None;
            exec.error = Some(e);
        }
        exec
    }

    async fn dispatch(
        &self,
        config: &BlockConfig,
        context: &Context,
        model: &str,
        exec: &mut BlockExecution,
    ) -> Result<(), BlockError> {
        match config {
            BlockConfig::Standard(c) => self.run_standard(c, context, model, exec).await,
            BlockConfig::Discretization(c) => self.run_discretization(c, context, model, exec).await,
            BlockConfig::SingleList(c) => self.run_single_list(c, context, model, exec).await,
            BlockConfig::MultiList(c) => self.run_multi_list(c, context, model, exec).await,
        }
    }

    async fn call(&self, prompt: String, model: &str) -> Result<String, BlockError> {
        let request = LlmRequest {
            prompt,
            model: model.to_string(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        Ok(self.llm.invoke(&request).await?)
    }

    // ─── Variants ──────────────────────────────────────────────────────────

    async fn run_standard(
        &self,
        config: &StandardConfig,
        context: &Context,
        model: &str,
        exec: &mut BlockExecution,
    ) -> Result<(), BlockError> {
        let prompt = render_prompt(&config.prompt, context)?;
        exec.rendered_prompt = Some(prompt.clone());
        let raw = self.call(prompt, model).await?;
        exec.raw_output = Some(raw.clone());

        exec.delta.insert(config.output_variable_name.clone(), Value::String(raw));
        exec.output = Some(BlockOutput::Named {
            values: exec.delta.clone(),
        });
        Ok(())
    }

    async fn run_discretization(
        &self,
        config: &DiscretizationConfig,
        context: &Context,
        model: &str,
        exec: &mut BlockExecution,
    ) -> Result<(), BlockError> {
        let prompt = render_prompt(&config.prompt, context)?;
        exec.rendered_prompt = Some(prompt.clone());
        let raw = self.call(prompt, model).await?;

        let named = discretize_output(&raw, &config.output_names);
        exec.raw_output = Some(raw);
        exec.delta = named.clone();
        exec.output = Some(BlockOutput::Named { values: named });
        Ok(())
    }

    async fn run_single_list(
        &self,
        config: &SingleListConfig,
        context: &Context,
        model: &str,
        exec: &mut BlockExecution,
    ) -> Result<(), BlockError> {
        let items = resolve_single_list(context, &config.input_list_variable_name)?;
        exec.rendered_prompt = Some(format!(
            "Single List Block. Template: {}... on list '{}' ({} items).",
            preview_of(&config.prompt),
            config.input_list_variable_name,
            items.len()
        ));

        // One scope per block; item keys are overwritten per item.
        let mut scope = context.clone();
        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            scope.insert("item", item.clone());
            scope.insert("item_index", Value::from(index));
            let prompt = render_prompt(&config.prompt, &scope)?;
            results.push(Value::String(self.call(prompt, model).await?));
        }

        exec.raw_output = Some(Value::Array(results.clone()).to_string());
        exec.delta
            .insert(config.output_list_variable_name.clone(), Value::Array(results.clone()));
        exec.output = Some(BlockOutput::List {
            name: config.output_list_variable_name.clone(),
            values: results,
        });
        Ok(())
    }

    async fn run_multi_list(
        &self,
        config: &MultiListConfig,
        context: &Context,
        model: &str,
        exec: &mut BlockExecution,
    ) -> Result<(), BlockError> {
        let Some(first) = config.input_lists_config.first() else {
            return Err(BlockError::Configuration(
                "Multi-List block requires at least one input list configuration, typically two for matrix."
                    .to_string(),
            ));
        };
        let list1 = resolve_named_list(context, &first.name)?;
        let second = match config.input_lists_config.get(1) {
            Some(cfg) => Some((cfg.name.as_str(), resolve_named_list(context, &cfg.name)?)),
            None => None,
        };
        exec.rendered_prompt = Some(format!(
            "Multi List Block. Template: {}...",
            preview_of(&config.prompt)
        ));

        let mut scope = context.clone();
        let mut matrix: Vec<Vec<Value>> = Vec::new();
        match second {
            Some((name2, list2)) => {
                for (i1, item1) in list1.iter().enumerate() {
                    let mut row = Vec::with_capacity(list2.len());
                    for (i2, item2) in list2.iter().enumerate() {
                        scope.merge(&item_entries("item1", &first.name, item1, i1));
                        scope.merge(&item_entries("item2", name2, item2, i2));
                        let prompt = render_prompt(&config.prompt, &scope)?;
                        row.push(Value::String(self.call(prompt, model).await?));
                    }
                    matrix.push(row);
                }
            }
            None => {
                let mut row = Vec::with_capacity(list1.len());
                for (i1, item1) in list1.iter().enumerate() {
                    scope.merge(&item_entries("item1", &first.name, item1, i1));
                    let prompt = render_prompt(&config.prompt, &scope)?;
                    row.push(Value::String(self.call(prompt, model).await?));
                }
                matrix.push(row);
            }
        }

        let output = BlockOutput::Matrix {
            name: config.output_matrix_variable_name.clone(),
            values: matrix,
        };
        exec.delta = output.to_context_delta();
        exec.raw_output = exec
            .delta
            .get(&config.output_matrix_variable_name)
            .map(Value::to_string);
        exec.output = Some(output);
        Ok(())
    }
}

// ─── List resolution ───────────────────────────────────────────────────────

/// Resolve a single-list input by forgiving lookup. When the name does not
/// resolve to a list, fall back to the only distinct list value in the
/// context, if there is exactly one.
pub fn resolve_single_list<'a>(context: &'a Context, name: &str) -> Result<&'a Vec<Value>, BlockError> {
    let found = context.lookup(name);
    if let Some(Value::Array(items)) = found {
        return Ok(items);
    }

    let mut candidates: Vec<&Vec<Value>> = Vec::new();
    for (_, value) in context.iter() {
        if let Value::Array(items) = value {
            if !candidates.contains(&items) {
                candidates.push(items);
            }
        }
    }
    if let [only] = candidates.as_slice() {
        tracing::warn!(
            "[Executor] Input '{}' is not a list; using the only list in context instead",
            name
        );
        return Ok(*only);
    }

    Err(BlockError::ListResolution(format!(
        "Input '{}' for Single List block is not a list or not found. Available keys: [{}]. \
         Found value: {} (type: {})",
        name,
        context.key_list(),
        found.map(Value::to_string).unwrap_or_else(|| "none".to_string()),
        type_name(found)
    )))
}

/// Resolve a multi-list input by exact name.
pub fn resolve_named_list<'a>(context: &'a Context, name: &str) -> Result<&'a Vec<Value>, BlockError> {
    match context.get(name) {
        Some(Value::Array(items)) => Ok(items),
        other => Err(BlockError::ListResolution(format!(
            "Input list '{}' not found or not a list (type: {}).",
            name,
            type_name(other)
        ))),
    }
}

fn item_entries(prefix: &str, list_name: &str, item: &Value, index: usize) -> Map<String, Value> {
    let mut entries = Map::new();
    entries.insert(prefix.to_string(), item.clone());
    entries.insert(format!("{}_name", prefix), Value::String(list_name.to_string()));
    entries.insert(format!("{}_index", prefix), Value::from(index));
    entries
}

fn type_name(value: Option<&Value>) -> &'static str {
    match value {
        None => "missing",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "bool",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "list",
        Some(Value::Object(_)) => "object",
    }
}

/// First 100 characters of a template.
pub(crate) fn preview_of(template: &str) -> String {
    template.chars().take(100).collect()
}
