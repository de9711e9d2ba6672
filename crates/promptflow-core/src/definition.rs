//! YAML sequence definitions.
//!
//! A definition describes a whole sequence so it can be checked and
//! imported in one go:
//!
//! ```yaml
//! name: "Product Copy"
//! description: "Outline, then one blurb per product"
//! default_model: "claude-3-opus-20240229"
//!
//! variables:
//!   - name: Audience
//!     role: input
//!     value: "developers"
//!   - name: tone
//!     role: global
//!     scope: user_global
//!     value: "friendly"
//!
//! global_lists:
//!   - name: Products
//!     items: ["Widget", "Gadget"]
//!
//! blocks:
//!   - name: Outline
//!     type: standard
//!     config:
//!       prompt: "Outline copy for <<Audience>> in a {{ tone }} tone."
//!       output_variable_name: outline
//!   - name: Blurbs
//!     type: single_list
//!     config:
//!       prompt: "{{ outline }}\n\nWrite a blurb for {{ item }}."
//!       input_list_variable_name: Products
//!       output_list_variable_name: blurbs
//! ```
//!
//! Blocks are ordered as listed.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::context::normalize_key;
use crate::engine::template::template_variables;
use crate::error::CoreError;
use crate::models::block::{BlockConfig, BlockType, CreateBlockInput};
use crate::models::global_list::CreateGlobalListInput;
use crate::models::sequence::Sequence;
use crate::models::variable::{CreateVariableInput, VariableRole, VariableScope};
use crate::state::AppStateInner;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Model used by blocks without their own override.
    #[serde(default)]
    pub default_model: Option<String>,

    #[serde(default)]
    pub variables: Vec<VariableDefinition>,

    /// Lists created for the importing user unless one with the same name
    /// already exists.
    #[serde(default)]
    pub global_lists: Vec<GlobalListDefinition>,

    #[serde(default)]
    pub blocks: Vec<BlockDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(default = "default_role")]
    pub role: VariableRole,
    #[serde(default)]
    pub scope: VariableScope,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_role() -> VariableRole {
    VariableRole::Input
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalListDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    /// Per-block model override.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub config: Value,
}

impl SequenceDefinition {
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::BadRequest(format!("Failed to parse sequence YAML: {}", e)))
    }

    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::BadRequest(format!("Failed to read sequence file '{}': {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Check the definition. Hard problems are errors; template references
    /// nothing in the definition provides come back as warnings, since they
    /// may still be supplied at run time.
    pub fn validate(&self) -> Result<Vec<String>, CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::BadRequest("Sequence name must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for var in &self.variables {
            if var.role == VariableRole::Output {
                return Err(CoreError::BadRequest(format!(
                    "Variable '{}': output variables are written by runs, not declared",
                    var.name
                )));
            }
            if !seen.insert((var.name.clone(), var.scope)) {
                return Err(CoreError::BadRequest(format!("Variable '{}' is declared twice", var.name)));
            }
        }

        let mut known: HashSet<String> = HashSet::new();
        for name in self
            .variables
            .iter()
            .map(|v| v.name.as_str())
            .chain(self.global_lists.iter().map(|l| l.name.as_str()))
        {
            known.insert(name.to_string());
            known.insert(normalize_key(name));
        }

        let mut warnings = Vec::new();
        let mut block_names = HashSet::new();
        for block in &self.blocks {
            if !block_names.insert(block.name.as_str()) {
                return Err(CoreError::BadRequest(format!("Block '{}' is declared twice", block.name)));
            }
            let config = BlockConfig::parse(block.block_type.as_str(), &block.config)
                .map_err(|e| CoreError::BadRequest(format!("Block '{}': {}", block.name, e)))?;

            let item_names: &[&str] = match config.block_type() {
                BlockType::SingleList => &["item", "item_index"],
                BlockType::MultiList => &[
                    "item1", "item1_name", "item1_index", "item2", "item2_name", "item2_index",
                ],
                BlockType::Standard | BlockType::Discretization => &[],
            };
            for reference in template_variables(config.prompt()) {
                if !known.contains(&reference) && !item_names.contains(&reference.as_str()) {
                    warnings.push(format!(
                        "Block '{}' references '{}', which no variable, list, or earlier block provides",
                        block.name, reference
                    ));
                }
            }
            known.extend(output_names(&config));
        }
        Ok(warnings)
    }

    /// Validate and store the definition as a new sequence of `user_id`.
    pub async fn import(&self, state: &AppStateInner, user_id: &str) -> Result<Sequence, CoreError> {
        for warning in self.validate()? {
            tracing::warn!("[Definition] {}", warning);
        }

        let sequence = Sequence::new(
            Uuid::new_v4().to_string(),
            self.name.clone(),
            self.description.clone(),
            user_id.to_string(),
            self.default_model.clone(),
        );
        state.sequence_store.save(&sequence).await?;

        for var in &self.variables {
            let sequence_id = match var.scope {
                VariableScope::Sequence => Some(sequence.id.clone()),
                VariableScope::UserGlobal => None,
            };
            state
                .variable_store
                .upsert(CreateVariableInput {
                    name: var.name.clone(),
                    user_id: user_id.to_string(),
                    sequence_id,
                    role: var.role,
                    value: var.value.clone(),
                    description: var.description.clone(),
                })
                .await?;
        }

        let existing: HashSet<String> = state
            .global_list_store
            .list_by_owner(user_id)
            .await?
            .into_iter()
            .map(|l| l.name)
            .collect();
        for list in &self.global_lists {
            if existing.contains(&list.name) {
                tracing::info!("[Definition] Keeping existing global list '{}'", list.name);
                continue;
            }
            state
                .global_list_store
                .create(CreateGlobalListInput {
                    name: list.name.clone(),
                    user_id: user_id.to_string(),
                    description: list.description.clone(),
                    items: list.items.clone(),
                })
                .await?;
        }

        for (order, block) in self.blocks.iter().enumerate() {
            state
                .block_store
                .create(CreateBlockInput {
                    sequence_id: sequence.id.clone(),
                    name: block.name.clone(),
                    block_type: block.block_type,
                    order: order as i64,
                    config: block.config.clone(),
                    llm_model_override: block.model.clone(),
                })
                .await?;
        }

        tracing::info!(
            "[Definition] Imported sequence '{}' ({}) with {} blocks",
            sequence.name,
            sequence.id,
            self.blocks.len()
        );
        Ok(sequence)
    }
}

fn output_names(config: &BlockConfig) -> Vec<String> {
    match config {
        BlockConfig::Standard(c) => vec![c.output_variable_name.clone()],
        BlockConfig::Discretization(c) => c.output_names.clone(),
        BlockConfig::SingleList(c) => vec![c.output_list_variable_name.clone()],
        BlockConfig::MultiList(c) => vec![c.output_matrix_variable_name.clone()],
    }
}
