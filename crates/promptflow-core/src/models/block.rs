use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BlockError;

/// The four kinds of block the engine knows how to execute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Standard,
    Discretization,
    SingleList,
    MultiList,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Discretization => "discretization",
            Self::SingleList => "single_list",
            Self::MultiList => "multi_list",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(Self::Standard),
            "discretization" => Some(Self::Discretization),
            "single_list" => Some(Self::SingleList),
            "multi_list" => Some(Self::MultiList),
            _ => None,
        }
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Type-specific configs ─────────────────────────────────────────────────

/// One LLM call; the whole response becomes `output_variable_name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StandardConfig {
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_output_variable_name")]
    pub output_variable_name: String,
}

/// One LLM call whose response is split into several named values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscretizationConfig {
    pub prompt: String,
    pub output_names: Vec<String>,
}

/// One LLM call per item of an input list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SingleListConfig {
    pub prompt: String,
    pub input_list_variable_name: String,
    #[serde(default = "default_output_list_variable_name")]
    pub output_list_variable_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListInput {
    pub name: String,
}

/// One LLM call per cell of the cross product of up to two input lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MultiListConfig {
    pub prompt: String,
    #[serde(default)]
    pub input_lists_config: Vec<ListInput>,
    #[serde(default = "default_output_matrix_variable_name")]
    pub output_matrix_variable_name: String,
}

fn default_output_variable_name() -> String {
    "output".to_string()
}

fn default_output_list_variable_name() -> String {
    "processed_list".to_string()
}

fn default_output_matrix_variable_name() -> String {
    "comparison_matrix".to_string()
}

/// A block's configuration, typed by its block type.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockConfig {
    Standard(StandardConfig),
    Discretization(DiscretizationConfig),
    SingleList(SingleListConfig),
    MultiList(MultiListConfig),
}

impl BlockConfig {
    /// Parse a stored `(type, config)` pair.
    pub fn parse(block_type: &str, config: &Value) -> Result<Self, BlockError> {
        let Some(kind) = BlockType::from_str(block_type) else {
            return Err(BlockError::UnsupportedBlockType(block_type.to_string()));
        };
        let parsed = match kind {
            BlockType::Standard => Self::Standard(decode(kind, config)?),
            BlockType::Discretization => {
                let cfg: DiscretizationConfig = decode(kind, config)?;
                if cfg.output_names.is_empty() {
                    return Err(BlockError::Configuration(
                        "Discretization block requires at least one output name.".to_string(),
                    ));
                }
                Self::Discretization(cfg)
            }
            BlockType::SingleList => Self::SingleList(decode(kind, config)?),
            BlockType::MultiList => Self::MultiList(decode(kind, config)?),
        };
        Ok(parsed)
    }

    pub fn block_type(&self) -> BlockType {
        match self {
            Self::Standard(_) => BlockType::Standard,
            Self::Discretization(_) => BlockType::Discretization,
            Self::SingleList(_) => BlockType::SingleList,
            Self::MultiList(_) => BlockType::MultiList,
        }
    }

    pub fn prompt(&self) -> &str {
        match self {
            Self::Standard(c) => &c.prompt,
            Self::Discretization(c) => &c.prompt,
            Self::SingleList(c) => &c.prompt,
            Self::MultiList(c) => &c.prompt,
        }
    }

    /// Serialize back to the stored JSON shape.
    pub fn to_value(&self) -> Value {
        let value = match self {
            Self::Standard(c) => serde_json::to_value(c),
            Self::Discretization(c) => serde_json::to_value(c),
            Self::SingleList(c) => serde_json::to_value(c),
            Self::MultiList(c) => serde_json::to_value(c),
        };
        value.unwrap_or(Value::Null)
    }
}

fn decode<T: DeserializeOwned>(kind: BlockType, config: &Value) -> Result<T, BlockError> {
    // A missing config behaves like an empty object so field defaults apply.
    let config = if config.is_null() {
        Value::Object(Default::default())
    } else {
        config.clone()
    };
    serde_json::from_value(config)
        .map_err(|e| BlockError::Configuration(format!("{} block: {}", kind, e)))
}

// ─── Block ─────────────────────────────────────────────────────────────────

/// One typed step of a sequence.
///
/// `block_type` and `config` are kept as stored; [`Block::parsed_config`]
/// turns them into a [`BlockConfig`] at execution time so that a malformed
/// row fails only the block that carries it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: String,
    pub sequence_id: String,
    pub name: String,
    pub block_type: String,
    /// Position within the sequence; unique per sequence.
    pub order: i64,
    pub config: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_model_override: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Block {
    pub fn parsed_config(&self) -> Result<BlockConfig, BlockError> {
        BlockConfig::parse(&self.block_type, &self.config)
    }
}

/// Input for creating a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBlockInput {
    pub sequence_id: String,
    pub name: String,
    pub block_type: BlockType,
    pub order: i64,
    pub config: Value,
    #[serde(default)]
    pub llm_model_override: Option<String>,
}
