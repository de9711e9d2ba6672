use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status shared by runs and block runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One execution attempt of a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub sequence_id: String,
    pub user_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_overrides: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_summary: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_model_override: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(
        id: String,
        sequence_id: String,
        user_id: String,
        input_overrides: Option<Map<String, Value>>,
        llm_model_override: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            sequence_id,
            user_id,
            status: RunStatus::Pending,
            started_at: None,
            completed_at: None,
            input_overrides,
            results_summary: None,
            error_message: None,
            llm_model_override,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Structured output of a block run. Which variant is present is decided
/// by the type of the block that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockOutput {
    /// Standard and discretization blocks.
    Named { values: Map<String, Value> },
    /// Single-list blocks.
    List { name: String, values: Vec<Value> },
    /// Multi-list blocks; row-major.
    Matrix { name: String, values: Vec<Vec<Value>> },
}

impl BlockOutput {
    /// The `{name: value}` entries this output contributes to a context.
    pub fn to_context_delta(&self) -> Map<String, Value> {
        match self {
            Self::Named { values } => values.clone(),
            Self::List { name, values } => {
                let mut delta = Map::new();
                delta.insert(name.clone(), Value::Array(values.clone()));
                delta
            }
            Self::Matrix { name, values } => {
                let rows = values.iter().cloned().map(Value::Array).collect();
                let mut delta = Map::new();
                delta.insert(name.clone(), Value::Array(rows));
                delta
            }
        }
    }
}

/// Execution record of one block inside one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRun {
    pub id: String,
    pub run_id: String,
    /// `None` once the originating block has been deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub block_name_snapshot: String,
    pub block_type_snapshot: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<BlockOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl BlockRun {
    /// A fresh `running` record for `block_id` in `run_id`.
    pub fn start(
        id: String,
        run_id: String,
        block_id: String,
        block_name: String,
        block_type: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            run_id,
            block_id: Some(block_id),
            status: RunStatus::Running,
            started_at: Some(now),
            completed_at: None,
            block_name_snapshot: block_name,
            block_type_snapshot: block_type,
            rendered_prompt: None,
            raw_output: None,
            output: None,
            error_message: None,
            updated_at: now,
        }
    }

    /// Key of this block run in its run's results summary.
    pub fn summary_key(&self) -> String {
        summary_key(
            self.block_id.as_deref().unwrap_or("deleted"),
            &self.block_name_snapshot,
        )
    }
}

/// `block_<id>_<name>` with spaces in the name turned into underscores.
pub fn summary_key(block_id: &str, block_name: &str) -> String {
    format!("block_{}_{}", block_id, block_name.replace(' ', "_"))
}

/// A run together with its block runs in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub block_runs: Vec<BlockRun>,
}
