use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a variable is used for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VariableRole {
    /// Fixed value shared by every run.
    Global,
    /// Expected at run time; the stored value is only a default.
    Input,
    /// Written by the engine from a block's output.
    Output,
}

impl VariableRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Input => "input",
            Self::Output => "output",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "global" => Some(Self::Global),
            "input" => Some(Self::Input),
            "output" => Some(Self::Output),
            _ => None,
        }
    }
}

/// Where a variable is visible.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    UserGlobal,
    #[default]
    Sequence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub id: String,
    pub name: String,
    pub user_id: String,
    /// `None` for user-global variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<String>,
    pub role: VariableRole,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Variable {
    pub fn scope(&self) -> VariableScope {
        if self.sequence_id.is_some() {
            VariableScope::Sequence
        } else {
            VariableScope::UserGlobal
        }
    }
}

/// Input for creating (or replacing) a variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVariableInput {
    pub name: String,
    pub user_id: String,
    #[serde(default)]
    pub sequence_id: Option<String>,
    pub role: VariableRole,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub description: Option<String>,
}
