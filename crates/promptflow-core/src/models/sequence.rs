use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An ordered collection of blocks owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sequence {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_llm_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sequence {
    pub fn new(
        id: String,
        name: String,
        description: Option<String>,
        user_id: String,
        default_llm_model: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            description,
            user_id,
            default_llm_model,
            created_at: now,
            updated_at: now,
        }
    }
}
