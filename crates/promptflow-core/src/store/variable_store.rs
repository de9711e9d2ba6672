use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::Value;
use uuid::Uuid;

use crate::db::Database;
use crate::error::CoreError;
use crate::models::variable::{CreateVariableInput, Variable, VariableRole};
use crate::store::to_dt;

const SELECT_COLUMNS: &str = "SELECT id, name, user_id, sequence_id, role, value, description, \
                              created_at, updated_at FROM variables";

#[derive(Clone)]
pub struct VariableStore {
    db: Database,
}

impl VariableStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a variable, or replace the value and role of the one that
    /// already exists under the same `(name, user, sequence)`.
    pub async fn upsert(&self, input: CreateVariableInput) -> Result<Variable, CoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let name = input.name.clone();
        let user_id = input.user_id.clone();
        let sequence_id = input.sequence_id.clone();
        let value = serde_json::to_string(&input.value)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO variables (id, name, user_id, sequence_id, scope_key, role, value,
                     description, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                     ON CONFLICT(name, user_id, scope_key) DO UPDATE SET
                       role = excluded.role,
                       value = excluded.value,
                       description = COALESCE(excluded.description, variables.description),
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        id,
                        input.name,
                        input.user_id,
                        input.sequence_id,
                        scope_key(input.sequence_id.as_deref()),
                        input.role.as_str(),
                        value,
                        input.description,
                        now,
                    ],
                )?;
                Ok(())
            })
            .await?;

        self.get_by_name(&name, &user_id, sequence_id.as_deref())
            .await?
            .ok_or_else(|| CoreError::Internal(format!("Variable '{}' vanished after upsert", name)))
    }

    /// Record a block output as an `output`-role variable of the sequence.
    pub async fn upsert_output(
        &self,
        name: &str,
        value: &Value,
        user_id: &str,
        sequence_id: &str,
    ) -> Result<Variable, CoreError> {
        self.upsert(CreateVariableInput {
            name: name.to_string(),
            user_id: user_id.to_string(),
            sequence_id: Some(sequence_id.to_string()),
            role: VariableRole::Output,
            value: value.clone(),
            description: None,
        })
        .await
    }

    pub async fn get_by_name(
        &self,
        name: &str,
        user_id: &str,
        sequence_id: Option<&str>,
    ) -> Result<Option<Variable>, CoreError> {
        let name = name.to_string();
        let user_id = user_id.to_string();
        let scope = scope_key(sequence_id);
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("{} WHERE name = ?1 AND user_id = ?2 AND scope_key = ?3", SELECT_COLUMNS),
                    rusqlite::params![name, user_id, scope],
                    |row| Ok(row_to_variable(row)),
                )
                .optional()
            })
            .await
    }

    /// Variables scoped to one sequence, ordered by name.
    pub async fn list_by_sequence(&self, sequence_id: &str) -> Result<Vec<Variable>, CoreError> {
        let sequence_id = sequence_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE sequence_id = ?1 ORDER BY name",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![sequence_id], |row| Ok(row_to_variable(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// A user's variables that are not bound to any sequence, ordered by name.
    pub async fn list_user_globals(&self, user_id: &str) -> Result<Vec<Variable>, CoreError> {
        let user_id = user_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE user_id = ?1 AND sequence_id IS NULL ORDER BY name",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![user_id], |row| Ok(row_to_variable(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, CoreError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute("DELETE FROM variables WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }
}

/// SQLite treats NULLs as distinct in UNIQUE constraints, so user-global
/// variables are keyed by an empty scope instead.
fn scope_key(sequence_id: Option<&str>) -> String {
    sequence_id.unwrap_or_default().to_string()
}

fn row_to_variable(row: &rusqlite::Row<'_>) -> Variable {
    let value: Value = row
        .get::<_, String>(5)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null);

    Variable {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        user_id: row.get(2).unwrap_or_default(),
        sequence_id: row.get(3).unwrap_or(None),
        role: VariableRole::from_str(&row.get::<_, String>(4).unwrap_or_default())
            .unwrap_or(VariableRole::Global),
        value,
        description: row.get(6).unwrap_or(None),
        created_at: to_dt(row.get(7).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(8).ok()).unwrap_or_else(Utc::now),
    }
}
