use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::CoreError;
use crate::models::sequence::Sequence;
use crate::store::to_dt;

#[derive(Clone)]
pub struct SequenceStore {
    db: Database,
}

impl SequenceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, sequence: &Sequence) -> Result<(), CoreError> {
        let s = sequence.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO sequences (id, name, description, user_id, default_llm_model, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                       name = excluded.name,
                       description = excluded.description,
                       default_llm_model = excluded.default_llm_model,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        s.id,
                        s.name,
                        s.description,
                        s.user_id,
                        s.default_llm_model,
                        s.created_at.timestamp_millis(),
                        s.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Sequence>, CoreError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, name, description, user_id, default_llm_model, created_at, updated_at
                     FROM sequences WHERE id = ?1",
                    rusqlite::params![id],
                    |row| Ok(row_to_sequence(row)),
                )
                .optional()
            })
            .await
    }

    /// Fetch a sequence only if it belongs to `user_id`.
    pub async fn get_owned(&self, id: &str, user_id: &str) -> Result<Sequence, CoreError> {
        match self.get(id).await? {
            Some(s) if s.user_id == user_id => Ok(s),
            _ => Err(CoreError::NotFound(format!(
                "Sequence '{}' not found or not owned by user",
                id
            ))),
        }
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<Sequence>, CoreError> {
        let user_id = user_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, user_id, default_llm_model, created_at, updated_at
                     FROM sequences WHERE user_id = ?1 ORDER BY created_at DESC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![user_id], |row| Ok(row_to_sequence(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Delete a sequence. Its blocks, variables and runs go with it.
    pub async fn delete(&self, id: &str) -> Result<bool, CoreError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute("DELETE FROM sequences WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_sequence(row: &rusqlite::Row<'_>) -> Sequence {
    Sequence {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        description: row.get(2).unwrap_or(None),
        user_id: row.get(3).unwrap_or_default(),
        default_llm_model: row.get(4).unwrap_or(None),
        created_at: to_dt(row.get(5).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(6).ok()).unwrap_or_else(Utc::now),
    }
}
