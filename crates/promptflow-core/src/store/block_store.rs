use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::Value;
use uuid::Uuid;

use crate::db::Database;
use crate::error::CoreError;
use crate::models::block::{Block, CreateBlockInput};
use crate::store::to_dt;

const SELECT_COLUMNS: &str = "SELECT id, sequence_id, name, type, position, config, llm_model_override, \
                              created_at, updated_at FROM blocks";

#[derive(Clone)]
pub struct BlockStore {
    db: Database,
}

impl BlockStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, input: CreateBlockInput) -> Result<Block, CoreError> {
        let now = Utc::now();
        let block = Block {
            id: Uuid::new_v4().to_string(),
            sequence_id: input.sequence_id,
            name: input.name,
            block_type: input.block_type.as_str().to_string(),
            order: input.order,
            config: input.config,
            llm_model_override: input.llm_model_override,
            created_at: now,
            updated_at: now,
        };
        let b = block.clone();
        let config = serde_json::to_string(&b.config)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO blocks (id, sequence_id, name, type, position, config,
                     llm_model_override, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        b.id,
                        b.sequence_id,
                        b.name,
                        b.block_type,
                        b.order,
                        config,
                        b.llm_model_override,
                        b.created_at.timestamp_millis(),
                        b.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(block)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Block>, CoreError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_block(row)),
                )
                .optional()
            })
            .await
    }

    /// Blocks of a sequence in ascending order.
    pub async fn list_by_sequence(&self, sequence_id: &str) -> Result<Vec<Block>, CoreError> {
        let sequence_id = sequence_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE sequence_id = ?1 ORDER BY position",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![sequence_id], |row| Ok(row_to_block(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, CoreError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute("DELETE FROM blocks WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_block(row: &rusqlite::Row<'_>) -> Block {
    let config: Value = row
        .get::<_, String>(5)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null);

    Block {
        id: row.get(0).unwrap_or_default(),
        sequence_id: row.get(1).unwrap_or_default(),
        name: row.get(2).unwrap_or_default(),
        block_type: row.get(3).unwrap_or_default(),
        order: row.get(4).unwrap_or(0),
        config,
        llm_model_override: row.get(6).unwrap_or(None),
        created_at: to_dt(row.get(7).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(8).ok()).unwrap_or_else(Utc::now),
    }
}
