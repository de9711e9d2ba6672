use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::Database;
use crate::error::CoreError;
use crate::models::run::{BlockOutput, BlockRun, Run, RunDetail, RunStatus};
use crate::store::to_dt;

const RUN_COLUMNS: &str = "SELECT id, sequence_id, user_id, status, started_at, completed_at, \
                           input_overrides, results_summary, error_message, llm_model_override, \
                           created_at, updated_at FROM runs";

const BLOCK_RUN_COLUMNS: &str = "SELECT id, run_id, block_id, status, started_at, completed_at, \
                                 block_name_snapshot, block_type_snapshot, rendered_prompt, raw_output, \
                                 named_outputs, list_outputs, matrix_outputs, error_message, updated_at \
                                 FROM block_runs";

/// Persists runs and the block runs they own.
#[derive(Clone)]
pub struct RunStore {
    db: Database,
}

impl RunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or fully rewrite a run.
    pub async fn save(&self, run: &Run) -> Result<(), CoreError> {
        let r = run.clone();
        let overrides = encode_map(&r.input_overrides)?;
        let summary = encode_map(&r.results_summary)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO runs (id, sequence_id, user_id, status, started_at, completed_at,
                     input_overrides, results_summary, error_message, llm_model_override, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(id) DO UPDATE SET
                       status = excluded.status,
                       started_at = excluded.started_at,
                       completed_at = excluded.completed_at,
                       input_overrides = excluded.input_overrides,
                       results_summary = excluded.results_summary,
                       error_message = excluded.error_message,
                       llm_model_override = excluded.llm_model_override,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        r.id,
                        r.sequence_id,
                        r.user_id,
                        r.status.as_str(),
                        r.started_at.map(|t| t.timestamp_millis()),
                        r.completed_at.map(|t| t.timestamp_millis()),
                        overrides,
                        summary,
                        r.error_message,
                        r.llm_model_override,
                        r.created_at.timestamp_millis(),
                        r.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Run>, CoreError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("{} WHERE id = ?1", RUN_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_run(row)),
                )
                .optional()
            })
            .await
    }

    /// Fetch a run only if it was started by `user_id`.
    pub async fn get_owned(&self, id: &str, user_id: &str) -> Result<Run, CoreError> {
        match self.get(id).await? {
            Some(r) if r.user_id == user_id => Ok(r),
            _ => Err(CoreError::NotFound(format!(
                "Run '{}' not found or not owned by user",
                id
            ))),
        }
    }

    pub async fn list_by_sequence(&self, sequence_id: &str) -> Result<Vec<Run>, CoreError> {
        let sequence_id = sequence_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE sequence_id = ?1 ORDER BY created_at DESC, rowid DESC",
                    RUN_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![sequence_id], |row| Ok(row_to_run(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// A run with its block runs in execution order.
    pub async fn get_detail(&self, id: &str) -> Result<Option<RunDetail>, CoreError> {
        let Some(run) = self.get(id).await? else {
            return Ok(None);
        };
        let block_runs = self.list_block_runs(id).await?;
        Ok(Some(RunDetail { run, block_runs }))
    }

    // ─── Block runs ────────────────────────────────────────────────────────

    /// Insert or fully rewrite a block run.
    pub async fn save_block_run(&self, block_run: &BlockRun) -> Result<(), CoreError> {
        let br = block_run.clone();
        let (named, list, matrix) = encode_output(&br.output)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO block_runs (id, run_id, block_id, status, started_at, completed_at,
                     block_name_snapshot, block_type_snapshot, rendered_prompt, raw_output,
                     named_outputs, list_outputs, matrix_outputs, error_message, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                     ON CONFLICT(id) DO UPDATE SET
                       status = excluded.status,
                       completed_at = excluded.completed_at,
                       rendered_prompt = excluded.rendered_prompt,
                       raw_output = excluded.raw_output,
                       named_outputs = excluded.named_outputs,
                       list_outputs = excluded.list_outputs,
                       matrix_outputs = excluded.matrix_outputs,
                       error_message = excluded.error_message,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        br.id,
                        br.run_id,
                        br.block_id,
                        br.status.as_str(),
                        br.started_at.map(|t| t.timestamp_millis()),
                        br.completed_at.map(|t| t.timestamp_millis()),
                        br.block_name_snapshot,
                        br.block_type_snapshot,
                        br.rendered_prompt,
                        br.raw_output,
                        named,
                        list,
                        matrix,
                        br.error_message,
                        br.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_block_run(&self, id: &str) -> Result<Option<BlockRun>, CoreError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("{} WHERE id = ?1", BLOCK_RUN_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_block_run(row)),
                )
                .optional()
            })
            .await
    }

    /// Block runs of a run ordered by start time (insertion order breaks ties).
    pub async fn list_block_runs(&self, run_id: &str) -> Result<Vec<BlockRun>, CoreError> {
        let run_id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE run_id = ?1 ORDER BY started_at, rowid",
                    BLOCK_RUN_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![run_id], |row| Ok(row_to_block_run(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

/// Stored shape of list and matrix outputs.
#[derive(Serialize, Deserialize)]
struct NamedValues<T> {
    name: String,
    values: T,
}

fn encode_map(map: &Option<Map<String, Value>>) -> Result<Option<String>, CoreError> {
    Ok(match map {
        Some(m) => Some(serde_json::to_string(m)?),
        None => None,
    })
}

type OutputColumns = (Option<String>, Option<String>, Option<String>);

fn encode_output(output: &Option<BlockOutput>) -> Result<OutputColumns, CoreError> {
    Ok(match output {
        None => (None, None, None),
        Some(BlockOutput::Named { values }) => (Some(serde_json::to_string(values)?), None, None),
        Some(BlockOutput::List { name, values }) => {
            let stored = NamedValues { name: name.clone(), values };
            (None, Some(serde_json::to_string(&stored)?), None)
        }
        Some(BlockOutput::Matrix { name, values }) => {
            let stored = NamedValues { name: name.clone(), values };
            (None, None, Some(serde_json::to_string(&stored)?))
        }
    })
}

fn decode_output(named: Option<String>, list: Option<String>, matrix: Option<String>) -> Option<BlockOutput> {
    if let Some(values) = named.and_then(|s| serde_json::from_str::<Map<String, Value>>(&s).ok()) {
        return Some(BlockOutput::Named { values });
    }
    if let Some(stored) = list.and_then(|s| serde_json::from_str::<NamedValues<Vec<Value>>>(&s).ok()) {
        return Some(BlockOutput::List {
            name: stored.name,
            values: stored.values,
        });
    }
    matrix
        .and_then(|s| serde_json::from_str::<NamedValues<Vec<Vec<Value>>>>(&s).ok())
        .map(|stored| BlockOutput::Matrix {
            name: stored.name,
            values: stored.values,
        })
}

fn decode_map(raw: Option<String>) -> Option<Map<String, Value>> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Run {
    Run {
        id: row.get(0).unwrap_or_default(),
        sequence_id: row.get(1).unwrap_or_default(),
        user_id: row.get(2).unwrap_or_default(),
        status: RunStatus::from_str(&row.get::<_, String>(3).unwrap_or_default()),
        started_at: to_dt(row.get(4).unwrap_or(None)),
        completed_at: to_dt(row.get(5).unwrap_or(None)),
        input_overrides: decode_map(row.get(6).unwrap_or(None)),
        results_summary: decode_map(row.get(7).unwrap_or(None)),
        error_message: row.get(8).unwrap_or(None),
        llm_model_override: row.get(9).unwrap_or(None),
        created_at: to_dt(row.get(10).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(11).ok()).unwrap_or_else(Utc::now),
    }
}

fn row_to_block_run(row: &rusqlite::Row<'_>) -> BlockRun {
    BlockRun {
        id: row.get(0).unwrap_or_default(),
        run_id: row.get(1).unwrap_or_default(),
        block_id: row.get(2).unwrap_or(None),
        status: RunStatus::from_str(&row.get::<_, String>(3).unwrap_or_default()),
        started_at: to_dt(row.get(4).unwrap_or(None)),
        completed_at: to_dt(row.get(5).unwrap_or(None)),
        block_name_snapshot: row.get(6).unwrap_or_default(),
        block_type_snapshot: row.get(7).unwrap_or_default(),
        rendered_prompt: row.get(8).unwrap_or(None),
        raw_output: row.get(9).unwrap_or(None),
        output: decode_output(
            row.get(10).unwrap_or(None),
            row.get(11).unwrap_or(None),
            row.get(12).unwrap_or(None),
        ),
        error_message: row.get(13).unwrap_or(None),
        updated_at: to_dt(row.get(14).ok()).unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::block::{BlockType, CreateBlockInput};
    use crate::models::sequence::Sequence;
    use crate::store::{BlockStore, SequenceStore};
    use serde_json::json;

    async fn setup() -> RunStore {
        let db = Database::open_in_memory().unwrap();
        SequenceStore::new(db.clone())
            .save(&Sequence::new("s1".into(), "Seq".into(), None, "u1".into(), None))
            .await
            .unwrap();
        RunStore::new(db)
    }

    async fn add_block(store: &RunStore, order: i64, block_type: BlockType) -> String {
        BlockStore::new(store.db.clone())
            .create(CreateBlockInput {
                sequence_id: "s1".into(),
                name: format!("Block {}", order),
                block_type,
                order,
                config: json!({}),
                llm_model_override: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_output_columns_follow_output_kind() {
        let store = setup().await;
        let list_block = add_block(&store, 0, BlockType::SingleList).await;
        let matrix_block = add_block(&store, 1, BlockType::MultiList).await;
        let run = Run::new("r1".into(), "s1".into(), "u1".into(), None, None);
        store.save(&run).await.unwrap();

        let mut list_run = BlockRun::start(
            "br1".into(),
            "r1".into(),
            list_block,
            "Summaries".into(),
            "single_list".into(),
        );
        list_run.output = Some(BlockOutput::List {
            name: "summaries".into(),
            values: vec![json!("a"), json!("b")],
        });
        store.save_block_run(&list_run).await.unwrap();

        let mut matrix_run = BlockRun::start(
            "br2".into(),
            "r1".into(),
            matrix_block,
            "Compare".into(),
            "multi_list".into(),
        );
        matrix_run.output = Some(BlockOutput::Matrix {
            name: "grid".into(),
            values: vec![vec![json!("x")]],
        });
        store.save_block_run(&matrix_run).await.unwrap();

        let runs = store.list_block_runs("r1").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].output, list_run.output);
        assert_eq!(runs[1].output, matrix_run.output);

        let (named, list, matrix): (Option<String>, Option<String>, Option<String>) = store
            .db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT named_outputs, list_outputs, matrix_outputs FROM block_runs WHERE id = 'br1'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
            })
            .unwrap();
        assert!(named.is_none());
        assert!(matrix.is_none());
        assert_eq!(
            serde_json::from_str::<Value>(&list.unwrap()).unwrap(),
            json!({"name": "summaries", "values": ["a", "b"]})
        );
    }

    #[tokio::test]
    async fn test_get_owned_hides_other_users_runs() {
        let store = setup().await;
        let mut overrides = Map::new();
        overrides.insert("topic".into(), json!("rust"));
        store
            .save(&Run::new("r1".into(), "s1".into(), "u1".into(), Some(overrides.clone()), None))
            .await
            .unwrap();

        let run = store.get_owned("r1", "u1").await.unwrap();
        assert_eq!(run.input_overrides, Some(overrides));
        assert!(matches!(
            store.get_owned("r1", "u2").await,
            Err(CoreError::NotFound(_))
        ));
    }
}
