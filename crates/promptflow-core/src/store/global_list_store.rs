use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use crate::db::Database;
use crate::error::CoreError;
use crate::models::global_list::{CreateGlobalListInput, GlobalList, GlobalListItem};
use crate::store::to_dt;

#[derive(Clone)]
pub struct GlobalListStore {
    db: Database,
}

impl GlobalListStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a list and its items in one transaction.
    pub async fn create(&self, input: CreateGlobalListInput) -> Result<GlobalList, CoreError> {
        let list_id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let mut encoded = Vec::with_capacity(input.items.len());
        for value in &input.items {
            encoded.push((Uuid::new_v4().to_string(), serde_json::to_string(value)?));
        }

        let id = list_id.clone();
        self.db
            .with_conn_async(move |conn| {
                let tx = conn.unchecked_transaction()?;
                tx.execute(
                    "INSERT INTO global_lists (id, name, user_id, description, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    rusqlite::params![id, input.name, input.user_id, input.description, now],
                )?;
                for (index, (item_id, value)) in encoded.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO global_list_items (id, list_id, value, order_index)
                         VALUES (?1, ?2, ?3, ?4)",
                        rusqlite::params![item_id, id, value, index as i64],
                    )?;
                }
                tx.commit()
            })
            .await?;

        self.get(&list_id)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("Global list '{}' vanished after insert", list_id)))
    }

    /// Append an item at the end of a list.
    pub async fn add_item(&self, list_id: &str, value: &Value) -> Result<GlobalListItem, CoreError> {
        let item = GlobalListItem {
            id: Uuid::new_v4().to_string(),
            list_id: list_id.to_string(),
            value: value.clone(),
            order_index: 0,
        };
        let encoded = serde_json::to_string(value)?;
        let it = item.clone();
        let order_index = self
            .db
            .with_conn_async(move |conn| {
                let next: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(order_index) + 1, 0) FROM global_list_items WHERE list_id = ?1",
                    rusqlite::params![it.list_id],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "INSERT INTO global_list_items (id, list_id, value, order_index) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![it.id, it.list_id, encoded, next],
                )?;
                conn.execute(
                    "UPDATE global_lists SET updated_at = ?1 WHERE id = ?2",
                    rusqlite::params![Utc::now().timestamp_millis(), it.list_id],
                )?;
                Ok(next)
            })
            .await?;
        Ok(GlobalListItem { order_index, ..item })
    }

    pub async fn get(&self, id: &str) -> Result<Option<GlobalList>, CoreError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let list = conn
                    .query_row(
                        "SELECT id, name, user_id, description, created_at, updated_at
                         FROM global_lists WHERE id = ?1",
                        rusqlite::params![id],
                        |row| Ok(row_to_list(row)),
                    )
                    .optional()?;
                match list {
                    Some(mut list) => {
                        list.items = load_items(conn, &list.id)?;
                        Ok(Some(list))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    /// All lists owned by a user, each with its items in order.
    pub async fn list_by_owner(&self, user_id: &str) -> Result<Vec<GlobalList>, CoreError> {
        let user_id = user_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, user_id, description, created_at, updated_at
                     FROM global_lists WHERE user_id = ?1 ORDER BY name",
                )?;
                let mut lists = stmt
                    .query_map(rusqlite::params![user_id], |row| Ok(row_to_list(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                for list in &mut lists {
                    list.items = load_items(conn, &list.id)?;
                }
                Ok(lists)
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, CoreError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute("DELETE FROM global_lists WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }
}

fn load_items(conn: &Connection, list_id: &str) -> Result<Vec<GlobalListItem>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, list_id, value, order_index FROM global_list_items
         WHERE list_id = ?1 ORDER BY order_index",
    )?;
    let items = stmt
        .query_map(rusqlite::params![list_id], |row| {
            let value: Value = row
                .get::<_, String>(2)
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(Value::Null);
            Ok(GlobalListItem {
                id: row.get(0).unwrap_or_default(),
                list_id: row.get(1).unwrap_or_default(),
                value,
                order_index: row.get(3).unwrap_or(0),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

fn row_to_list(row: &rusqlite::Row<'_>) -> GlobalList {
    GlobalList {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        user_id: row.get(2).unwrap_or_default(),
        description: row.get(3).unwrap_or(None),
        items: Vec::new(),
        created_at: to_dt(row.get(4).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(5).ok()).unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_items_keep_their_order() {
        let store = GlobalListStore::new(Database::open_in_memory().unwrap());
        let list = store
            .create(CreateGlobalListInput {
                name: "Products".into(),
                user_id: "u1".into(),
                description: None,
                items: vec![json!("alpha"), json!({"sku": 2}), json!("gamma")],
            })
            .await
            .unwrap();
        store.add_item(&list.id, &json!("delta")).await.unwrap();

        let lists = store.list_by_owner("u1").await.unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(
            lists[0].values(),
            vec![json!("alpha"), json!({"sku": 2}), json!("gamma"), json!("delta")]
        );
        assert!(store.list_by_owner("someone-else").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_names_are_unique_per_owner() {
        let store = GlobalListStore::new(Database::open_in_memory().unwrap());
        let input = CreateGlobalListInput {
            name: "Tags".into(),
            user_id: "u1".into(),
            description: None,
            items: vec![],
        };
        store.create(input.clone()).await.unwrap();
        assert!(store.create(input).await.is_err());
    }
}
