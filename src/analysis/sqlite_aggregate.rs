//! SQLite implementation of AggregateStore.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use super::aggregate::{Aggregate, AggregateStore};

/// Aggregate store sharing the task store's database, so aggregates outlive
/// the process the same way task checkpoints do.
#[derive(Clone)]
pub struct SqliteAggregateStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct AggregateRow {
    id: String,
    owner_id: String,
    contributions: String,
    revision: i64,
}

impl TryFrom<AggregateRow> for Aggregate {
    type Error = anyhow::Error;

    fn try_from(row: AggregateRow) -> Result<Self, Self::Error> {
        Ok(Aggregate {
            contributions: serde_json::from_str(&row.contributions)
                .with_context(|| format!("decoding contributions of aggregate {}", row.id))?,
            id: row.id,
            owner_id: row.owner_id,
            revision: row.revision.max(0) as u64,
        })
    }
}

impl SqliteAggregateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the aggregates table.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS waypoint_aggregates (
                seq INTEGER PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                owner_id TEXT NOT NULL,
                contributions TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating waypoint_aggregates")?;
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for SqliteAggregateStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Aggregate>> {
        let row: Option<AggregateRow> = sqlx::query_as(
            "SELECT id, owner_id, contributions, revision FROM waypoint_aggregates WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Aggregate::try_from).transpose()
    }

    async fn create(
        &self,
        owner_id: &str,
        contributions: BTreeMap<String, serde_json::Value>,
    ) -> anyhow::Result<Aggregate> {
        // Ids follow the row sequence: agg-1, agg-2, ...
        let row: AggregateRow = sqlx::query_as(
            r#"
            INSERT INTO waypoint_aggregates (id, owner_id, contributions, revision)
            VALUES (
                'agg-' || (SELECT IFNULL(MAX(seq), 0) + 1 FROM waypoint_aggregates),
                ?, ?, 1
            )
            RETURNING id, owner_id, contributions, revision
            "#,
        )
        .bind(owner_id)
        .bind(serde_json::to_string(&contributions)?)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn replace(
        &self,
        id: &str,
        contributions: BTreeMap<String, serde_json::Value>,
    ) -> anyhow::Result<Aggregate> {
        let row: Option<AggregateRow> = sqlx::query_as(
            r#"
            UPDATE waypoint_aggregates
            SET contributions = ?, revision = revision + 1
            WHERE id = ?
            RETURNING id, owner_id, contributions, revision
            "#,
        )
        .bind(serde_json::to_string(&contributions)?)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| anyhow!("aggregate {id} not found"))?
            .try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_store() -> SqliteAggregateStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteAggregateStore::new(pool);
        store.run_migrations().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_create_get_replace() {
        let store = setup_store().await;
        let first = store
            .create("client-1", BTreeMap::from([("a".to_string(), json!({"score": 1}))]))
            .await
            .unwrap();
        let second = store.create("client-2", BTreeMap::new()).await.unwrap();
        assert_eq!(first.id, "agg-1");
        assert_eq!(second.id, "agg-2");
        assert_eq!(first.revision, 1);

        assert_eq!(store.get(&first.id).await.unwrap(), Some(first.clone()));
        assert_eq!(store.get("agg-9").await.unwrap(), None);

        let replaced = store
            .replace(&first.id, BTreeMap::from([("b".to_string(), json!(2))]))
            .await
            .unwrap();
        assert_eq!(replaced.id, first.id);
        assert_eq!(replaced.owner_id, "client-1");
        assert_eq!(replaced.revision, 2);
        assert_eq!(replaced.contributions["b"], json!(2));
        assert!(store.replace("agg-9", BTreeMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_aggregates_survive_a_new_store_on_the_same_pool() {
        let store = setup_store().await;
        let created = store
            .create("client-1", BTreeMap::from([("a".to_string(), json!(1))]))
            .await
            .unwrap();

        let reopened = SqliteAggregateStore::new(store.pool.clone());
        reopened.run_migrations().await.unwrap();
        assert_eq!(reopened.get(&created.id).await.unwrap(), Some(created));
    }
}
