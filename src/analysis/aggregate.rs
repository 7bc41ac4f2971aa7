//! Aggregate results produced by the save step.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// The materialized result of an analysis: one contribution per unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub id: String,
    pub owner_id: String,
    pub contributions: BTreeMap<String, serde_json::Value>,
    /// Bumped on every replace.
    pub revision: u64,
}

/// Storage for aggregates.
#[async_trait]
pub trait AggregateStore: Send + Sync + 'static {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Aggregate>>;

    async fn create(
        &self,
        owner_id: &str,
        contributions: BTreeMap<String, serde_json::Value>,
    ) -> anyhow::Result<Aggregate>;

    /// Replace the contributions of an existing aggregate.
    async fn replace(
        &self,
        id: &str,
        contributions: BTreeMap<String, serde_json::Value>,
    ) -> anyhow::Result<Aggregate>;
}

#[async_trait]
impl<T: AggregateStore + ?Sized> AggregateStore for Arc<T> {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Aggregate>> {
        (**self).get(id).await
    }

    async fn create(
        &self,
        owner_id: &str,
        contributions: BTreeMap<String, serde_json::Value>,
    ) -> anyhow::Result<Aggregate> {
        (**self).create(owner_id, contributions).await
    }

    async fn replace(
        &self,
        id: &str,
        contributions: BTreeMap<String, serde_json::Value>,
    ) -> anyhow::Result<Aggregate> {
        (**self).replace(id, contributions).await
    }
}

/// Aggregate store kept in memory, for tests and embedding.
#[derive(Default)]
pub struct InMemoryAggregateStore {
    aggregates: RwLock<HashMap<String, Aggregate>>,
    next_id: AtomicU64,
}

impl InMemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `aggregate` as is, replacing any aggregate with the same id.
    pub async fn insert(&self, aggregate: Aggregate) {
        self.aggregates
            .write()
            .await
            .insert(aggregate.id.clone(), aggregate);
    }

    pub async fn len(&self) -> usize {
        self.aggregates.read().await.len()
    }
}

#[async_trait]
impl AggregateStore for InMemoryAggregateStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Aggregate>> {
        Ok(self.aggregates.read().await.get(id).cloned())
    }

    async fn create(
        &self,
        owner_id: &str,
        contributions: BTreeMap<String, serde_json::Value>,
    ) -> anyhow::Result<Aggregate> {
        let id = format!("agg-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let aggregate = Aggregate {
            id: id.clone(),
            owner_id: owner_id.to_string(),
            contributions,
            revision: 1,
        };
        self.aggregates.write().await.insert(id, aggregate.clone());
        Ok(aggregate)
    }

    async fn replace(
        &self,
        id: &str,
        contributions: BTreeMap<String, serde_json::Value>,
    ) -> anyhow::Result<Aggregate> {
        let mut aggregates = self.aggregates.write().await;
        let aggregate = aggregates
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("aggregate {id} not found"))?;
        aggregate.contributions = contributions;
        aggregate.revision += 1;
        Ok(aggregate.clone())
    }
}
