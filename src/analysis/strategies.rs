//! Step strategies of the analysis pipeline.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::aggregate::AggregateStore;
use super::diff::{splice, UnitPartition};
use super::{
    AnalysisData, AnalysisParams, AnalyzeStrategy, FetchStrategy, RefreshParams, SaveStrategy,
    UnitOptions,
};
use crate::config::EngineConfig;
use crate::context::StepContext;
use crate::retry::RetryPolicy;
use crate::step::StepError;
use crate::unit::{ProcessingError, UnitContext, UnitFailurePolicy, WorkUnit, WorkUnitProcessor};

/// Where the work units of an owner come from.
#[async_trait]
pub trait UnitSource: Send + Sync + 'static {
    async fn load(
        &self,
        owner_id: &str,
        options: &serde_json::Value,
    ) -> anyhow::Result<Vec<WorkUnit>>;
}

#[async_trait]
impl<T: UnitSource + ?Sized> UnitSource for Arc<T> {
    async fn load(
        &self,
        owner_id: &str,
        options: &serde_json::Value,
    ) -> anyhow::Result<Vec<WorkUnit>> {
        (**self).load(owner_id, options).await
    }
}

/// Units held in memory per owner.
#[derive(Default)]
pub struct InMemoryUnitSource {
    units: RwLock<HashMap<String, Vec<WorkUnit>>>,
}

impl InMemoryUnitSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, owner_id: &str, units: Vec<WorkUnit>) {
        self.units.write().await.insert(owner_id.to_string(), units);
    }
}

#[async_trait]
impl UnitSource for InMemoryUnitSource {
    async fn load(
        &self,
        owner_id: &str,
        _options: &serde_json::Value,
    ) -> anyhow::Result<Vec<WorkUnit>> {
        Ok(self
            .units
            .read()
            .await
            .get(owner_id)
            .cloned()
            .unwrap_or_default())
    }
}

fn check_options(options: &serde_json::Value) -> anyhow::Result<()> {
    if !(options.is_null() || options.is_object()) {
        bail!("options must be an object");
    }
    Ok(())
}

/// Fetch step of the full analysis: every unit of the owner.
pub struct LoadUnits<U> {
    source: U,
}

impl<U> LoadUnits<U> {
    pub fn new(source: U) -> Self {
        Self { source }
    }
}

#[async_trait]
impl<U: UnitSource> FetchStrategy for LoadUnits<U> {
    type Params = AnalysisParams;

    fn validate(&self, params: &AnalysisParams) -> anyhow::Result<()> {
        check_options(&params.options)
    }

    async fn fetch(
        &self,
        ctx: &mut StepContext<'_, AnalysisParams, AnalysisData>,
    ) -> Result<(), StepError> {
        let units = self
            .source
            .load(ctx.owner_id(), &ctx.params().options)
            .await
            .map_err(StepError::failed)?;
        info!(task_id = %ctx.task_id(), units = units.len(), "Loaded work units");

        ctx.data_mut().units = units;
        Ok(())
    }
}

/// Fetch step of the refresh: current units, with unchanged ones seeded
/// from the existing aggregate.
pub struct SeedUnchanged<U, G> {
    source: U,
    aggregates: G,
}

impl<U, G> SeedUnchanged<U, G> {
    pub fn new(source: U, aggregates: G) -> Self {
        Self { source, aggregates }
    }
}

#[async_trait]
impl<U: UnitSource, G: AggregateStore> FetchStrategy for SeedUnchanged<U, G> {
    type Params = RefreshParams;

    fn validate(&self, params: &RefreshParams) -> anyhow::Result<()> {
        if params.aggregate_id.trim().is_empty() {
            bail!("aggregateId is required");
        }
        check_options(&params.options)
    }

    async fn fetch(
        &self,
        ctx: &mut StepContext<'_, RefreshParams, AnalysisData>,
    ) -> Result<(), StepError> {
        let params = ctx.params();
        let aggregate = self
            .aggregates
            .get(&params.aggregate_id)
            .await
            .map_err(StepError::failed)?
            .ok_or_else(|| StepError::failed(anyhow!("aggregate {} not found", params.aggregate_id)))?;
        if aggregate.owner_id != ctx.owner_id() {
            return Err(StepError::failed(anyhow!(
                "aggregate {} belongs to another owner",
                aggregate.id
            )));
        }

        let units = self
            .source
            .load(ctx.owner_id(), &params.options)
            .await
            .map_err(StepError::failed)?;
        let partition = UnitPartition::new(params.unchanged.iter().cloned(), params.changed.iter().cloned());

        let task_id = ctx.task_id();
        let data = ctx.data_mut();
        *data = AnalysisData {
            units,
            aggregate_id: Some(aggregate.id.clone()),
            ..AnalysisData::default()
        };
        let seeded = partition.seed(data, &aggregate.contributions);
        info!(
            task_id = %task_id,
            aggregate_id = %aggregate.id,
            units = data.units.len(),
            unchanged = partition.unchanged().len(),
            changed = partition.changed().len(),
            seeded,
            "Seeded unchanged units"
        );
        Ok(())
    }
}

/// Analyze step: runs every pending unit through the processor.
///
/// Before each unit the task status is re-read, so a pause or cancel stops
/// the loop with the finished units already checkpointed.
pub struct ProcessUnits<P> {
    processor: P,
    retry: RetryPolicy,
    timeout: Duration,
    failure_policy: UnitFailurePolicy,
}

impl<P: WorkUnitProcessor> ProcessUnits<P> {
    pub fn new(processor: P) -> Self {
        Self::from_config(processor, &EngineConfig::default())
    }

    pub fn from_config(processor: P, config: &EngineConfig) -> Self {
        Self {
            processor,
            retry: config.unit_retry_policy(),
            timeout: config.unit_timeout(),
            failure_policy: config.unit_failure_policy,
        }
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn unit_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn failure_policy(mut self, policy: UnitFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    async fn process_one(
        &self,
        unit: &WorkUnit,
        context: &UnitContext,
    ) -> Result<serde_json::Value, ProcessingError> {
        self.retry
            .run(
                |attempt| async move {
                    if attempt > 0 {
                        debug!(task_id = %context.task_id, unit = %unit.id, attempt, "Retrying unit");
                    }
                    match tokio::time::timeout(self.timeout, self.processor.process(unit, context)).await {
                        Ok(result) => result,
                        Err(_) => Err(ProcessingError::timeout(&unit.id, self.timeout)),
                    }
                },
                |e: &ProcessingError| e.retryable,
            )
            .await
    }
}

#[async_trait]
impl<P, Params> AnalyzeStrategy<Params> for ProcessUnits<P>
where
    P: WorkUnitProcessor + 'static,
    Params: UnitOptions + Send + Sync + 'static,
{
    async fn analyze(
        &self,
        ctx: &mut StepContext<'_, Params, AnalysisData>,
    ) -> Result<(), StepError> {
        let context = UnitContext {
            task_id: ctx.task_id(),
            owner_id: ctx.owner_id().to_string(),
            options: ctx.params().options().clone(),
        };
        let total = ctx.data().units.len();
        let pending: Vec<WorkUnit> = ctx
            .data()
            .units
            .iter()
            .filter(|unit| ctx.data().is_pending(&unit.id))
            .cloned()
            .collect();
        info!(
            task_id = %context.task_id,
            step = ctx.step(),
            processor = self.processor.name(),
            total,
            pending = pending.len(),
            "Analyzing units"
        );

        for unit in pending {
            ctx.check_interrupt().await?;

            let outcome = match self.process_one(&unit, &context).await {
                Ok(result) => {
                    ctx.data_mut().record_result(&unit.id, result);
                    "analyzed"
                }
                Err(e) => match self.failure_policy {
                    UnitFailurePolicy::SkipAndContinue => {
                        warn!(task_id = %context.task_id, unit = %unit.id, error = %e, "Skipping failed unit");
                        ctx.data_mut().record_failure(&unit.id, format!("{:#}", e.cause));
                        "failed"
                    }
                    UnitFailurePolicy::AbortStep => return Err(StepError::failed(e)),
                },
            };

            let done = ctx.data().settled();
            ctx.advance(
                done,
                total,
                format!("Processed {done} of {total} units"),
                Some(serde_json::json!({
                    "unitId": unit.id,
                    "outcome": outcome,
                    "done": done,
                    "total": total,
                })),
            )
            .await?;
        }
        Ok(())
    }
}

/// Save step of the full analysis: a new aggregate of all results.
pub struct CreateAggregate<G> {
    aggregates: G,
}

impl<G> CreateAggregate<G> {
    pub fn new(aggregates: G) -> Self {
        Self { aggregates }
    }
}

#[async_trait]
impl<G, Params> SaveStrategy<Params> for CreateAggregate<G>
where
    G: AggregateStore,
    Params: Send + Sync + 'static,
{
    async fn save(&self, ctx: &mut StepContext<'_, Params, AnalysisData>) -> Result<(), StepError> {
        let contributions = splice(&ctx.data().units, &ctx.data().results);
        // A previous run may have created the aggregate before it stopped.
        // If that aggregate is gone, create it again.
        let existing = match ctx.data().aggregate_id.clone() {
            Some(id) => self
                .aggregates
                .get(&id)
                .await
                .map_err(StepError::failed)?
                .map(|aggregate| aggregate.id),
            None => None,
        };
        let aggregate = match existing {
            Some(id) => self.aggregates.replace(&id, contributions).await,
            None => self.aggregates.create(ctx.owner_id(), contributions).await,
        }
        .map_err(StepError::failed)?;

        ctx.data_mut().aggregate_id = Some(aggregate.id.clone());
        ctx.checkpoint().await?;
        info!(
            task_id = %ctx.task_id(),
            aggregate_id = %aggregate.id,
            contributions = aggregate.contributions.len(),
            "Aggregate saved"
        );
        Ok(())
    }
}

/// Save step of the refresh: the existing aggregate, updated in place.
pub struct UpdateAggregate<G> {
    aggregates: G,
}

impl<G> UpdateAggregate<G> {
    pub fn new(aggregates: G) -> Self {
        Self { aggregates }
    }
}

#[async_trait]
impl<G, Params> SaveStrategy<Params> for UpdateAggregate<G>
where
    G: AggregateStore,
    Params: Send + Sync + 'static,
{
    async fn save(&self, ctx: &mut StepContext<'_, Params, AnalysisData>) -> Result<(), StepError> {
        let id = ctx
            .data()
            .aggregate_id
            .clone()
            .ok_or_else(|| StepError::failed(anyhow!("no aggregate to update")))?;
        let contributions = splice(&ctx.data().units, &ctx.data().results);
        let aggregate = self
            .aggregates
            .replace(&id, contributions)
            .await
            .map_err(StepError::failed)?;
        info!(
            task_id = %ctx.task_id(),
            aggregate_id = %aggregate.id,
            revision = aggregate.revision,
            "Aggregate updated"
        );
        Ok(())
    }
}
