//! The analysis task type: fetch work units, analyze each one, save an
//! aggregate of the results.
//!
//! The pipeline is assembled from three strategies, one per step. The full
//! variant loads every unit and creates a new aggregate; the refresh variant
//! reuses the contributions of unchanged units and updates an existing
//! aggregate in place.
//!
//! ```rust,ignore
//! let runner = RunnerBuilder::new(InMemoryTaskStore::new())
//!     .pipeline(full_analysis(source.clone(), processor.clone(), aggregates.clone(), &config))
//!     .pipeline(refresh_analysis(source, processor, aggregates, &config))
//!     .build();
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::checkpoint::CheckpointData;
use crate::config::EngineConfig;
use crate::context::StepContext;
use crate::pipeline::TaskPipeline;
use crate::step::{StepError, StepName, StepSpec, StepTable};
use crate::unit::{WorkUnit, WorkUnitProcessor};

pub mod aggregate;
pub mod diff;
#[cfg(feature = "sqlite")]
pub mod sqlite_aggregate;
pub mod strategies;

pub use aggregate::{Aggregate, AggregateStore, InMemoryAggregateStore};
#[cfg(feature = "sqlite")]
pub use sqlite_aggregate::SqliteAggregateStore;
pub use diff::UnitPartition;
pub use strategies::{
    CreateAggregate, InMemoryUnitSource, LoadUnits, ProcessUnits, SeedUnchanged, UnitSource,
    UpdateAggregate,
};

/// Task type of the full analysis.
pub const ANALYSIS: &str = "analysis";
/// Task type of the incremental refresh.
pub const REFRESH: &str = "refresh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisStep {
    Fetch,
    Analyze,
    Save,
}

impl StepName for AnalysisStep {
    fn as_str(&self) -> &'static str {
        match self {
            AnalysisStep::Fetch => "fetch",
            AnalysisStep::Analyze => "analyze",
            AnalysisStep::Save => "save",
        }
    }
}

pub fn analysis_steps() -> StepTable<AnalysisStep> {
    StepTable::new(vec![
        StepSpec::new(AnalysisStep::Fetch, 10, "Fetching work units"),
        StepSpec::new(AnalysisStep::Analyze, 30, "Analyzing work units"),
        StepSpec::new(AnalysisStep::Save, 90, "Saving results"),
    ])
}

/// Checkpoint of an analysis task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisData {
    /// Units fetched for this task, in processing order.
    pub units: Vec<WorkUnit>,
    /// Units whose result is in `results`.
    pub analyzed_group_ids: BTreeSet<String>,
    pub results: BTreeMap<String, serde_json::Value>,
    /// Units given up on, with the reason.
    pub failures: BTreeMap<String, String>,
    /// Aggregate written by the save step, or refreshed by it.
    pub aggregate_id: Option<String>,
}

impl CheckpointData for AnalysisData {
    const VERSION: u32 = 1;
}

impl AnalysisData {
    /// A unit is pending until it is analyzed or recorded as failed.
    pub fn is_pending(&self, unit_id: &str) -> bool {
        !self.analyzed_group_ids.contains(unit_id) && !self.failures.contains_key(unit_id)
    }

    /// Units no longer pending.
    pub fn settled(&self) -> usize {
        self.units.iter().filter(|u| !self.is_pending(&u.id)).count()
    }

    pub fn record_result(&mut self, unit_id: &str, result: serde_json::Value) {
        self.failures.remove(unit_id);
        self.results.insert(unit_id.to_string(), result);
        self.analyzed_group_ids.insert(unit_id.to_string());
    }

    pub fn record_failure(&mut self, unit_id: &str, reason: String) {
        self.failures.insert(unit_id.to_string(), reason);
    }
}

/// Parameters that carry processor options for each unit.
pub trait UnitOptions {
    fn options(&self) -> &serde_json::Value;
}

/// Parameters of a full analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisParams {
    #[serde(default)]
    pub options: serde_json::Value,
}

impl UnitOptions for AnalysisParams {
    fn options(&self) -> &serde_json::Value {
        &self.options
    }
}

/// Parameters of a refresh of an existing aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshParams {
    pub aggregate_id: String,
    /// Units whose prior contribution can be reused.
    #[serde(default)]
    pub unchanged: Vec<String>,
    #[serde(default)]
    pub changed: Vec<String>,
    #[serde(default)]
    pub options: serde_json::Value,
}

impl UnitOptions for RefreshParams {
    fn options(&self) -> &serde_json::Value {
        &self.options
    }
}

/// Fills the task's units. Owns the parameter type of the pipeline.
#[async_trait]
pub trait FetchStrategy: Send + Sync + 'static {
    type Params: UnitOptions + Serialize + DeserializeOwned + Send + Sync + 'static;

    fn validate(&self, _params: &Self::Params) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fetch(
        &self,
        ctx: &mut StepContext<'_, Self::Params, AnalysisData>,
    ) -> Result<(), StepError>;
}

/// Turns pending units into results.
#[async_trait]
pub trait AnalyzeStrategy<P>: Send + Sync + 'static {
    async fn analyze(&self, ctx: &mut StepContext<'_, P, AnalysisData>) -> Result<(), StepError>;
}

/// Materializes the results.
#[async_trait]
pub trait SaveStrategy<P>: Send + Sync + 'static {
    async fn save(&self, ctx: &mut StepContext<'_, P, AnalysisData>) -> Result<(), StepError>;
}

/// The `fetch → analyze → save` pipeline over pluggable strategies.
pub struct AnalysisPipeline<F, A, S> {
    task_type: &'static str,
    steps: StepTable<AnalysisStep>,
    fetch: F,
    analyze: A,
    save: S,
}

impl<F, A, S> AnalysisPipeline<F, A, S> {
    pub fn new(task_type: &'static str, fetch: F, analyze: A, save: S) -> Self {
        Self {
            task_type,
            steps: analysis_steps(),
            fetch,
            analyze,
            save,
        }
    }
}

#[async_trait]
impl<F, A, S> TaskPipeline for AnalysisPipeline<F, A, S>
where
    F: FetchStrategy,
    A: AnalyzeStrategy<F::Params>,
    S: SaveStrategy<F::Params>,
{
    type Step = AnalysisStep;
    type Params = F::Params;
    type Data = AnalysisData;

    fn task_type(&self) -> &'static str {
        self.task_type
    }

    fn steps(&self) -> &StepTable<AnalysisStep> {
        &self.steps
    }

    fn validate(&self, params: &F::Params) -> anyhow::Result<()> {
        self.fetch.validate(params)
    }

    async fn execute(
        &self,
        step: AnalysisStep,
        ctx: &mut StepContext<'_, F::Params, AnalysisData>,
    ) -> Result<(), StepError> {
        match step {
            AnalysisStep::Fetch => self.fetch.fetch(ctx).await,
            AnalysisStep::Analyze => self.analyze.analyze(ctx).await,
            AnalysisStep::Save => self.save.save(ctx).await,
        }
    }
}

pub type FullAnalysis<U, P, G> = AnalysisPipeline<LoadUnits<U>, ProcessUnits<P>, CreateAggregate<G>>;

pub type RefreshAnalysis<U, P, G> =
    AnalysisPipeline<SeedUnchanged<U, G>, ProcessUnits<P>, UpdateAggregate<G>>;

/// Full analysis registered as [`ANALYSIS`].
pub fn full_analysis<U, P, G>(
    source: U,
    processor: P,
    aggregates: G,
    config: &EngineConfig,
) -> FullAnalysis<U, P, G>
where
    U: UnitSource,
    P: WorkUnitProcessor + 'static,
    G: AggregateStore,
{
    AnalysisPipeline::new(
        ANALYSIS,
        LoadUnits::new(source),
        ProcessUnits::from_config(processor, config),
        CreateAggregate::new(aggregates),
    )
}

/// Refresh registered as [`REFRESH`]. Both strategies that touch aggregates
/// share `aggregates`.
pub fn refresh_analysis<U, P, G>(
    source: U,
    processor: P,
    aggregates: G,
    config: &EngineConfig,
) -> RefreshAnalysis<U, P, G>
where
    U: UnitSource,
    P: WorkUnitProcessor + 'static,
    G: AggregateStore + Clone,
{
    AnalysisPipeline::new(
        REFRESH,
        SeedUnchanged::new(source, aggregates.clone()),
        ProcessUnits::from_config(processor, config),
        UpdateAggregate::new(aggregates),
    )
}
