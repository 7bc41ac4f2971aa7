//! # Waypoint
//!
//! A resumable step-pipeline engine.
//!
//! A task runs a fixed, ordered table of named steps. After every step, and
//! after every unit of work inside long steps, the engine persists a
//! checkpoint to the task store, so a task can be paused, resumed, retried
//! after a failure or picked up after a process restart without redoing
//! finished work. Progress is streamed to any number of observers as typed
//! events.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use waypoint::analysis::{full_analysis, AnalysisParams, InMemoryAggregateStore, InMemoryUnitSource};
//! use waypoint::{EngineConfig, InMemoryTaskStore, RunnerBuilder};
//!
//! let config = EngineConfig::from_env()?;
//! let runner = RunnerBuilder::new(InMemoryTaskStore::new())
//!     .config(&config)
//!     .pipeline(full_analysis(source, processor, aggregates, &config))
//!     .build();
//!
//! let task_id = runner.submit("analysis", "client-1", AnalysisParams::default()).await?;
//! let mut events = runner.execute(task_id).await?;
//! while let Some(event) = events.next().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! ```
//!
//! ## Control
//!
//! `pause` and `cancel` only write the task status. The running control loop
//! re-reads the status before every step and every unit and stops there; a
//! pause keeps all work done so far, a cancel discards the rest.
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable SQLite-backed task storage

pub mod analysis;
pub mod broadcast;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod event;
pub mod pipeline;
pub mod retry;
pub mod runner;
pub mod step;
pub mod task;
pub mod unit;

pub use broadcast::{Broadcaster, EventStream};
pub use checkpoint::{CheckpointData, CheckpointError};
pub use config::EngineConfig;
pub use context::StepContext;
pub use event::TaskEvent;
pub use pipeline::TaskPipeline;
pub use retry::{Backoff, RetryPolicy};
pub use runner::{InMemoryTaskStore, RunOutcome, Runner, RunnerBuilder, TaskError, TaskStore};
#[cfg(feature = "sqlite")]
pub use runner::SqliteTaskStore;
pub use step::{Interrupt, StepError, StepName, StepSpec, StepTable};
pub use task::{Task, TaskId, TaskStatus, TaskUpdate};
pub use unit::{
    FallbackProcessor, ProcessingError, UnitContext, UnitFailurePolicy, WorkUnit,
    WorkUnitProcessor,
};
