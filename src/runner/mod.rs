//! Task storage, the control loop and the runner driving it.

mod control;
mod erased;
pub mod memory_store;
#[allow(clippy::module_inception)]
mod runner;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;
pub mod store;

pub use control::RunOutcome;
pub use erased::{ErasedPipeline, PipelineWrapper};
pub use memory_store::InMemoryTaskStore;
pub use runner::{Runner, RunnerBuilder};
#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteTaskStore;
pub use store::{TaskError, TaskStore};
