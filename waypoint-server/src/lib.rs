//! HTTP binding for Waypoint.
//!
//! Exposes the control surface of a [`waypoint::Runner`] as a small JSON API
//! and streams task events as newline-delimited JSON.
//!
//! # Routes
//!
//! - `POST /tasks` - create a task: `{taskType, ownerId, parameters}`
//! - `GET /tasks?ownerId=..&taskType=..` - list an owner's tasks
//! - `GET /tasks/{id}` - current task record
//! - `GET /tasks/{id}/stream` - run the task, streaming its events
//! - `POST /tasks/{id}/pause` - request a pause
//! - `POST /tasks/{id}/resume` - resume or retry, streaming events
//! - `DELETE /tasks/{id}` - cancel
//! - `GET /task-types`, `GET /health`
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! waypoint_server::serve(listener, runner).await?;
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod models;
mod server;
pub mod telemetry;

pub use app::{build_runner, HttpProcessor, HttpUnitSource};
pub use config::ServerConfig;
pub use error::ApiError;
pub use server::{create_router, run_server, serve, serve_with_shutdown};
pub use telemetry::init_tracing;
