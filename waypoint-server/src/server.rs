//! HTTP routes over a [`Runner`].

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use std::future::Future;
use tokio::net::TcpListener;
use tracing::{info, warn};
use waypoint::analysis::SqliteAggregateStore;
use waypoint::{EngineConfig, EventStream, Runner, SqliteTaskStore, Task, TaskId, TaskStore};

use crate::app::build_runner;
use crate::config::ServerConfig;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    CreateTaskRequest, CreateTaskResponse, HealthResponse, ListQuery, StatusResponse,
    TaskTypeInfo,
};

/// Create the router for the task API.
pub fn create_router<S: TaskStore + 'static>(runner: Runner<S>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/task-types", get(task_types::<S>))
        .route("/tasks", post(create_task::<S>).get(list_tasks::<S>))
        .route("/tasks/{id}", get(get_task::<S>).delete(cancel_task::<S>))
        .route("/tasks/{id}/stream", get(stream_task::<S>))
        .route("/tasks/{id}/pause", post(pause_task::<S>))
        .route("/tasks/{id}/resume", post(resume_task::<S>))
        .with_state(runner)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /task-types
async fn task_types<S: TaskStore + 'static>(
    State(runner): State<Runner<S>>,
) -> Json<Vec<TaskTypeInfo>> {
    let types = runner
        .task_types()
        .into_iter()
        .map(|task_type| TaskTypeInfo {
            task_type: task_type.to_string(),
            steps: runner
                .steps(task_type)
                .unwrap_or_default()
                .into_iter()
                .map(str::to_string)
                .collect(),
        })
        .collect();
    Json(types)
}

/// POST /tasks
///
/// Validates the parameters and creates a pending task. Nothing runs until
/// the task's stream is requested.
async fn create_task<S: TaskStore + 'static>(
    State(runner): State<Runner<S>>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<CreateTaskResponse>)> {
    if request.owner_id.trim().is_empty() {
        return Err(ApiError::BadRequest("ownerId is required".to_string()));
    }
    let task = runner
        .start(&request.task_type, &request.owner_id, request.parameters)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateTaskResponse {
            task_id: task.id,
            status: task.status,
        }),
    ))
}

/// GET /tasks?ownerId=..&taskType=..
async fn list_tasks<S: TaskStore + 'static>(
    State(runner): State<Runner<S>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    let tasks = runner
        .list(&query.owner_id, query.task_type.as_deref())
        .await?;
    Ok(Json(tasks))
}

/// GET /tasks/{id}
async fn get_task<S: TaskStore + 'static>(
    State(runner): State<Runner<S>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Task>> {
    Ok(Json(runner.status(TaskId(id)).await?))
}

/// GET /tasks/{id}/stream
async fn stream_task<S: TaskStore + 'static>(
    State(runner): State<Runner<S>>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let events = runner.execute(TaskId(id)).await?;
    Ok(ndjson(events))
}

/// POST /tasks/{id}/pause
async fn pause_task<S: TaskStore + 'static>(
    State(runner): State<Runner<S>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<StatusResponse>> {
    let task = runner.pause(TaskId(id)).await?;
    Ok(Json(StatusResponse {
        status: task.status,
    }))
}

/// POST /tasks/{id}/resume
async fn resume_task<S: TaskStore + 'static>(
    State(runner): State<Runner<S>>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let events = runner.resume(TaskId(id)).await?;
    Ok(ndjson(events))
}

/// DELETE /tasks/{id}
async fn cancel_task<S: TaskStore + 'static>(
    State(runner): State<Runner<S>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<StatusResponse>> {
    let task = runner.cancel(TaskId(id)).await?;
    Ok(Json(StatusResponse {
        status: task.status,
    }))
}

/// One JSON event per line, ending with the closing event.
fn ndjson(events: EventStream) -> Response {
    let lines = events.into_stream().map(|event| {
        serde_json::to_vec(&event).map(|mut line| {
            line.push(b'\n');
            line
        })
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}

/// Serve the API on an already bound listener until Ctrl-C.
pub async fn serve<S: TaskStore + 'static>(
    listener: TcpListener,
    runner: Runner<S>,
) -> anyhow::Result<()> {
    serve_with_shutdown(listener, runner, ctrl_c()).await
}

/// Serve the API until `shutdown` resolves, then finish in-flight requests.
pub async fn serve_with_shutdown<S, F>(
    listener: TcpListener,
    runner: Runner<S>,
    shutdown: F,
) -> anyhow::Result<()>
where
    S: TaskStore + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, create_router(runner))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Waypoint server stopped");
    Ok(())
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            warn!(error = %e, "Cannot listen for Ctrl-C; serving until killed");
            std::future::pending::<()>().await;
        }
    }
}

/// Open the task and aggregate stores, recover orphaned tasks and serve
/// until shutdown.
pub async fn run_server(config: ServerConfig, engine: EngineConfig) -> anyhow::Result<()> {
    let pool = sqlx::SqlitePool::connect(&config.database_url).await?;
    let store = SqliteTaskStore::new(pool.clone());
    store.run_migrations().await?;
    let aggregates = SqliteAggregateStore::new(pool);
    aggregates.run_migrations().await?;

    let runner = build_runner(store, aggregates, &config, &engine)?;
    runner.recover_orphans().await?;

    let listener = TcpListener::bind(config.bind_address()).await?;
    info!(address = %listener.local_addr()?, "Waypoint server listening");
    serve(listener, runner).await
}
