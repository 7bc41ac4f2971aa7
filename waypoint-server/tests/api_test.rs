use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use waypoint::analysis::{full_analysis, InMemoryAggregateStore, InMemoryUnitSource};
use waypoint::{
    EngineConfig, InMemoryTaskStore, ProcessingError, RunnerBuilder, UnitContext, WorkUnit,
    WorkUnitProcessor,
};

/// Processes a unit only when the test hands out a permit.
struct Gated(Arc<Semaphore>);

#[async_trait]
impl WorkUnitProcessor for Gated {
    async fn process(
        &self,
        unit: &WorkUnit,
        _context: &UnitContext,
    ) -> Result<Value, ProcessingError> {
        self.0
            .acquire()
            .await
            .map_err(|e| ProcessingError::permanent(&unit.id, e))?
            .forget();
        Ok(json!({ "unit": unit.id, "score": unit.id.len() }))
    }
}

struct TestServer {
    base: String,
    gate: Arc<Semaphore>,
    client: reqwest::Client,
}

async fn spawn_server(permits: usize) -> TestServer {
    let source = Arc::new(InMemoryUnitSource::new());
    source
        .set(
            "client-1",
            (1..=3)
                .map(|i| WorkUnit::new(format!("u{i}"), json!(i)))
                .collect(),
        )
        .await;
    let gate = Arc::new(Semaphore::new(permits));
    let config = EngineConfig::default();

    let runner = RunnerBuilder::new(InMemoryTaskStore::new())
        .pipeline(full_analysis(
            source,
            Gated(gate.clone()),
            Arc::new(InMemoryAggregateStore::new()),
            &config,
        ))
        .build();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        waypoint_server::serve(listener, runner).await.unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        gate,
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    async fn create(&self, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}/tasks", self.base))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn create_analysis(&self) -> i64 {
        let response = self
            .create(json!({"taskType": "analysis", "ownerId": "client-1", "parameters": {}}))
            .await;
        assert_eq!(response.status(), 201);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], "PENDING");
        body["taskId"].as_i64().unwrap()
    }

    async fn post(&self, path: &str) -> reqwest::Response {
        self.client
            .post(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap()
    }
}

fn parse_lines(bytes: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// Read a streaming response until its first complete event line.
async fn read_first_event(response: &mut reqwest::Response) -> Vec<u8> {
    let mut buffered = Vec::new();
    while !buffered.contains(&b'\n') {
        let chunk = response
            .chunk()
            .await
            .unwrap()
            .expect("stream ended before the first event");
        buffered.extend_from_slice(&chunk);
    }
    buffered
}

#[tokio::test]
async fn test_stream_runs_task_to_completion() {
    let server = spawn_server(100).await;
    let id = server.create_analysis().await;

    let response = server.get(&format!("/tasks/{id}/stream")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-ndjson"
    );

    let events = parse_lines(&response.bytes().await.unwrap());
    assert_eq!(events[0]["type"], "progress");
    assert_eq!(events[0]["step"], "fetch");
    let last = events.last().unwrap();
    assert_eq!(last["type"], "done");
    assert_eq!(last["taskId"], id);

    let task: Value = server.get(&format!("/tasks/{id}")).await.json().await.unwrap();
    assert_eq!(task["status"], "COMPLETED");
    assert_eq!(task["progress"], 100);
    assert_eq!(task["completedSteps"], json!(["fetch", "analyze", "save"]));

    // Completed tasks cannot be paused.
    let response = server.post(&format!("/tasks/{id}/pause")).await;
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "conflict");
}

#[tokio::test]
async fn test_pause_then_resume_over_http() {
    let server = spawn_server(0).await;
    let id = server.create_analysis().await;

    let mut stream = server.get(&format!("/tasks/{id}/stream")).await;
    let mut buffered = read_first_event(&mut stream).await;

    let response = server.post(&format!("/tasks/{id}/pause")).await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "PAUSED");

    // Let the unit in flight finish; the loop stops before the next one.
    server.gate.add_permits(1);
    buffered.extend_from_slice(&stream.bytes().await.unwrap());
    let events = parse_lines(&buffered);
    assert_eq!(events.last().unwrap()["type"], "paused");
    assert_eq!(events.last().unwrap()["canResume"], true);

    server.gate.add_permits(100);
    let resumed = server.post(&format!("/tasks/{id}/resume")).await;
    assert_eq!(resumed.status(), 200);
    let events = parse_lines(&resumed.bytes().await.unwrap());
    assert_eq!(events.last().unwrap()["type"], "done");
    assert!(events
        .iter()
        .all(|event| event["step"] != "fetch"));

    let task: Value = server.get(&format!("/tasks/{id}")).await.json().await.unwrap();
    assert_eq!(task["status"], "COMPLETED");
    assert_eq!(task["completedSteps"], json!(["fetch", "analyze", "save"]));
}

#[tokio::test]
async fn test_cancel_paused_task() {
    let server = spawn_server(0).await;
    let id = server.create_analysis().await;

    let mut stream = server.get(&format!("/tasks/{id}/stream")).await;
    read_first_event(&mut stream).await;
    server.post(&format!("/tasks/{id}/pause")).await;
    server.gate.add_permits(1);
    stream.bytes().await.unwrap();

    let response = server
        .client
        .delete(format!("{}/tasks/{id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "CANCELLED");

    let resumed = server.post(&format!("/tasks/{id}/resume")).await;
    assert_eq!(resumed.status(), 409);
}

#[tokio::test]
async fn test_create_rejects_bad_requests() {
    let server = spawn_server(0).await;

    let response = server
        .create(json!({"taskType": "unknown", "ownerId": "client-1"}))
        .await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "unknown_task_type");

    let response = server
        .create(json!({"taskType": "analysis", "ownerId": "client-1", "parameters": {"options": 5}}))
        .await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    // Nothing was created by the rejected requests.
    let tasks: Value = server
        .get("/tasks?ownerId=client-1")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(tasks, json!([]));
}

#[tokio::test]
async fn test_list_and_lookup() {
    let server = spawn_server(0).await;
    let first = server.create_analysis().await;
    let second = server.create_analysis().await;

    let tasks: Value = server
        .get("/tasks?ownerId=client-1&taskType=analysis")
        .await
        .json()
        .await
        .unwrap();
    let ids: Vec<i64> = tasks
        .as_array()
        .unwrap()
        .iter()
        .map(|task| task["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![first, second]);

    let missing = server.get("/tasks/9999").await;
    assert_eq!(missing.status(), 404);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["error"], "not_found");

    let health: Value = server.get("/health").await.json().await.unwrap();
    assert_eq!(health["status"], "ok");

    let types: Value = server.get("/task-types").await.json().await.unwrap();
    assert_eq!(types[0]["taskType"], "analysis");
    assert_eq!(types[0]["steps"], json!(["fetch", "analyze", "save"]));
}

#[tokio::test]
async fn test_graceful_shutdown_stops_server() {
    let runner = RunnerBuilder::new(InMemoryTaskStore::new()).build();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(waypoint_server::serve_with_shutdown(
        listener,
        runner,
        async move {
            let _ = stopped.await;
        },
    ));

    let health = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(health.status(), 200);

    stop.send(()).unwrap();
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok());
}
