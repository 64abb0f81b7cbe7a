//! HTTP status-code contract tests for the agent API.
//!
//! Serves the real hyper stack on an ephemeral port and drives it with the
//! legacy hyper client.

#![cfg(unix)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use opensandbox::agent::{AgentConfig, TaskManager, server};

struct TestAgent {
    base: String,
    manager: Arc<TaskManager>,
    cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

async fn spawn_agent() -> TestAgent {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let manager = Arc::new(TaskManager::new(&config));
    let cancel = CancellationToken::new();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::run_with_listener(
        listener,
        manager.clone(),
        cancel.clone(),
    ));

    TestAgent {
        base: format!("http://{addr}"),
        manager,
        cancel,
        _dir: dir,
    }
}

async fn request(
    method: Method,
    url: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let client: Client<_, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let payload = body.map(|b| b.to_string()).unwrap_or_default();
    let req = Request::builder()
        .method(method)
        .uri(url)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(payload)))
        .unwrap();

    let response = client.request(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn task_body(name: &str, script: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "spec": { "process": { "command": ["sh", "-c"], "args": [script] } }
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let agent = spawn_agent().await;
    let (status, body) = request(Method::GET, &format!("{}/health", agent.base), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, _) = request(Method::POST, &format!("{}/health", agent.base), None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    agent.cancel.cancel();
}

#[tokio::test]
async fn test_task_crud_contract() {
    let agent = spawn_agent().await;
    let base = &agent.base;

    // Create returns 201 with a status already attached.
    let (status, body) = request(
        Method::POST,
        &format!("{base}/tasks"),
        Some(task_body("t1", "exit 7")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["name"], "t1");
    assert!(body["status"]["state"].is_string());

    // Fetch the live view.
    let (status, body) = request(Method::GET, &format!("{base}/tasks/t1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "t1");

    // Missing task is 404; wrong method is 405.
    let (status, _) = request(Method::GET, &format!("{base}/tasks/absent"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = request(Method::GET, &format!("{base}/nope"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = request(Method::PUT, &format!("{base}/tasks/t1"), None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    // Wait for the exit code to land, then check the status tree.
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        agent.manager.reconcile_once().await;
        let (_, body) = request(Method::GET, &format!("{base}/tasks/t1"), None).await;
        if body["status"]["state"] == "Failed" {
            assert_eq!(body["status"]["subStatuses"][0]["exitCode"], 7);
            break;
        }
        assert!(Instant::now() < deadline, "task never reached Failed");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Delete is 204 and idempotent.
    let (status, _) = request(Method::DELETE, &format!("{base}/tasks/t1"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = request(Method::DELETE, &format!("{base}/tasks/t1"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    agent.cancel.cancel();
}

#[tokio::test]
async fn test_validation_and_quota_statuses() {
    let agent = spawn_agent().await;
    let base = &agent.base;

    // No backend at all -> 400.
    let (status, body) = request(
        Method::POST,
        &format!("{base}/tasks"),
        Some(serde_json::json!({ "name": "empty", "spec": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("process or container"));

    // Malformed JSON -> 400.
    let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("{base}/tasks"))
        .body(Full::new(Bytes::from_static(b"{nope")))
        .unwrap();
    assert_eq!(client.request(req).await.unwrap().status(), StatusCode::BAD_REQUEST);

    // Second active task -> 500 with a quota message.
    let (status, _) = request(
        Method::POST,
        &format!("{base}/tasks"),
        Some(task_body("busy", "sleep 30")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = request(
        Method::POST,
        &format!("{base}/tasks"),
        Some(task_body("overflow", "true")),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("quota"));

    // Duplicate name -> 400.
    let (status, _) = request(
        Method::POST,
        &format!("{base}/tasks"),
        Some(task_body("busy", "true")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    agent.cancel.cancel();
}

#[tokio::test]
async fn test_set_tasks_returns_current_state() {
    let agent = spawn_agent().await;
    let base = &agent.base;

    let (status, body) = request(
        Method::POST,
        &format!("{base}/setTasks"),
        Some(serde_json::json!({ "tasks": [task_body("a", "sleep 30")] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tasks"].as_array().unwrap().len(), 1);
    assert!(body.get("errors").is_none());

    // Over-quota entries are reported but the list still comes back.
    let (status, body) = request(
        Method::POST,
        &format!("{base}/setTasks"),
        Some(serde_json::json!({
            "tasks": [task_body("a", "sleep 30"), task_body("b", "true")]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tasks"].as_array().unwrap().len(), 1);
    assert_eq!(body["errors"].as_array().unwrap().len(), 1);

    let (status, body) = request(Method::GET, &format!("{base}/getTasks"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tasks"][0]["name"], "a");

    // Sync to empty stamps tombstones on everything.
    let (status, body) = request(
        Method::POST,
        &format!("{base}/setTasks"),
        Some(serde_json::json!({ "tasks": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    for task in body["tasks"].as_array().unwrap() {
        assert!(task["deletionTimestamp"].is_string());
    }
    agent.cancel.cancel();
}
