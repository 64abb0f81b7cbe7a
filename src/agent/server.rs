//! HTTP API for the task executor agent.
//!
//! All endpoints speak JSON. Task bodies are symmetric with the client: the
//! shape accepted by `POST /tasks` is the shape returned everywhere else.

use crate::agent::manager::{TaskError, TaskManager};
use crate::agent::task::Task;
use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How long in-flight connections get to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error>;

fn full<T: Into<bytes::Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Error payload for non-2xx responses
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Body of `POST /setTasks`
#[derive(Debug, Default, Deserialize)]
struct SetTasksRequest {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Response of the list-shaped endpoints
#[derive(Debug, Serialize)]
struct TaskListResponse {
    tasks: Vec<Task>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full(body))
        .unwrap()
}

fn empty_response(status: StatusCode) -> Response<BoxBody> {
    Response::builder().status(status).body(full("")).unwrap()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<BoxBody> {
    json_response(
        status,
        &ErrorBody {
            error: message.into(),
        },
    )
}

fn status_for(error: &TaskError) -> StatusCode {
    match error {
        TaskError::Invalid(_) | TaskError::AlreadyExists(_) => StatusCode::BAD_REQUEST,
        TaskError::NotFound(_) => StatusCode::NOT_FOUND,
        TaskError::QuotaExceeded | TaskError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<Incoming>,
) -> Result<T, Response<BoxBody>> {
    let body_bytes = req
        .collect()
        .await
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Failed to read body"))?
        .to_bytes();

    serde_json::from_slice(&body_bytes)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("Invalid JSON: {e}")))
}

/// Route one request.
async fn handle_request(
    req: Request<Incoming>,
    manager: Arc<TaskManager>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match segments.as_slice() {
        ["health"] => match method {
            Method::GET => json_response(StatusCode::OK, &serde_json::json!({"status": "healthy"})),
            _ => method_not_allowed(),
        },
        ["tasks"] => match method {
            Method::POST => handle_create(req, manager).await,
            _ => method_not_allowed(),
        },
        ["tasks", name] => match method {
            Method::GET => handle_get(name, manager).await,
            Method::DELETE => handle_delete(name, manager).await,
            _ => method_not_allowed(),
        },
        ["setTasks"] => match method {
            Method::POST => handle_set_tasks(req, manager).await,
            _ => method_not_allowed(),
        },
        ["getTasks"] => match method {
            Method::GET => handle_get_tasks(manager).await,
            _ => method_not_allowed(),
        },
        _ => error_response(StatusCode::NOT_FOUND, "Not found"),
    };

    Ok(response)
}

fn method_not_allowed() -> Response<BoxBody> {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

async fn handle_create(req: Request<Incoming>, manager: Arc<TaskManager>) -> Response<BoxBody> {
    let task: Task = match read_json_body(req).await {
        Ok(task) => task,
        Err(resp) => return resp,
    };

    match manager.create(task).await {
        Ok(created) => json_response(StatusCode::CREATED, &created),
        Err(e) => error_response(status_for(&e), e.to_string()),
    }
}

async fn handle_get(name: &str, manager: Arc<TaskManager>) -> Response<BoxBody> {
    match manager.get(name).await {
        Some(task) => json_response(StatusCode::OK, &task),
        None => error_response(StatusCode::NOT_FOUND, format!("task {name:?} not found")),
    }
}

async fn handle_delete(name: &str, manager: Arc<TaskManager>) -> Response<BoxBody> {
    match manager.delete(name).await {
        Ok(()) => empty_response(StatusCode::NO_CONTENT),
        Err(e) => error_response(status_for(&e), e.to_string()),
    }
}

async fn handle_set_tasks(req: Request<Incoming>, manager: Arc<TaskManager>) -> Response<BoxBody> {
    let body: SetTasksRequest = match read_json_body(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    let (tasks, errors) = manager.sync(body.tasks).await;
    json_response(StatusCode::OK, &TaskListResponse { tasks, errors })
}

async fn handle_get_tasks(manager: Arc<TaskManager>) -> Response<BoxBody> {
    let tasks = manager.list().await;
    json_response(
        StatusCode::OK,
        &TaskListResponse {
            tasks,
            errors: Vec::new(),
        },
    )
}

/// Serve the task API until cancelled, then drain for up to five seconds.
pub async fn run_server(
    addr: SocketAddr,
    manager: Arc<TaskManager>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    run_with_listener(listener, manager, cancel).await
}

/// Serve the task API on an already-bound listener.
pub async fn run_with_listener(
    listener: TcpListener,
    manager: Arc<TaskManager>,
    cancel: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "task agent API listening");

    let tracker = TaskTracker::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                debug!(%peer, "connection accepted");
                let io = TokioIo::new(stream);
                let manager = manager.clone();
                tracker.spawn(async move {
                    let service = service_fn(move |req| {
                        let manager = manager.clone();
                        handle_request(req, manager)
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(error = %e, "connection ended with error");
                    }
                });
            }
        }
    }

    tracker.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
        warn!("connections did not drain within the shutdown grace period");
    }
    Ok(())
}
