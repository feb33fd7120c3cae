//! HTTP request handlers.

use super::AppState;
use crate::scheduler::{TaskError, TaskRequest};

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

impl IntoResponse for TaskError {
    fn into_response(self) -> Response {
        let status = match &self {
            TaskError::Validation(_) => StatusCode::BAD_REQUEST,
            TaskError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    TaskError::Validation(message.into()).into_response()
}

// ============================================================================
// API: Continuous tasks
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    /// Seconds between iterations.
    #[serde(default)]
    pub interval: Option<u64>,
    /// Task lifetime in minutes.
    #[serde(default)]
    pub max_duration: Option<u64>,
}

impl StartRequest {
    fn into_task_request(self) -> Result<TaskRequest, TaskError> {
        Ok(TaskRequest {
            kind: self.kind.parse()?,
            target: self.target,
            interval: self.interval.map(Duration::from_secs),
            max_duration: self
                .max_duration
                .map(|minutes| Duration::from_secs(minutes.saturating_mul(60))),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub task_id: String,
}

pub async fn handle_continuous_start(
    State(state): State<AppState>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    let request = match req.into_task_request() {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };
    let kind = request.kind;

    match state.registry.create_task(request).await {
        Ok(task_id) => Json(StartResponse { task_id }).into_response(),
        Err(e) => {
            tracing::warn!(kind = %kind, "Rejected continuous task: {}", e);
            e.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub task_id: String,
}

pub async fn handle_continuous_stop(
    State(state): State<AppState>,
    payload: Result<Json<StopRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    match state.registry.stop_task(&req.task_id).await {
        Ok(()) => Json(json!({ "message": "task stopped" })).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub task_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub task_id: String,
    pub is_running: bool,
    pub start_time: DateTime<Utc>,
    pub last_poll_time: DateTime<Utc>,
}

pub async fn handle_continuous_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let Some(task_id) = query.task_id.filter(|id| !id.is_empty()) else {
        return bad_request("task_id is required");
    };

    match state.registry.status(&task_id).await {
        Ok(status) => Json(StatusResponse {
            task_id: status.task_id,
            is_running: status.running,
            start_time: status.created_at,
            last_poll_time: status.last_poll_at,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use crate::backend::BackendPublisher;
    use crate::config::AgentConfig;
    use crate::scheduler::TaskRegistry;
    use crate::testing::{identity_cache, spawn_collector, ScriptedEchoRunner};
    use crate::web::Server;

    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn spawn_server() -> (String, Arc<TaskRegistry>) {
        let (backend_url, _collector) = spawn_collector().await;
        let publisher =
            BackendPublisher::new(&backend_url, identity_cache(Some((7, "10.0.0.7")))).unwrap();
        let runner = ScriptedEchoRunner::new(&[
            "PING 10.0.0.1 (10.0.0.1) 56(84) bytes of data.",
            "64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=0.5 ms",
        ]);
        let registry = TaskRegistry::new(publisher, Arc::new(runner));

        let server = Server::new(AgentConfig::default(), registry.clone());
        let router = server.routes();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        (format!("http://{}/api", addr), registry)
    }

    #[tokio::test]
    async fn test_start_status_stop() {
        let (base, registry) = spawn_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/continuous/start", base))
            .json(&json!({ "type": "ping", "target": "10.0.0.1", "interval": 5, "max_duration": 1 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        let task_id = body["task_id"].as_str().unwrap().to_string();
        assert!(task_id.starts_with("task_"));

        let resp = client
            .get(format!("{}/continuous/status", base))
            .query(&[("task_id", task_id.as_str())])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let status: Value = resp.json().await.unwrap();
        assert_eq!(status["task_id"], task_id.as_str());
        assert_eq!(status["is_running"], true);
        assert!(status["start_time"].is_string());
        assert!(status["last_poll_time"].is_string());

        let resp = client
            .post(format!("{}/continuous/stop", base))
            .json(&json!({ "task_id": task_id }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client
            .post(format!("{}/continuous/stop", base))
            .json(&json!({ "task_id": task_id }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_requests() {
        let (base, registry) = spawn_server().await;
        let client = reqwest::Client::new();
        let url = format!("{}/continuous/start", base);

        let bad_bodies = [
            json!({ "type": "traceroute", "target": "10.0.0.1" }),
            json!({ "type": "tcping", "target": "10.0.0.1" }),
            json!({ "type": "tcping", "target": "10.0.0.1:http" }),
            json!({ "type": "ping", "target": "-f 10.0.0.1" }),
            json!({ "type": "ping", "target": "10.0.0.1", "interval": -5 }),
            json!({ "type": "ping", "target": "10.0.0.1", "max_duration": "soon" }),
        ];
        for body in bad_bodies {
            let resp = client.post(&url).json(&body).send().await.unwrap();
            assert_eq!(resp.status(), 400, "body {} should be rejected", body);
            let err: Value = resp.json().await.unwrap();
            assert!(err["error"].is_string());
        }

        let resp = client
            .post(&url)
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_status_requires_known_task_id() {
        let (base, _registry) = spawn_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{}/continuous/status", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .get(format!("{}/continuous/status?task_id=task_missing", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_health() {
        let (base, _registry) = spawn_server().await;
        let body: Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    }
}
