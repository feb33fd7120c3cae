//! Shared fixtures for tests: an in-process backend collector and scripted
//! echo runners.

use crate::node::tests::{identity, MemoryStore};
use crate::node::NodeIdentityCache;
use crate::probe::{EchoRunner, ProbeError};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const TASK_UNKNOWN_BODY: &str = r#"{"code":400,"msg":"找不到对应的后端任务"}"#;

/// Recorded traffic and scripted replies of the fake backend.
#[derive(Clone, Default)]
pub(crate) struct Collector {
    results: Arc<Mutex<Vec<Value>>>,
    unknown_tasks: Arc<Mutex<HashSet<String>>>,
    all_unknown: Arc<AtomicBool>,
    heartbeat_reply: Arc<Mutex<String>>,
    heartbeat_body: Arc<Mutex<String>>,
    pub(crate) heartbeats: Arc<AtomicUsize>,
}

impl Collector {
    /// Every submission received so far, including rejected ones.
    pub(crate) fn results(&self) -> Vec<Value> {
        self.results.lock().unwrap().clone()
    }

    pub(crate) fn results_for(&self, task_id: &str) -> Vec<Value> {
        self.results()
            .into_iter()
            .filter(|body| body["task_id"] == task_id)
            .collect()
    }

    pub(crate) fn mark_task_unknown(&self, task_id: &str) {
        self.unknown_tasks.lock().unwrap().insert(task_id.to_string());
    }

    pub(crate) fn mark_all_tasks_unknown(&self) {
        self.all_unknown.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_heartbeat_reply(&self, body: &str) {
        *self.heartbeat_reply.lock().unwrap() = body.to_string();
    }

    pub(crate) fn last_heartbeat_body(&self) -> String {
        self.heartbeat_body.lock().unwrap().clone()
    }
}

async fn handle_result(
    State(collector): State<Collector>,
    Json(body): Json<Value>,
) -> (StatusCode, String) {
    let task_id = body["task_id"].as_str().unwrap_or_default().to_string();
    collector.results.lock().unwrap().push(body);

    let unknown = collector.all_unknown.load(Ordering::SeqCst)
        || collector.unknown_tasks.lock().unwrap().contains(&task_id);
    if unknown {
        (StatusCode::BAD_REQUEST, TASK_UNKNOWN_BODY.to_string())
    } else {
        (StatusCode::OK, r#"{"code":0,"msg":"ok"}"#.to_string())
    }
}

async fn handle_heartbeat(State(collector): State<Collector>, body: String) -> (StatusCode, String) {
    collector.heartbeats.fetch_add(1, Ordering::SeqCst);
    *collector.heartbeat_body.lock().unwrap() = body;
    let reply = collector.heartbeat_reply.lock().unwrap().clone();
    (StatusCode::OK, reply)
}

/// Start a fake backend on a random local port. Returns its base URL.
pub(crate) async fn spawn_collector() -> (String, Collector) {
    let collector = Collector::default();
    collector.set_heartbeat_reply("done");

    let router = Router::new()
        .route(crate::backend::RESULT_PATH, post(handle_result))
        .route(crate::backend::HEARTBEAT_PATH, post(handle_heartbeat))
        .with_state(collector.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{}", addr), collector)
}

/// Identity cache backed by memory, optionally already resolved.
pub(crate) fn identity_cache(resolved: Option<(u64, &str)>) -> Arc<NodeIdentityCache> {
    let store = MemoryStore::default();
    if let Some((node_id, node_ip)) = resolved {
        *store.record.lock().unwrap() = Some(identity(node_id, node_ip));
    }
    Arc::new(NodeIdentityCache::load(Arc::new(store)))
}

/// Replays the same output lines for every burst.
pub(crate) struct ScriptedEchoRunner {
    lines: Vec<String>,
}

impl ScriptedEchoRunner {
    pub(crate) fn new(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
        }
    }
}

impl EchoRunner for ScriptedEchoRunner {
    fn run_echo_burst(&self, _target: &str) -> Result<mpsc::Receiver<String>, ProbeError> {
        let (tx, rx) = mpsc::channel(self.lines.len().max(1));
        for line in &self.lines {
            let _ = tx.try_send(line.clone());
        }
        Ok(rx)
    }
}

/// Simulates a probe process that cannot be launched.
pub(crate) struct FailingEchoRunner;

impl EchoRunner for FailingEchoRunner {
    fn run_echo_burst(&self, _target: &str) -> Result<mpsc::Receiver<String>, ProbeError> {
        Err(ProbeError::Command(
            "failed to execute ping: No such file or directory".to_string(),
        ))
    }
}
