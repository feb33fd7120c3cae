//! Delivery of measurement events to the backend collector.

use crate::db::Location;
use crate::node::NodeIdentityCache;
use crate::probe::MeasurementEvent;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{build_client, BackendError};

pub const RESULT_PATH: &str = "/api/public/node/continuous/result";

/// Backend wording that means the task no longer exists on its side.
///
/// This is a soft contract on message text; a structured error code would be
/// preferable if the backend ever provides one.
const TASK_UNKNOWN_PHRASES: &[&str] = &[
    "task not found",
    "任务不存在",
    "找不到对应的任务",
    "找不到对应的后端任务",
];

/// Result of a single publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    /// Node identity not resolved yet; the event was discarded.
    Dropped,
    /// Transport error or non-success status; the event was discarded.
    Failed,
    /// The backend no longer knows this task.
    TaskUnknown,
}

#[derive(Debug, Serialize)]
struct Submission<'a> {
    task_id: &'a str,
    node_id: u64,
    node_ip: &'a str,
    #[serde(flatten)]
    location: Location,
    result: &'a MeasurementEvent,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Ships measurement events to the backend, tagged with the node identity.
#[derive(Clone)]
pub struct BackendPublisher {
    client: reqwest::Client,
    result_url: String,
    identity: Arc<NodeIdentityCache>,
}

impl BackendPublisher {
    pub fn new(backend_url: &str, identity: Arc<NodeIdentityCache>) -> Result<Self, BackendError> {
        Ok(Self {
            client: build_client()?,
            result_url: format!("{}{}", backend_url.trim_end_matches('/'), RESULT_PATH),
            identity,
        })
    }

    /// Submit one event. Never retries; failures are logged and reported
    /// through the returned outcome only.
    pub async fn publish_event(&self, task_id: &str, event: &MeasurementEvent) -> PublishOutcome {
        let identity = self.identity.get();
        if !identity.is_resolved() {
            tracing::warn!(task_id, "Node identity not resolved yet, dropping result");
            return PublishOutcome::Dropped;
        }

        let submission = Submission {
            task_id,
            node_id: identity.node_id,
            node_ip: &identity.node_ip,
            location: identity.location(),
            result: event,
        };

        let response = match self.client.post(&self.result_url).json(&submission).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(task_id, url = %self.result_url, "Failed to push result: {}", e);
                return PublishOutcome::Failed;
            }
        };

        let status = response.status();
        if status.is_success() {
            tracing::debug!(task_id, "Result pushed");
            return PublishOutcome::Delivered;
        }

        let body = response.text().await.unwrap_or_default();
        if is_task_unknown(&body) {
            tracing::warn!(task_id, response = %body, "Backend does not know this task");
            return PublishOutcome::TaskUnknown;
        }

        tracing::warn!(
            task_id,
            status = status.as_u16(),
            response = %body,
            "Backend rejected result"
        );
        PublishOutcome::Failed
    }
}

/// Whether a backend error body says the task does not exist.
pub fn is_task_unknown(body: &str) -> bool {
    fn matches(text: &str) -> bool {
        let text = text.to_lowercase();
        TASK_UNKNOWN_PHRASES.iter().any(|phrase| text.contains(phrase))
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        let structured = [parsed.msg, parsed.message, parsed.error];
        if structured.iter().flatten().any(|text| matches(text)) {
            return true;
        }
    }

    matches(body)
}
