//! Node registration and periodic heartbeat.

use crate::db::NodeIdentity;
use crate::node::NodeIdentityCache;
use crate::signal::StopToken;

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{build_client, BackendError};

pub const HEARTBEAT_PATH: &str = "/api/node/heartbeat";

/// Form body identifying this agent's role to the backend.
const HEARTBEAT_BODY: &str = "type=pingServer";

#[derive(Debug, Default, Deserialize)]
struct HeartbeatReply {
    #[serde(default)]
    node_id: u64,
    #[serde(default)]
    node_ip: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    province: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    isp: String,
}

impl From<HeartbeatReply> for NodeIdentity {
    fn from(reply: HeartbeatReply) -> Self {
        Self {
            node_id: reply.node_id,
            node_ip: reply.node_ip,
            country: reply.country,
            province: reply.province,
            city: reply.city,
            isp: reply.isp,
        }
    }
}

/// Registers the node with the backend and keeps its identity fresh.
pub struct HeartbeatReporter {
    client: reqwest::Client,
    url: String,
    identity: Arc<NodeIdentityCache>,
    interval: Duration,
}

impl HeartbeatReporter {
    pub fn new(
        backend_url: &str,
        identity: Arc<NodeIdentityCache>,
        interval: Duration,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            client: build_client()?,
            url: format!("{}{}", backend_url.trim_end_matches('/'), HEARTBEAT_PATH),
            identity,
            interval,
        })
    }

    /// Send one heartbeat. Returns `None` when the reply carries no identity
    /// (legacy plain-text acknowledgement).
    async fn exchange(&self) -> Result<Option<NodeIdentity>, BackendError> {
        let response = self
            .client
            .post(&self.url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(HEARTBEAT_BODY)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16(), body));
        }

        match serde_json::from_str::<HeartbeatReply>(&body) {
            Ok(reply) => Ok(Some(reply.into())),
            Err(_) => {
                tracing::debug!("Heartbeat reply is not JSON, ignoring: {:?}", body);
                Ok(None)
            }
        }
    }

    fn apply(&self, update: &NodeIdentity) -> bool {
        match self.identity.apply(update) {
            Ok(changed) => changed,
            Err(e) => {
                tracing::warn!("Node identity updated but not persisted: {}", e);
                true
            }
        }
    }

    /// Resolve the node identity, registering with the backend if it is not
    /// known yet.
    pub async fn resolve(&self) -> Result<NodeIdentity, BackendError> {
        if self.identity.is_resolved() {
            return Ok(self.identity.get());
        }

        if let Some(update) = self.exchange().await? {
            self.apply(&update);
        }

        let identity = self.identity.get();
        if identity.is_resolved() {
            tracing::info!(
                node_id = identity.node_id,
                node_ip = %identity.node_ip,
                "Node registered with backend"
            );
            Ok(identity)
        } else {
            Err(BackendError::Decode(
                "heartbeat reply did not assign a node identity".to_string(),
            ))
        }
    }

    /// Send a heartbeat and fold any identity change into the cache.
    ///
    /// Returns true when the cached identity changed.
    pub async fn refresh(&self) -> Result<bool, BackendError> {
        let Some(update) = self.exchange().await? else {
            return Ok(false);
        };

        let changed = self.apply(&update);
        if changed {
            let identity = self.identity.get();
            tracing::info!(
                node_id = identity.node_id,
                node_ip = %identity.node_ip,
                "Node identity refreshed"
            );
        }
        Ok(changed)
    }

    /// Start the heartbeat loop. The first heartbeat is sent one interval
    /// from now; call [`resolve`](Self::resolve) first for the initial exchange.
    pub fn start(self: Arc<Self>, mut stop: StopToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut interval = tokio::time::interval_at(start, self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop.stopped() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.refresh().await {
                            tracing::warn!("Heartbeat failed: {}", e);
                        }
                    }
                }
            }

            tracing::info!("Heartbeat reporter stopped");
        })
    }
}
