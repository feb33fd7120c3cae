//! Scheduler module: the registry of continuous probe tasks.

mod batcher;
mod task;

pub use batcher::*;
pub use task::*;

use crate::backend::{BackendPublisher, BACKEND_TIMEOUT};
use crate::probe::{validate_ping_target, EchoRunner, PingProbe, TcpTarget};
use crate::signal::StopSignal;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;

/// Probe interval when the request does not specify one.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
/// Task lifetime when the request does not specify one.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(60 * 60);
/// Tasks whose status has not been polled for this long are removed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Cadence of the expiry/idle sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Events buffered between a probe loop and its batcher.
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// How long shutdown waits for tasks to deliver their remaining results.
pub const SHUTDOWN_FLUSH_TIMEOUT: Duration = BACKEND_TIMEOUT;

/// Registry error types.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{0}")]
    Validation(String),
    #[error("task not found: {0}")]
    NotFound(String),
}

/// Parameters for a new continuous task. `None` or zero durations fall back
/// to the defaults.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub kind: TaskKind,
    pub target: String,
    pub interval: Option<Duration>,
    pub max_duration: Option<Duration>,
}

/// Snapshot returned by [`TaskRegistry::status`].
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub task_id: String,
    pub running: bool,
    pub created_at: DateTime<Utc>,
    pub last_poll_at: DateTime<Utc>,
}

/// Why the sweep removed a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SweepReason {
    Expired,
    Idle,
}

/// Owns every running task and tears tasks down on request, on expiry, on
/// idleness, or when the backend cancels them.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<TaskState>>>,
    publisher: BackendPublisher,
    echo_runner: Arc<dyn EchoRunner>,
    cancel_tx: mpsc::UnboundedSender<String>,
    shutdown: StopSignal,
    /// Probe loops and batchers, joined on shutdown.
    workers: Mutex<JoinSet<()>>,
}

impl TaskRegistry {
    /// Create the registry and start listening for backend cancellations.
    pub fn new(publisher: BackendPublisher, echo_runner: Arc<dyn EchoRunner>) -> Arc<Self> {
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            tasks: RwLock::new(HashMap::new()),
            publisher,
            echo_runner,
            cancel_tx,
            shutdown: StopSignal::new(),
            workers: Mutex::new(JoinSet::new()),
        });

        tokio::spawn(run_cancellation_listener(Arc::downgrade(&registry), cancel_rx));
        registry
    }

    /// Start the periodic expiry/idle sweep.
    pub fn start(self: &Arc<Self>) {
        let registry = Arc::downgrade(self);
        let mut stop = self.shutdown.token();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + SWEEP_INTERVAL;
            let mut interval = tokio::time::interval_at(start, SWEEP_INTERVAL);

            loop {
                tokio::select! {
                    _ = stop.stopped() => break,
                    _ = interval.tick() => {
                        let Some(registry) = registry.upgrade() else { break };
                        registry.sweep().await;
                    }
                }
            }
        });
    }

    /// Validate the request, register the task and start its loop.
    pub async fn create_task(&self, request: TaskRequest) -> Result<String, TaskError> {
        let target = request.target.trim().to_string();
        let tcp_target = match request.kind {
            TaskKind::Ping => {
                validate_ping_target(&target).map_err(|e| TaskError::Validation(e.to_string()))?;
                None
            }
            TaskKind::Tcping => Some(
                TcpTarget::parse(&target).map_err(|e| TaskError::Validation(e.to_string()))?,
            ),
        };

        let interval = non_zero_or(request.interval, DEFAULT_INTERVAL);
        let max_duration = non_zero_or(request.max_duration, DEFAULT_MAX_DURATION);

        let mut tasks = self.tasks.write().await;
        if self.shutdown.is_stopped() {
            return Err(TaskError::Validation("agent is shutting down".to_string()));
        }

        let mut task_id = generate_task_id();
        while tasks.contains_key(&task_id) {
            task_id = generate_task_id();
        }

        let state = Arc::new(TaskState::new(
            task_id.clone(),
            request.kind,
            target.clone(),
            interval,
            max_duration,
        ));

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let probe_task = match tcp_target {
            Some(tcp_target) => ProbeTask::tcping(state.clone(), tcp_target, tx),
            None => ProbeTask::ping(
                state.clone(),
                PingProbe::new(&target, self.echo_runner.clone()),
                tx,
            ),
        };
        let batcher = ResultBatcher::new(&task_id, self.publisher.clone(), self.cancel_tx.clone());

        tasks.insert(task_id.clone(), state);
        {
            let mut workers = self.workers.lock().unwrap();
            while workers.try_join_next().is_some() {}
            workers.spawn(batcher.run(rx));
            workers.spawn(probe_task.run());
        }
        drop(tasks);

        tracing::info!(
            task_id = %task_id,
            kind = %request.kind,
            target = %target,
            interval_secs = interval.as_secs_f64(),
            max_duration_secs = max_duration.as_secs(),
            "Continuous task created"
        );
        Ok(task_id)
    }

    /// Stop a task and remove it from the registry.
    pub async fn stop_task(&self, task_id: &str) -> Result<(), TaskError> {
        let removed = self.tasks.write().await.remove(task_id);
        match removed {
            Some(state) => {
                state.stop();
                tracing::info!(task_id, "Continuous task stopped");
                Ok(())
            }
            None => Err(TaskError::NotFound(task_id.to_string())),
        }
    }

    /// Report a task's status and record the poll as a liveness signal.
    pub async fn status(&self, task_id: &str) -> Result<TaskStatus, TaskError> {
        let tasks = self.tasks.read().await;
        let state = tasks
            .get(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;

        state.touch(Utc::now());
        Ok(TaskStatus {
            task_id: state.id.clone(),
            running: state.is_running(),
            created_at: state.created_at,
            last_poll_at: state.last_poll_at(),
        })
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Remove every expired or idle task.
    pub async fn sweep(&self) -> Vec<(String, SweepReason)> {
        self.sweep_at(Utc::now()).await
    }

    async fn sweep_at(&self, now: DateTime<Utc>) -> Vec<(String, SweepReason)> {
        let mut removed = Vec::new();
        let mut tasks = self.tasks.write().await;

        tasks.retain(|task_id, state| {
            let reason = if state.is_expired(now) {
                SweepReason::Expired
            } else if state.is_idle(now, IDLE_TIMEOUT) {
                SweepReason::Idle
            } else {
                return true;
            };

            match reason {
                SweepReason::Expired => {
                    state.expire();
                    tracing::info!(task_id = %task_id, "Task reached its maximum duration, removed");
                }
                SweepReason::Idle => {
                    state.stop();
                    tracing::info!(task_id = %task_id, "Task not polled for {:?}, removed", IDLE_TIMEOUT);
                }
            }
            removed.push((task_id.clone(), reason));
            false
        });

        removed
    }

    /// Tear down a task the backend no longer knows about.
    async fn cancel_from_backend(&self, task_id: &str) {
        let removed = self.tasks.write().await.remove(task_id);
        match removed {
            Some(state) => {
                state.stop();
                tracing::info!(task_id, "Task cancelled by backend");
            }
            None => tracing::debug!(task_id, "Cancelled task already gone"),
        }
    }

    /// Stop every task and the sweep, then wait up to
    /// [`SHUTDOWN_FLUSH_TIMEOUT`] for the batchers to deliver what is still
    /// queued. New tasks are refused afterwards.
    pub async fn shutdown(&self) {
        self.shutdown.stop();
        {
            let mut tasks = self.tasks.write().await;
            tracing::info!("Stopping {} continuous tasks", tasks.len());
            for (_, state) in tasks.drain() {
                state.stop();
            }
        }

        let mut workers = std::mem::take(&mut *self.workers.lock().unwrap());
        let drained = tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        match drained {
            Ok(()) => tracing::info!("All continuous tasks stopped"),
            Err(_) => tracing::warn!(
                "Gave up waiting for {} task workers after {:?}",
                workers.len(),
                SHUTDOWN_FLUSH_TIMEOUT
            ),
        }
    }
}

async fn run_cancellation_listener(
    registry: Weak<TaskRegistry>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(task_id) = rx.recv().await {
        let Some(registry) = registry.upgrade() else { break };
        registry.cancel_from_backend(&task_id).await;
    }
}

fn non_zero_or(value: Option<Duration>, default: Duration) -> Duration {
    value.filter(|d| !d.is_zero()).unwrap_or(default)
}

fn generate_task_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("task_{}_{:04x}", nanos, rand::random::<u16>())
}
