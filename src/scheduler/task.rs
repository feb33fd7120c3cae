//! Probe task state machine and measurement loop.

use crate::probe::{run_tcping_probe, MeasurementEvent, PingProbe, TcpTarget, CONNECT_TIMEOUT};
use crate::signal::{StopSignal, StopToken};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::TaskError;

/// Probe kinds a continuous task can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Ping,
    Tcping,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Ping => "ping",
            TaskKind::Tcping => "tcping",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ping" => Ok(TaskKind::Ping),
            "tcping" => Ok(TaskKind::Tcping),
            other => Err(TaskError::Validation(format!(
                "unsupported task type: {:?}",
                other
            ))),
        }
    }
}

/// Lifecycle of a task. Stopped and Expired are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Created,
    Running,
    Stopped,
    Expired,
}

impl TaskPhase {
    fn is_terminal(&self) -> bool {
        matches!(self, TaskPhase::Stopped | TaskPhase::Expired)
    }
}

/// Shared view of one task, held by the registry and the task's loop.
#[derive(Debug)]
pub struct TaskState {
    pub id: String,
    pub kind: TaskKind,
    pub target: String,
    pub interval: Duration,
    pub max_duration: Duration,
    pub created_at: DateTime<Utc>,
    last_poll_at: Mutex<DateTime<Utc>>,
    phase: Mutex<TaskPhase>,
    stop: StopSignal,
}

impl TaskState {
    pub fn new(
        id: String,
        kind: TaskKind,
        target: String,
        interval: Duration,
        max_duration: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            target,
            interval,
            max_duration,
            created_at: now,
            last_poll_at: Mutex::new(now),
            phase: Mutex::new(TaskPhase::Created),
            stop: StopSignal::new(),
        }
    }

    pub fn phase(&self) -> TaskPhase {
        *self.phase.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        !self.phase().is_terminal()
    }

    pub fn last_poll_at(&self) -> DateTime<Utc> {
        *self.last_poll_at.lock().unwrap()
    }

    /// Record a status poll; this is the idle-timeout clock.
    pub fn touch(&self, now: DateTime<Utc>) {
        *self.last_poll_at.lock().unwrap() = now;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        exceeds(now - self.created_at, self.max_duration)
    }

    /// Lifetime left before the task reaches its maximum duration.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match (now - self.created_at).to_std() {
            Ok(elapsed) => self.max_duration.saturating_sub(elapsed),
            Err(_) => self.max_duration,
        }
    }

    pub fn is_idle(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        exceeds(now - self.last_poll_at(), idle_timeout)
    }

    /// Move forward in the lifecycle. Returns false if the move is not
    /// allowed, which includes leaving a terminal phase.
    fn transition(&self, to: TaskPhase) -> bool {
        let mut phase = self.phase.lock().unwrap();
        let allowed = match (*phase, to) {
            (TaskPhase::Created, TaskPhase::Running) => true,
            (from, TaskPhase::Stopped | TaskPhase::Expired) => !from.is_terminal(),
            _ => false,
        };
        if allowed {
            *phase = to;
        }
        allowed
    }

    /// Halt the task. Returns true for the call that actually stopped it.
    pub fn stop(&self) -> bool {
        let changed = self.transition(TaskPhase::Stopped);
        self.stop.stop();
        changed
    }

    /// Mark the task as having outlived its maximum duration.
    pub fn expire(&self) -> bool {
        let changed = self.transition(TaskPhase::Expired);
        self.stop.stop();
        changed
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.token()
    }
}

fn exceeds(elapsed: chrono::Duration, limit: Duration) -> bool {
    elapsed.to_std().map(|elapsed| elapsed > limit).unwrap_or(false)
}

enum Probe {
    Ping(PingProbe),
    Tcping(TcpTarget),
}

/// One repeating measurement loop against one target.
pub struct ProbeTask {
    state: Arc<TaskState>,
    probe: Probe,
    events: mpsc::Sender<MeasurementEvent>,
}

impl ProbeTask {
    pub fn ping(
        state: Arc<TaskState>,
        probe: PingProbe,
        events: mpsc::Sender<MeasurementEvent>,
    ) -> Self {
        Self {
            state,
            probe: Probe::Ping(probe),
            events,
        }
    }

    pub fn tcping(
        state: Arc<TaskState>,
        target: TcpTarget,
        events: mpsc::Sender<MeasurementEvent>,
    ) -> Self {
        Self {
            state,
            probe: Probe::Tcping(target),
            events,
        }
    }

    /// Run until stopped or expired. Dropping the event sender on return
    /// lets the task's batcher flush and exit.
    pub async fn run(mut self) {
        let mut stop = self.state.stop_token();
        if !self.state.transition(TaskPhase::Running) {
            return;
        }
        tracing::info!(
            task_id = %self.state.id,
            kind = %self.state.kind,
            target = %self.state.target,
            "Continuous task started"
        );

        let state = &self.state;
        let events = &self.events;

        loop {
            if stop.is_stopped() {
                break;
            }
            if state.remaining(Utc::now()).is_zero() {
                if state.expire() {
                    tracing::info!(task_id = %state.id, "Task reached its maximum duration");
                }
                break;
            }

            match &mut self.probe {
                Probe::Ping(ping) => {
                    let mut burst_stop = stop.clone();
                    ping.run_burst(burst_stop.stopped(), |event| forward(state, events, event))
                        .await;
                }
                Probe::Tcping(target) => {
                    let event = run_tcping_probe(target, CONNECT_TIMEOUT).await;
                    forward(state, events, event);
                }
            }

            // Never sleep past the end of the task's lifetime
            let pause = state.interval.min(state.remaining(Utc::now()));
            tokio::select! {
                _ = stop.stopped() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!(task_id = %state.id, phase = ?state.phase(), "Continuous task finished");
    }
}

/// Hand an event to the batcher without blocking the probe loop.
fn forward(state: &TaskState, events: &mpsc::Sender<MeasurementEvent>, event: MeasurementEvent) {
    if !state.is_running() {
        return;
    }
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(task_id = %state.id, "Result queue full, dropping measurement");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!(task_id = %state.id, "Result queue closed, dropping measurement");
        }
    }
}
