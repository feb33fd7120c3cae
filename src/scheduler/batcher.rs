//! Per-task result batching between the probe loop and the backend.

use crate::backend::{BackendPublisher, PublishOutcome};
use crate::probe::MeasurementEvent;

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Queue length that triggers an immediate flush.
pub const BATCH_MAX_SIZE: usize = 10;
/// Longest time an event waits in the queue before a flush.
pub const BATCH_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Ordered queue of events waiting for delivery, with its flush deadline.
#[derive(Debug)]
pub struct PushBuffer {
    task_id: String,
    events: Vec<MeasurementEvent>,
    deadline: Option<Instant>,
}

impl PushBuffer {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            events: Vec::with_capacity(BATCH_MAX_SIZE),
            deadline: None,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// When the queued events must be flushed, if anything is queued.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Queue an event. Returns true when the batch is full and must be
    /// flushed now; otherwise arms the flush deadline if it is not armed.
    pub fn push(&mut self, event: MeasurementEvent, now: Instant) -> bool {
        self.events.push(event);
        if self.events.len() >= BATCH_MAX_SIZE {
            return true;
        }
        if self.deadline.is_none() {
            self.deadline = Some(now + BATCH_FLUSH_INTERVAL);
        }
        false
    }

    /// Take every queued event, leaving the buffer empty and disarmed.
    pub fn take(&mut self) -> Vec<MeasurementEvent> {
        self.deadline = None;
        std::mem::replace(&mut self.events, Vec::with_capacity(BATCH_MAX_SIZE))
    }
}

/// Owns one task's [`PushBuffer`] and delivers its contents through the
/// publisher.
///
/// Events arrive over the task's channel. A flush happens when the batch is
/// full, when the deadline passes, or when the channel closes at teardown.
pub struct ResultBatcher {
    buffer: PushBuffer,
    publisher: BackendPublisher,
    cancel_tx: mpsc::UnboundedSender<String>,
    cancelled: bool,
}

impl ResultBatcher {
    pub fn new(
        task_id: &str,
        publisher: BackendPublisher,
        cancel_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            buffer: PushBuffer::new(task_id),
            publisher,
            cancel_tx,
            cancelled: false,
        }
    }

    pub async fn add_event(&mut self, event: MeasurementEvent) {
        if self.buffer.push(event, Instant::now()) {
            self.flush().await;
        }
    }

    /// Deliver everything queued, one event per request, in queue order.
    ///
    /// Returns the number of events the backend accepted. After the backend
    /// reports the task as unknown, the rest of the batch and all later
    /// events are discarded.
    pub async fn flush(&mut self) -> usize {
        if self.buffer.is_empty() {
            return 0;
        }
        let events = self.buffer.take();

        let task_id = self.buffer.task_id().to_string();
        let total = events.len();
        let mut delivered = 0;

        for (i, event) in events.iter().enumerate() {
            if self.cancelled {
                tracing::debug!(task_id = %task_id, discarded = total - i, "Task cancelled by backend, discarding results");
                break;
            }

            match self.publisher.publish_event(&task_id, event).await {
                PublishOutcome::Delivered => delivered += 1,
                PublishOutcome::Dropped | PublishOutcome::Failed => {}
                PublishOutcome::TaskUnknown => {
                    self.cancelled = true;
                    if self.cancel_tx.send(task_id.clone()).is_err() {
                        tracing::debug!(task_id = %task_id, "Registry gone, cancellation not forwarded");
                    }
                }
            }
        }

        delivered
    }

    /// Consume the task's event channel until it closes, then flush what is
    /// left.
    pub async fn run(mut self, mut rx: mpsc::Receiver<MeasurementEvent>) {
        loop {
            let deadline = self.buffer.deadline();
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.add_event(event).await,
                    None => {
                        self.flush().await;
                        break;
                    }
                },
                _ = sleep_until(deadline), if deadline.is_some() => {
                    self.flush().await;
                }
            }
        }

        tracing::debug!(task_id = %self.buffer.task_id(), "Result batcher finished");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
