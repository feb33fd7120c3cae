//! One-shot stop signal shared between an owner and its background loops.

use tokio::sync::watch;

/// Owner side of a stop signal. Stopping is idempotent.
#[derive(Debug)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Raise the signal. Returns true only for the call that raised it.
    pub fn stop(&self) -> bool {
        self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a [`StopSignal`].
#[derive(Debug, Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal is raised or its owner is gone.
    pub async fn stopped(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
