//! Deadline bookkeeping and cancellation-safe one-shot scheduling.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Tracks the time remaining until a fixed deadline.
///
/// The deadline is captured at construction and never moves afterwards.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeoutTracker {
    deadline: Instant,
}

impl TimeoutTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }

    /// Time left until the deadline, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Delivers items onto a channel after a delay.
#[derive(Debug)]
pub(crate) struct Timer<T> {
    tx: UnboundedSender<T>,
}

impl<T> Clone for Timer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> Timer<T> {
    pub fn new(tx: UnboundedSender<T>) -> Self {
        Self { tx }
    }

    /// Deliver `item` after `delay`. Cancelling (or dropping) the returned
    /// handle before the delay elapses suppresses the delivery entirely.
    pub fn schedule(&self, delay: Duration, item: T) -> TimerHandle {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(item);
        });
        TimerHandle { task }
    }
}

/// Handle to a scheduled delivery.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
