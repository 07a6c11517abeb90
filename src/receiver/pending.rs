//! Outstanding receive requests.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::endpoint::ReceivedMessage;
use crate::error::Error;
use crate::timer::TimeoutTracker;

/// Completion payload of a single `receive` call. `Ok(None)` means the
/// request timed out without any messages arriving.
pub(crate) type ReceiveResult = Result<Option<Vec<ReceivedMessage>>, Error>;

/// One caller waiting for a batch of messages.
///
/// The deadline and batch size are fixed at enqueue time.
pub(crate) struct PendingReceive {
    work: oneshot::Sender<ReceiveResult>,
    tracker: TimeoutTracker,
    max_batch: u32,
}

impl PendingReceive {
    pub fn new(work: oneshot::Sender<ReceiveResult>, tracker: TimeoutTracker, max_batch: u32) -> Self {
        Self {
            work,
            tracker,
            max_batch,
        }
    }

    pub fn max_batch(&self) -> u32 {
        self.max_batch
    }

    pub fn remaining(&self) -> Duration {
        self.tracker.remaining()
    }

    /// Whether the caller has given up on the result.
    pub fn is_abandoned(&self) -> bool {
        self.work.is_closed()
    }

    /// Complete the request exactly once. A request whose caller went away
    /// absorbs the result silently.
    pub fn complete(self, result: ReceiveResult) {
        let _ = self.work.send(result);
    }
}

/// FIFO of outstanding receive requests.
///
/// Callers enqueue through the reactor's work channel, so the queue itself
/// is only ever touched by the reactor task; requests are matched strictly
/// in enqueue order.
#[derive(Default)]
pub(crate) struct PendingQueue {
    items: VecDeque<PendingReceive>,
}

impl PendingQueue {
    pub fn push_back(&mut self, item: PendingReceive) {
        self.items.push_back(item);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn pop_front(&mut self) -> Option<PendingReceive> {
        self.items.pop_front()
    }

    /// Remaining time of the request at the head of the queue.
    pub fn head_remaining(&self) -> Option<Duration> {
        self.items.front().map(|item| item.remaining())
    }

    /// Pop the first request whose caller is still waiting, discarding
    /// abandoned ones along the way.
    pub fn pop_live(&mut self) -> Option<PendingReceive> {
        while let Some(item) = self.items.pop_front() {
            if !item.is_abandoned() {
                return Some(item);
            }
        }
        None
    }

    /// Remove and yield every queued request in enqueue order.
    pub fn drain(&mut self) -> impl Iterator<Item = PendingReceive> + '_ {
        self.items.drain(..)
    }
}
