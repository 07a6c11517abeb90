//! FIFO of settled messages awaiting caller demand.

use std::collections::VecDeque;

use crate::endpoint::ReceivedMessage;

/// Messages decoded and settled ahead of caller demand.
///
/// Filled and drained only on the reactor task. Arrival order is preserved
/// all the way to the caller's batch.
#[derive(Debug, Default)]
pub(crate) struct PrefetchBuffer {
    messages: VecDeque<ReceivedMessage>,
}

impl PrefetchBuffer {
    pub fn push(&mut self, message: ReceivedMessage) {
        self.messages.push_back(message);
    }

    pub fn pop(&mut self) -> Option<ReceivedMessage> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
