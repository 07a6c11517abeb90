//! Credit accumulation and batched flow top-ups.

use std::cmp;

use crate::constants::MAX_FLOW_BATCH;

/// Accumulates credit owed to the peer and batches it into `flow` frames to
/// keep the wire chatter low.
///
/// Mutated only on the reactor task. The accumulator is signed: a prefetch
/// decrease accrues a negative adjustment that suppresses future top-ups
/// without ever retracting credit already granted.
#[derive(Debug, Default)]
pub(crate) struct CreditController {
    next_credit_to_flow: i32,
}

impl CreditController {
    /// Drop any accumulated credit. Used when a fresh link renegotiates its
    /// credit from scratch.
    pub fn reset(&mut self) {
        self.next_credit_to_flow = 0;
    }

    /// Add a signed credit adjustment.
    pub fn accrue(&mut self, credits: i32) {
        self.next_credit_to_flow += credits;
    }

    /// Amount to issue in a single `flow`, once the accumulator has reached
    /// `min(prefetch, MAX_FLOW_BATCH)`.
    pub fn take_flush(&mut self, prefetch: u32) -> Option<u32> {
        let threshold = cmp::min(prefetch, MAX_FLOW_BATCH) as i32;
        if threshold > 0 && self.next_credit_to_flow >= threshold {
            let credits = self.next_credit_to_flow as u32;
            self.next_credit_to_flow = 0;
            Some(credits)
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> i32 {
        self.next_credit_to_flow
    }
}
