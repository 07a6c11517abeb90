//! Shared constants and tunables.

use std::time::Duration;

/// Property key under which the peer reports a tracking id in its remote
/// link properties. Surfaced in [`ErrorContext`](crate::ErrorContext) for
/// diagnostics.
pub const TRACKING_ID_PROPERTY: &str = "com.microsoft:tracking-id";

/// A pending receive whose remaining time is at or below this slop is
/// treated as expired by the operation timer.
pub(crate) const MIN_TIMEOUT_DURATION: Duration = Duration::from_millis(20);

/// Ceiling on the credit accumulator before a `flow` frame is forced out
/// regardless of the prefetch count.
pub(crate) const MAX_FLOW_BATCH: u32 = 100;

/// Validity requested for every CBS token.
pub(crate) const TOKEN_VALIDITY: Duration = Duration::from_secs(20 * 60);

/// Interval between proactive CBS token refreshes.
pub(crate) const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);
