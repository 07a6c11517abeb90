//! Retry policy consulted on link failures.

use std::time::Duration;

use fe2o3_amqp_types::definitions;

/// Decides whether and when a failed link is recreated.
///
/// Retry counts are keyed by client id so that a policy instance can be
/// shared by every link of a connection.
pub trait RetryPolicy: Send + Sync {
    /// Next retry delay, or `None` when the error is permanent or
    /// `remaining_time` leaves no room for another attempt.
    ///
    /// `remaining_time` is the time left on the deadline of the operation
    /// that would benefit from the retry; a policy should never return a
    /// delay that outlives it.
    fn next_retry_interval(
        &self,
        client_id: &str,
        error: &definitions::Error,
        remaining_time: Duration,
    ) -> Option<Duration>;

    /// Record a retry attempt for `client_id`.
    fn increment_retry_count(&self, client_id: &str);

    /// Clear the retry count for `client_id` after a successful operation.
    fn reset_retry_count(&self, client_id: &str);
}
