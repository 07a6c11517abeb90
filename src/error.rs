//! Errors surfaced through the receiver's public API.

use fe2o3_amqp_types::definitions::{self, AmqpError, ErrorCondition, LinkError};

/// Error returned by [`Receiver`](crate::Receiver) operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// `max_batch` was zero or exceeded the prefetch count
    #[error(
        "'max_batch' should be a positive number and should be no greater than the prefetch count ({})",
        .prefetch
    )]
    InvalidMaxBatch {
        /// Prefetch count at the time of the call
        prefetch: u32,
    },

    /// The prefetch count must be a positive number
    #[error("prefetch count should be a positive number")]
    InvalidPrefetch,

    /// The receive timeout must be a positive duration
    #[error("receive timeout should be a positive duration")]
    InvalidReceiveTimeout,

    /// The receiver has been closed or is closing
    #[error("receiver is already closed")]
    ReceiverClosed,

    /// The peer did not acknowledge the link attach within the operation
    /// timeout
    #[error(
        "open operation on entity `{}` timed out, last known link error: {:?}",
        .path,
        .cause
    )]
    OpenTimeout {
        /// Entity path the link was attaching to
        path: String,
        /// Last link error observed before the timeout, if any
        cause: Option<definitions::Error>,
    },

    /// The peer did not acknowledge the link detach within the operation
    /// timeout
    #[error("close operation on link `{}` timed out", .link)]
    CloseTimeout {
        /// Name of the link being detached
        link: String,
    },

    /// The link failed with a non-transient protocol error
    #[error("link error: {:?}", .0)]
    Link(definitions::Error),

    /// The reactor loop has shut down and no longer accepts work
    #[error("the reactor scheduler has been shut down")]
    Rejected,
}

/// Whether an operation failing with `error` is worth retrying.
///
/// Connection and session level conditions always are: the transport below
/// the link may come back. Link and AMQP conditions are retryable only for
/// the subset that signals a server-side hiccup rather than a caller
/// mistake.
pub(crate) fn is_transient(error: &definitions::Error) -> bool {
    match &error.condition {
        ErrorCondition::AmqpError(condition) => matches!(
            condition,
            AmqpError::InternalError | AmqpError::ResourceLimitExceeded | AmqpError::ResourceLocked
        ),
        ErrorCondition::ConnectionError(_) => true,
        ErrorCondition::SessionError(_) => true,
        ErrorCondition::LinkError(condition) => matches!(
            condition,
            LinkError::DetachForced | LinkError::TransferLimitExceeded
        ),
        ErrorCondition::Custom(condition) => matches!(
            condition.0.as_str(),
            "com.microsoft:server-busy"
                | "com.microsoft:timeout"
                | "com.microsoft:operation-cancelled"
        ),
        #[allow(unreachable_patterns)]
        _ => false,
    }
}

/// Placeholder cause used when the link fails without reporting a condition.
pub(crate) fn unknown_transient_error() -> definitions::Error {
    definitions::Error::from(AmqpError::InternalError)
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::definitions::{ConnectionError, SessionError};
    use fe2o3_amqp_types::primitives::Symbol;

    use super::*;

    #[test]
    fn transport_level_conditions_are_transient() {
        let forced = definitions::Error::from(ConnectionError::ConnectionForced);
        assert!(is_transient(&forced));

        let window = definitions::Error::from(SessionError::WindowViolation);
        assert!(is_transient(&window));

        let detached = definitions::Error::from(LinkError::DetachForced);
        assert!(is_transient(&detached));
    }

    #[test]
    fn caller_mistakes_are_not_transient() {
        let unauthorized = definitions::Error::from(AmqpError::UnauthorizedAccess);
        assert!(!is_transient(&unauthorized));

        let stolen = definitions::Error::from(LinkError::Stolen);
        assert!(!is_transient(&stolen));
    }

    #[test]
    fn custom_conditions_match_known_service_hiccups() {
        let busy = definitions::Error::from(ErrorCondition::Custom(Symbol::from(
            "com.microsoft:server-busy",
        )));
        assert!(is_transient(&busy));

        let disabled = definitions::Error::from(ErrorCondition::Custom(Symbol::from(
            "com.microsoft:entity-disabled",
        )));
        assert!(!is_transient(&disabled));
    }

    #[test]
    fn unknown_cause_counts_as_transient() {
        assert!(is_transient(&unknown_transient_error()));
    }
}
