//! Receive link lifecycle state.

/// Lifecycle of the receive link owned by the reactor task.
///
/// Transitions happen only on the reactor task. The only way out of
/// `Errored` other than `Closed` is a scheduled recreate back through
/// `Creating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkState {
    /// No link has been created yet
    Uninitialized,
    /// The open procedure is running (token, session, attach)
    Creating,
    /// The peer acknowledged the attach
    Open,
    /// The link failed; a recreate may be scheduled
    Errored,
    /// A local detach has been issued
    Closing,
    /// Terminal
    Closed,
}
