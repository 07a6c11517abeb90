//! Bridges caller threads and the AMQP engine onto the reactor task.
//!
//! A single task owns all link state. Callers submit [`WorkOrder`]s through
//! a [`ReactorHandle`]; the engine reports endpoint changes through a
//! [`LinkEndpointHandler`]. Both directions are plain channel sends, so
//! neither side ever blocks on the reactor.

use std::fmt;
use std::time::Duration;

use fe2o3_amqp_types::definitions;
use tokio::sync::mpsc::UnboundedSender;

use crate::endpoint::{AmqpDelivery, AmqpSession};
use crate::receiver::pending::PendingReceive;
use crate::timer::{Timer, TimerHandle};

/// Loop control for the reactor task.
#[derive(Debug)]
pub(crate) enum Running {
    Continue,
    Stop,
}

/// Work submitted to the reactor task.
pub(crate) enum WorkOrder {
    /// Enqueue a pending receive and run the matcher
    Receive(PendingReceive),
    /// Start the open procedure
    CreateLink,
    /// Apply a signed credit adjustment
    FlowDelta(i32),
    /// Begin a graceful close
    Close,
    /// Re-enter the open procedure if the link is down
    Recreate,
    /// The operation timer fired
    OperationTimedOut,
    /// The open timer fired
    OpenTimedOut,
    /// The close timer fired
    CloseTimedOut,
    /// Session acquisition completed
    SessionOpened(Box<dyn AmqpSession>),
}

/// Endpoint changes reported by the link engine.
pub(crate) enum LinkEvent {
    OpenComplete(Option<definitions::Error>),
    ReceiveComplete(Box<dyn AmqpDelivery>),
    Error(Option<definitions::Error>),
    Close(Option<definitions::Error>),
}

/// Handle given to the AMQP engine to report link endpoint changes.
///
/// All callbacks are non-blocking channel sends; events submitted after the
/// receiver has shut down are silently dropped.
#[derive(Clone)]
pub struct LinkEndpointHandler {
    tx: UnboundedSender<LinkEvent>,
}

impl LinkEndpointHandler {
    pub(crate) fn new(tx: UnboundedSender<LinkEvent>) -> Self {
        Self { tx }
    }

    /// The attach handshake finished; `error` is `None` on success.
    pub fn on_open_complete(&self, error: Option<definitions::Error>) {
        let _ = self.tx.send(LinkEvent::OpenComplete(error));
    }

    /// A delivery arrived and is ready to be read and settled.
    pub fn on_receive_complete(&self, delivery: Box<dyn AmqpDelivery>) {
        let _ = self.tx.send(LinkEvent::ReceiveComplete(delivery));
    }

    /// The link failed; `error` is `None` when the cause is unknown.
    pub fn on_error(&self, error: Option<definitions::Error>) {
        let _ = self.tx.send(LinkEvent::Error(error));
    }

    /// The peer detached the link; `condition` carries the detach error, if
    /// any.
    pub fn on_close(&self, condition: Option<definitions::Error>) {
        let _ = self.tx.send(LinkEvent::Close(condition));
    }
}

impl fmt::Debug for LinkEndpointHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEndpointHandler").finish()
    }
}

/// Submits work orders to the reactor task.
pub(crate) struct ReactorHandle {
    tx: UnboundedSender<WorkOrder>,
    timer: Timer<WorkOrder>,
}

impl Clone for ReactorHandle {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            timer: self.timer.clone(),
        }
    }
}

impl ReactorHandle {
    pub fn new(tx: UnboundedSender<WorkOrder>) -> Self {
        let timer = Timer::new(tx.clone());
        Self { tx, timer }
    }

    /// Run `order` on the reactor task. Returns the order when the reactor
    /// has shut down and no longer accepts work.
    pub fn dispatch(&self, order: WorkOrder) -> Result<(), WorkOrder> {
        self.tx.send(order).map_err(|rejected| rejected.0)
    }

    /// Run `order` on the reactor task after `delay`. Dropping the handle
    /// cancels the delivery.
    pub fn dispatch_after(&self, delay: Duration, order: WorkOrder) -> TimerHandle {
        self.timer.schedule(delay, order)
    }
}
