//! Trait abstraction of the AMQP primitives the receiver consumes.
//!
//! The connection, session and link engines live behind these traits. The
//! receiver core never touches a socket or parses a frame; it only drives
//! attach, credit, settlement and detach through the handles below, and the
//! engine reports endpoint changes back through a
//! [`LinkEndpointHandler`](crate::reactor::LinkEndpointHandler).

use fe2o3_amqp_types::definitions::{self, Fields, ReceiverSettleMode, SenderSettleMode};
use fe2o3_amqp_types::messaging::{Body, FilterSet, Message};
use fe2o3_amqp_types::primitives::{Symbol, Value};

use crate::reactor::LinkEndpointHandler;

/// Message shape handed to callers of
/// [`Receiver::receive`](crate::Receiver::receive).
pub type ReceivedMessage = Message<Body<Value>>;

/// Local or remote state of a link endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// The endpoint has not been opened yet
    Uninitialized,
    /// The endpoint is open
    Active,
    /// The endpoint has been closed
    Closed,
}

/// Attach arguments for a new receiver link.
#[derive(Debug, Clone)]
pub struct ReceiverAttach {
    /// Link name
    pub name: String,
    /// Source address (the entity path)
    pub address: String,
    /// Source filter, e.g. an offset selector on a replacement link
    pub filter: Option<FilterSet>,
    /// Link properties sent with the attach
    pub properties: Option<Fields>,
    /// Desired capabilities sent with the attach
    pub desired_capabilities: Option<Vec<Symbol>>,
    /// Settle mode requested from the sending peer
    pub snd_settle_mode: SenderSettleMode,
    /// Settle mode of the receiving side
    pub rcv_settle_mode: ReceiverSettleMode,
}

/// A session on which receiver links can be opened.
pub trait AmqpSession: Send {
    /// Construct a receiver link and initiate the attach handshake.
    ///
    /// Returns as soon as the attach has been sent; completion of the
    /// handshake is reported through `handler`.
    fn open_receiver(
        &mut self,
        attach: ReceiverAttach,
        handler: LinkEndpointHandler,
    ) -> Result<Box<dyn AmqpReceiverLink>, definitions::Error>;

    /// End the session locally.
    fn close(&mut self);
}

/// An attached (or attaching) receiver link.
pub trait AmqpReceiverLink: Send {
    /// Name the link was attached with.
    fn name(&self) -> &str;

    /// Grant `credits` more link credit to the peer in a `flow` frame.
    fn flow(&mut self, credits: u32);

    /// Link credit currently extended to the peer.
    fn credit(&self) -> u32;

    /// Read the payload of the delivery currently being handled into `buf`,
    /// returning the number of bytes written.
    fn recv(&mut self, buf: &mut [u8]) -> usize;

    /// Local endpoint state.
    fn local_state(&self) -> EndpointState;

    /// Remote endpoint state.
    fn remote_state(&self) -> EndpointState;

    /// Properties reported by the peer on attach.
    fn remote_properties(&self) -> Option<Fields>;

    /// Initiate a local detach.
    fn close(&mut self);
}

/// A single transfer awaiting settlement.
pub trait AmqpDelivery: Send {
    /// Number of payload bytes available to read.
    fn pending(&self) -> usize;

    /// Settle the delivery. With the second settle mode this sends the
    /// disposition and marks the transfer settled locally.
    fn settle(&mut self);
}
