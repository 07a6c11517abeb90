#![deny(missing_docs)]

//! An AMQP 1.0 event-hub message receiver core.
//!
//! This crate implements the part of an event-hub client that sits between
//! an event-driven AMQP reactor and application callers asking for batches
//! of messages:
//!
//! * **Prefetch**: deliveries are decoded, settled and buffered ahead of
//!   caller demand, with link credit replenished in batches as messages are
//!   handed out.
//! * **Pull-based receive**: [`Receiver::receive`] enqueues a request with
//!   its own deadline and batch size; requests are matched against the
//!   prefetch buffer strictly in call order. A timeout completes the call
//!   with `Ok(None)` rather than an error.
//! * **Link lifecycle**: attach, detach, error recovery and recreate are
//!   driven by a state machine on a dedicated reactor task, consulting a
//!   [`RetryPolicy`](retry::RetryPolicy) on failures and refreshing CBS
//!   tokens in the background.
//!
//! The AMQP engine itself (connection, session, link primitives and
//! delivery framing) is consumed through the traits in [`endpoint`] and
//! [`factory`]; this crate never parses a frame or touches a socket.
//!
//! # Threading
//!
//! A single task owns all link state. Caller-facing methods may be invoked
//! from any thread; they communicate with that task exclusively through
//! channels, and the futures they return are completed from it. The AMQP
//! engine reports endpoint changes through a [`LinkEndpointHandler`], which
//! is likewise just a channel into the same task.

pub mod constants;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod reactor;
pub mod receiver;
pub mod retry;
pub mod settings;
pub mod token;

mod timer;

pub use endpoint::ReceivedMessage;
pub use error::Error;
pub use reactor::LinkEndpointHandler;
pub use receiver::{ErrorContext, OpenRetryHook, Receiver, ReceiverConfig};
