//! Connection-scoped facilities consumed by every receiver.

use std::time::Duration;

use async_trait::async_trait;
use fe2o3_amqp_types::definitions;

use crate::endpoint::AmqpSession;
use crate::retry::RetryPolicy;
use crate::token::{CbsChannel, TokenProvider};

/// The messaging factory behind a receiver: session acquisition,
/// authentication, retry policy and the connection-error registry.
///
/// The factory outlives its receivers; receivers hold it behind an `Arc`
/// and never own it.
#[async_trait]
pub trait MessagingFactory: Send + Sync {
    /// Default timeout applied to the open and close handshakes.
    fn operation_timeout(&self) -> Duration;

    /// Host name of the namespace this factory is connected to.
    fn host_name(&self) -> &str;

    /// Identifier keying the retry-count bookkeeping.
    fn client_id(&self) -> &str;

    /// Policy consulted on link failures.
    fn retry_policy(&self) -> &dyn RetryPolicy;

    /// Provider of CBS tokens.
    fn token_provider(&self) -> &dyn TokenProvider;

    /// Channel used to push CBS tokens to the peer.
    fn cbs_channel(&self) -> &dyn CbsChannel;

    /// Open (or reuse) a session suitable for attaching a link to `path`.
    async fn get_session(&self, path: &str) -> Result<Box<dyn AmqpSession>, definitions::Error>;

    /// Route connection-level errors to the link named `link_name`.
    fn register_for_connection_error(&self, link_name: &str);

    /// Stop routing connection-level errors to `link_name`.
    fn deregister_for_connection_error(&self, link_name: &str);
}
