//! Per-receiver link settings negotiated at attach time.

use fe2o3_amqp_types::definitions::Fields;
use fe2o3_amqp_types::messaging::FilterSet;
use fe2o3_amqp_types::primitives::Symbol;

use crate::endpoint::ReceivedMessage;

/// Supplies the source filter, link properties and desired capabilities
/// used whenever a receiver link is attached.
///
/// The provider is consulted again on every recreate, so a filter keyed off
/// `last_received` lets a replacement link resume from the last message the
/// caller actually saw.
pub trait ReceiverSettingsProvider: Send + Sync {
    /// Source filter for the next attach.
    fn filter(&self, last_received: Option<&ReceivedMessage>) -> Option<FilterSet>;

    /// Link properties sent with the attach.
    fn properties(&self) -> Option<Fields>;

    /// Desired capabilities sent with the attach.
    fn desired_capabilities(&self) -> Option<Vec<Symbol>>;
}
