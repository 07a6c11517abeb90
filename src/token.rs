//! CBS token plumbing.
//!
//! Application links may only be attached after a valid token for their
//! audience has been pushed over the claims-based-security node. The traits
//! here abstract the provider and the `$cbs` channel; [`TokenManager`]
//! drives the periodic refresh from the reactor task.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use fe2o3_amqp_types::definitions;
use futures_util::{Stream, StreamExt};
use pin_project_lite::pin_project;
use time::OffsetDateTime;
use tokio_stream::wrappers::IntervalStream;

/// A claims-based-security token scoped to one audience.
#[derive(Debug, Clone)]
pub struct CbsToken {
    audience: String,
    token_value: String,
    token_type: String,
    expires_at_utc: Option<OffsetDateTime>,
}

impl CbsToken {
    /// Construct a new token.
    pub fn new(
        audience: impl Into<String>,
        token_value: impl Into<String>,
        token_type: impl Into<String>,
        expires_at_utc: impl Into<Option<OffsetDateTime>>,
    ) -> Self {
        Self {
            audience: audience.into(),
            token_value: token_value.into(),
            token_type: token_type.into(),
            expires_at_utc: expires_at_utc.into(),
        }
    }

    /// Audience the token was issued for.
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Raw token value.
    pub fn token_value(&self) -> &str {
        &self.token_value
    }

    /// Token type, e.g. `servicebus.windows.net:sastoken`.
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Expiry reported by the provider, if any.
    pub fn expires_at_utc(&self) -> &Option<OffsetDateTime> {
        &self.expires_at_utc
    }
}

/// Issues CBS tokens for an audience.
pub trait TokenProvider: Send + Sync {
    /// Get a token for `audience` valid for at least `validity`.
    fn get_token(
        &self,
        audience: &str,
        validity: Duration,
    ) -> Result<CbsToken, definitions::Error>;
}

/// The `$cbs` node used to push tokens to the peer before application links
/// are attached.
#[async_trait]
pub trait CbsChannel: Send + Sync {
    /// Send `token` for `audience` and wait for the peer's outcome.
    async fn send_token(&self, token: CbsToken, audience: &str) -> Result<(), definitions::Error>;
}

pin_project! {
    /// A wrapper over an `Option<IntervalStream>` that never ticks once the
    /// refresh has been cancelled.
    #[derive(Debug)]
    struct RefreshInterval {
        #[pin]
        interval: Option<IntervalStream>,
    }
}

impl RefreshInterval {
    fn never() -> Self {
        Self { interval: None }
    }

    fn new(period: Duration) -> Self {
        // The first refresh is due one period from now; the open procedure
        // has already sent a fresh token.
        let start = tokio::time::Instant::now() + period;
        let interval = tokio::time::interval_at(start, period);
        Self {
            interval: Some(IntervalStream::new(interval)),
        }
    }
}

impl Stream for RefreshInterval {
    type Item = tokio::time::Instant;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.interval.as_pin_mut() {
            Some(stream) => stream.poll_next(cx),
            None => Poll::Pending,
        }
    }
}

/// Periodic token refresh for one receiver, armed at construction.
#[derive(Debug)]
pub(crate) struct TokenManager {
    interval: RefreshInterval,
}

impl TokenManager {
    pub fn new(period: Duration) -> Self {
        Self {
            interval: RefreshInterval::new(period),
        }
    }

    /// Resolves once per refresh period; pends forever after
    /// [`cancel`](Self::cancel).
    pub async fn tick(&mut self) {
        self.interval.next().await;
    }

    /// Stop refreshing. Idempotent.
    pub fn cancel(&mut self) {
        self.interval = RefreshInterval::never();
    }
}
